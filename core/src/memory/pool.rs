//! Bounded pool of reusable I/O buffers.

use super::buffer::Buffer;
use crate::config::BufferPoolConfig;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// A pool of fixed-size [Buffer]s shared by all lanes.
///
/// The pool owns idle buffers and lends each one to exactly one borrower at a time. It grows on
/// demand up to `max_size` managed buffers; surplus idle buffers (beyond `core_size`) are
/// reclaimed once they have been idle for the keep-alive interval. A lent buffer returns to the
/// pool when it is dropped.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

/// Pool state reachable from lent buffers.
pub(crate) struct PoolShared {
    id: u64,
    core_size: usize,
    max_size: usize,
    keep_alive: Duration,
    buffer_size: usize,
    state: Mutex<PoolState>,
    created: AtomicU64,
    reclaimed: AtomicU64,
}

/// Idle set bookkeeping. Returned buffers are pushed to the back and borrowed from the back, so
/// the front always holds the buffers that have been idle the longest.
struct PoolState {
    idle: VecDeque<IdleBuffer>,
    /// Buffers managed by the pool, idle and lent.
    total: usize,
    closed: bool,
}

struct IdleBuffer {
    data: Box<[u8]>,
    since: Instant,
}

impl BufferPool {
    /// Creates an empty pool. Call [prewarm](BufferPool::prewarm) to allocate the core buffers.
    pub fn new(config: &BufferPoolConfig) -> Self {
        BufferPool {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                core_size: config.core_size,
                max_size: config.max_size,
                keep_alive: Duration::from_millis(config.keep_alive_ms),
                buffer_size: config.buffer_size,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.core_size),
                    total: 0,
                    closed: false,
                }),
                created: AtomicU64::new(0),
                reclaimed: AtomicU64::new(0),
            }),
        }
    }

    /// Eagerly creates buffers until the pool manages `core_size` of them. Returns the number of
    /// buffers created.
    pub fn prewarm(&self) -> Result<usize, PoolError> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let missing = shared.core_size.saturating_sub(state.total);
        let now = Instant::now();
        for _ in 0..missing {
            state.idle.push_back(IdleBuffer {
                data: shared.allocate(),
                since: now,
            });
        }
        state.total += missing;
        shared.created.fetch_add(missing as u64, Ordering::Relaxed);
        log::debug!("Pre-warmed buffer pool {} with {} buffers", shared.id, missing);
        Ok(missing)
    }

    /// Lends an idle buffer, or creates a new one if none is idle and the pool is below
    /// `max_size`.
    pub fn borrow(&self) -> Result<Buffer, PoolError> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        shared.reclaim_locked(&mut state, Instant::now());
        if let Some(idle) = state.idle.pop_back() {
            return Ok(Buffer::from_pool(idle.data, Arc::downgrade(shared)));
        }
        if state.total >= shared.max_size {
            return Err(PoolError::Exhausted {
                max: shared.max_size,
            });
        }
        // Reserve the slot, then allocate outside the lock.
        state.total += 1;
        drop(state);
        shared.created.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::from_pool(shared.allocate(), Arc::downgrade(shared)))
    }

    /// Returns a lent buffer to the idle set, where it can be lent again immediately.
    ///
    /// Equivalent to dropping the buffer. Buffers returned after [close](BufferPool::close) are
    /// freed.
    pub fn release(&self, buffer: Buffer) {
        if !buffer.belongs_to(&self.shared) {
            log::warn!(
                "Buffer released to pool {} belongs to another pool",
                self.shared.id
            );
        }
        drop(buffer);
    }

    /// Drops surplus idle buffers whose keep-alive has elapsed. Returns the number reclaimed.
    pub fn reclaim_idle(&self) -> usize {
        let mut state = self.shared.lock();
        self.shared.reclaim_locked(&mut state, Instant::now())
    }

    /// How long a surplus buffer may stay idle.
    pub fn keep_alive(&self) -> Duration {
        self.shared.keep_alive
    }

    /// Closes the pool and frees every idle buffer. Lent buffers are freed when they are dropped.
    /// Subsequent borrows fail with [PoolError::Closed].
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let freed = state.idle.len();
        state.idle.clear();
        state.total = 0;
        log::info!(
            "Closed buffer pool {} ({} idle buffers freed).",
            self.shared.id,
            freed
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.lock();
        let idle = state.idle.len();
        PoolStats {
            created: shared.created.load(Ordering::Relaxed),
            reclaimed: shared.reclaimed.load(Ordering::Relaxed),
            idle,
            lent: state.total - idle,
        }
    }
}

impl PoolShared {
    fn allocate(&self) -> Box<[u8]> {
        vec![0; self.buffer_size].into_boxed_slice()
    }

    /// Takes back the storage of a dropped buffer.
    pub(crate) fn give_back(&self, data: Box<[u8]>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let now = Instant::now();
        state.idle.push_back(IdleBuffer { data, since: now });
        self.reclaim_locked(&mut state, now);
    }

    fn reclaim_locked(&self, state: &mut PoolState, now: Instant) -> usize {
        let mut reclaimed = 0;
        while state.total > self.core_size {
            let expired = state.idle.front().map_or(false, |oldest| {
                now.saturating_duration_since(oldest.since) >= self.keep_alive
            });
            if !expired {
                break;
            }
            state.idle.pop_front();
            state.total -= 1;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            self.reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            log::debug!("Reclaimed {} idle buffers from pool {}", reclaimed, self.id);
        }
        reclaimed
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state holds only counters and owned storage, both consistent between statements.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.shared;
        f.debug_struct("BufferPool")
            .field("id", &shared.id)
            .field("core_size", &shared.core_size)
            .field("max_size", &shared.max_size)
            .field("keep_alive", &shared.keep_alive)
            .field("buffer_size", &shared.buffer_size)
            .finish()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated over the pool lifetime.
    pub created: u64,
    /// Surplus buffers dropped after their keep-alive elapsed.
    pub reclaimed: u64,
    /// Buffers currently idle in the pool.
    pub idle: usize,
    /// Buffers currently lent out.
    pub lent: usize,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer pool is closed")]
    Closed,

    #[error("Buffer pool exhausted: {max} buffers in use")]
    Exhausted { max: usize },
}
