//! Per-lane statistics.
//!
//! This module provides thread-safe counters for each lane, allowing monitoring of task intake,
//! completion, failure, and shutdown losses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for one lane.
/// All counters use atomic operations for thread safety.
#[derive(Default)]
pub struct LaneStats {
    /// Number of tasks enqueued on the lane's shard.
    pub submitted: AtomicU64,

    /// Number of tasks that ran to completion without error.
    pub processed: AtomicU64,

    /// Number of tasks that returned an error or panicked.
    pub failed: AtomicU64,

    /// Number of tasks currently running (0 or 1).
    pub active: AtomicU64,

    /// Number of queued tasks dropped at shutdown.
    pub abandoned: AtomicU64,
}

impl LaneStats {
    /// Creates a new instance with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [LaneStats].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaneSnapshot {
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    pub active: u64,
    pub abandoned: u64,
}

impl LaneSnapshot {
    /// Tasks that left the queue, successfully or not.
    pub fn completed(&self) -> u64 {
        self.processed + self.failed
    }
}

impl fmt::Display for LaneSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "submitted: {}, processed: {}, failed: {}, abandoned: {}",
            self.submitted, self.processed, self.failed, self.abandoned
        )
    }
}
