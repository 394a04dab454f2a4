//! Task dispatcher.
//!
//! The dispatcher owns the shards and their lanes, the buffer pool, and the channel adaptor. The
//! I/O layer submits tasks to it from any number of threads; each task is routed to one shard and
//! run by that shard's lane.

mod lifecycle;

pub use self::lifecycle::{ShutdownReport, StartError};

use crate::adaptor::{AdaptorRegistry, ChannelAdaptor};
use crate::config::RuntimeConfig;
use crate::lanes::{
    assigner_for, DispatchError, LaneSnapshot, Shard, ShardAssigner, ShardIndex, StopTrigger,
};
use crate::memory::{Buffer, BufferPool, PoolError, PoolStats, Reaper};
use crate::task::Task;

use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

/// Routes channel tasks to a fixed set of lanes.
///
/// # Example
///
/// ```
/// use lanes_core::adaptor::AdaptorRegistry;
/// use lanes_core::config::default_config;
/// use lanes_core::Dispatcher;
///
/// let mut config = default_config();
/// config.lanes.count = 2;
/// let dispatcher = Dispatcher::new(config, AdaptorRegistry::new());
/// dispatcher.start()?;
/// // ... submit tasks from the I/O layer ...
/// let report = dispatcher.stop()?;
/// assert_eq!(report.abandoned, 0);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Dispatcher {
    config: RuntimeConfig,
    registry: AdaptorRegistry,
    assigner: Box<dyn ShardAssigner>,
    state: Mutex<Lifecycle>,
    running: OnceLock<Running>,
}

/// Everything built by `start`. Immutable afterwards except for the threads `stop` takes and
/// joins.
struct Running {
    pool: Arc<BufferPool>,
    shards: Vec<Arc<Shard>>,
    adaptor: Arc<dyn ChannelAdaptor>,
    stop: StopTrigger,
    handles: Mutex<Vec<JoinHandle<()>>>,
    reaper: Mutex<Option<Reaper>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl Dispatcher {
    /// Creates a dispatcher from the `config` settings. Adaptors named in the configuration are
    /// resolved from `registry` when the dispatcher starts.
    pub fn new(config: RuntimeConfig, registry: AdaptorRegistry) -> Self {
        let assigner = assigner_for(config.lanes.assignment);
        Dispatcher {
            config,
            registry,
            assigner,
            state: Mutex::new(Lifecycle::Created),
            running: OnceLock::new(),
        }
    }

    /// Replaces the configured shard assignment policy.
    pub fn with_assigner(mut self, assigner: Box<dyn ShardAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of lanes, which is also the number of shards.
    pub fn lanes(&self) -> usize {
        self.config.lanes.count
    }

    /// Selects a shard for `task`. A task that already carries a shard index keeps it.
    pub fn assign_shard(&self, task: &Task) -> ShardIndex {
        match task.shard() {
            Some(index) => index,
            None => self.assigner.assign(task, self.lanes().max(1)),
        }
    }

    /// Enqueues `task` on its shard, assigning one first if the task has none. Returns the shard
    /// index used.
    ///
    /// Never blocks. Fails with [DispatchError::NotStarted] before [start](Dispatcher::start) and
    /// with [DispatchError::Closed] once [stop](Dispatcher::stop) has begun.
    pub fn submit(&self, mut task: Task) -> Result<ShardIndex, DispatchError> {
        let running = self.running.get().ok_or(DispatchError::NotStarted)?;
        let index = self.assign_shard(&task);
        task.assign(index);
        let shard = running
            .shards
            .get(index)
            .ok_or(DispatchError::ShardOutOfRange {
                index,
                lanes: running.shards.len(),
            })?;
        shard.push(task)?;
        Ok(index)
    }

    /// Borrows a buffer from the shared pool for a channel read or write path.
    pub fn borrow_buffer(&self) -> Result<Buffer, PoolError> {
        match self.running.get() {
            Some(running) => running.pool.borrow(),
            None => Err(PoolError::Closed),
        }
    }

    /// Returns a buffer to the shared pool. Dropping the buffer has the same effect.
    pub fn release_buffer(&self, buffer: Buffer) {
        match self.running.get() {
            Some(running) => running.pool.release(buffer),
            None => drop(buffer),
        }
    }

    /// The adaptor bound at startup.
    pub fn adaptor(&self) -> Option<Arc<dyn ChannelAdaptor>> {
        self.running.get().map(|running| Arc::clone(&running.adaptor))
    }

    pub fn is_running(&self) -> bool {
        *self.lock_state() == Lifecycle::Running
    }

    /// Per-lane statistics, indexed by lane. Empty before start.
    pub fn stats(&self) -> Vec<LaneSnapshot> {
        self.running
            .get()
            .map(|running| {
                running
                    .shards
                    .iter()
                    .map(|shard| shard.stats().snapshot())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.running.get().map(|running| running.pool.stats())
    }

    /// Blocks until every submitted task has run (or been abandoned) and no lane is busy.
    pub fn wait_for_completion(&self) {
        let Some(running) = self.running.get() else {
            return;
        };
        loop {
            let idle = running.shards.iter().all(|shard| {
                let s = shard.stats().snapshot();
                shard.len() == 0 && s.active == 0 && s.completed() + s.abandoned >= s.submitted
            });
            if idle {
                break;
            }

            // Small sleep to avoid busy waiting
            sleep(Duration::from_millis(10));
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.is_running() {
            log::info!("Stopping dispatcher on drop.");
            if let Err(e) = self.stop() {
                log::error!("Failed to stop dispatcher: {}", e);
            }
        }
    }
}
