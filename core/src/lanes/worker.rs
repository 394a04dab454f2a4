use super::{pin, Shard, ShardIndex};
use crate::adaptor::ChannelAdaptor;
use crate::memory::BufferPool;
use crate::task::{ChannelSession, Task, TaskContext};

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use crossbeam::channel::{bounded, Receiver, Select, Sender};
use crossbeam::sync::WaitGroup;
use thiserror::Error;

/// Dispatcher side of the lane stop signal.
///
/// Halting sets a flag that lanes check between tasks and drops the wake sender, which
/// disconnects the wake channel every lane selects on. Blocked lanes and lanes pausing after a
/// failure return immediately; a lane in the middle of a task finishes it first.
pub(crate) struct StopTrigger {
    halted: Arc<AtomicBool>,
    wake: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl StopTrigger {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(0);
        StopTrigger {
            halted: Arc::new(AtomicBool::new(false)),
            wake: Mutex::new(Some(tx)),
            wake_rx: rx,
        }
    }

    fn signal(&self) -> StopSignal {
        StopSignal {
            halted: Arc::clone(&self.halted),
            wake: self.wake_rx.clone(),
        }
    }

    /// Tells every lane to exit without taking another task.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Lane side of the stop signal. The wake channel never carries messages, it only disconnects.
#[derive(Clone)]
struct StopSignal {
    halted: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl StopSignal {
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Sleeps for `pause`, or less if the lane is halted meanwhile.
    fn pause(&self, pause: Duration) {
        let _ = self.wake.recv_timeout(pause);
    }
}

/// The loop bound to one shard.
struct Worker {
    shard: Arc<Shard>,
    pool: Arc<BufferPool>,
    adaptor: Arc<dyn ChannelAdaptor>,
    stop: StopSignal,
    failure_pause: Duration,
}

impl Worker {
    /// Runs tasks from the shard one at a time until halted or until the shard is closed and
    /// empty.
    fn run(&self) {
        let lane = self.shard.index();
        let tasks = self.shard.receiver();

        let mut select = Select::new();
        let task_op = select.recv(tasks);
        select.recv(&self.stop.wake);

        while !self.stop.is_halted() {
            let oper = select.select();
            if oper.index() == task_op {
                match oper.recv(tasks) {
                    Ok(task) => self.execute(task),
                    Err(_) => {
                        log::debug!("Lane {} drained its shard", lane);
                        break;
                    }
                }
            } else {
                let _ = oper.recv(&self.stop.wake);
                break;
            }
        }
        log::info!("Lane {} stopped.", lane);
    }

    fn execute(&self, task: Task) {
        let stats = self.shard.stats();
        let session = Arc::clone(task.session());
        let ctx = TaskContext::new(self.shard.index(), &self.pool, self.adaptor.as_ref());

        stats.active.fetch_add(1, Ordering::Relaxed);
        match catch_panic(|| task.run(&ctx)) {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                stats.active.fetch_sub(1, Ordering::Relaxed);
            }
            Err(error) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                stats.active.fetch_sub(1, Ordering::Relaxed);
                self.isolate_failure(&session, error);
            }
        }
    }

    /// Reports the failure, closes the session, and throttles the lane. Errors and panics from the
    /// close itself are only logged.
    fn isolate_failure(&self, session: &Arc<dyn ChannelSession>, error: anyhow::Error) {
        let lane = self.shard.index();
        log::error!(
            "An error occurred running a task on lane {} for session {}: {:?}",
            lane,
            session.id(),
            error
        );
        let closed = catch_panic(|| session.close().map_err(anyhow::Error::from)).and_then(|()| {
            catch_panic(|| {
                self.adaptor.on_close(session.as_ref());
                Ok(())
            })
        });
        if let Err(e) = closed {
            log::error!(
                "Failed to close session {} on lane {}: {:?}",
                session.id(),
                lane,
                e
            );
        }
        self.stop.pause(self.failure_pause);
    }
}

/// Runs `f`, turning a panic into an error.
fn catch_panic<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawns one named lane thread per shard.
pub(crate) struct LaneSpawner {
    name_prefix: String,
    cores: Option<Vec<u32>>,
    failure_pause: Duration,
}

impl LaneSpawner {
    pub(crate) fn new(name_prefix: impl Into<String>) -> Self {
        LaneSpawner {
            name_prefix: name_prefix.into(),
            cores: None,
            failure_pause: Duration::from_millis(100),
        }
    }

    /// Sets the CPU cores that lane threads will be pinned to.
    pub(crate) fn set_cores(mut self, cores: Option<Vec<u32>>) -> Self {
        self.cores = cores;
        self
    }

    /// Sets how long a lane pauses after a failed task.
    pub(crate) fn set_failure_pause(mut self, pause: Duration) -> Self {
        self.failure_pause = pause;
        self
    }

    /// Spawns a lane for every shard and waits until all of them are running.
    ///
    /// If a thread cannot be spawned, the lanes already running are halted and joined before the
    /// error is returned.
    pub(crate) fn run(
        self,
        shards: &[Arc<Shard>],
        pool: &Arc<BufferPool>,
        adaptor: &Arc<dyn ChannelAdaptor>,
        stop: &StopTrigger,
    ) -> Result<Vec<JoinHandle<()>>, SpawnError> {
        let ready = WaitGroup::new();
        let mut handles = Vec::with_capacity(shards.len());

        for shard in shards {
            let lane = shard.index();
            let worker = Worker {
                shard: Arc::clone(shard),
                pool: Arc::clone(pool),
                adaptor: Arc::clone(adaptor),
                stop: stop.signal(),
                failure_pause: self.failure_pause,
            };
            let core = self
                .cores
                .as_deref()
                .and_then(|cores| pin::core_for_lane(cores, lane));
            let ready_ref = ready.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name_prefix, lane))
                .spawn(move || {
                    if let Some(core) = core {
                        pin::pin_lane(lane, core);
                    }
                    // Signal that this lane is ready
                    drop(ready_ref);
                    worker.run();
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    stop.halt();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(SpawnError { lane, source });
                }
            }
        }

        ready.wait();
        log::info!("Launched {} lanes.", handles.len());
        Ok(handles)
    }
}

#[derive(Debug, Error)]
#[error("Failed to spawn lane {lane}")]
pub struct SpawnError {
    pub lane: ShardIndex,
    #[source]
    pub source: io::Error,
}
