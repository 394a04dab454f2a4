use super::LaneStats;
use crate::task::Task;

use std::sync::atomic::Ordering;
use std::sync::{PoisonError, RwLock};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

/// Position of a shard (and of its lane) in the dispatcher, `0..lanes`.
pub type ShardIndex = usize;

/// One lane's task queue.
///
/// The queue is unbounded, so pushing never blocks. Closing the shard drops the only sender: later
/// pushes fail with [DispatchError::Closed] and the lane sees a disconnect once the queue is empty.
pub(crate) struct Shard {
    index: ShardIndex,
    sender: RwLock<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    stats: LaneStats,
}

impl Shard {
    pub(crate) fn new(index: ShardIndex) -> Self {
        let (tx, rx) = unbounded();
        Shard {
            index,
            sender: RwLock::new(Some(tx)),
            receiver: rx,
            stats: LaneStats::new(),
        }
    }

    pub(crate) fn index(&self) -> ShardIndex {
        self.index
    }

    /// Enqueues `task` behind everything already queued on this shard.
    pub(crate) fn push(&self, task: Task) -> Result<(), DispatchError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(DispatchError::Closed)?;
        sender.send(task).map_err(|_| DispatchError::Closed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops intake. Returns `false` if the shard was already closed.
    pub(crate) fn close(&self) -> bool {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Task> {
        &self.receiver
    }

    /// Number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Drops every queued task. Returns how many were dropped.
    pub(crate) fn discard_queued(&self) -> usize {
        let dropped = self.receiver.try_iter().count();
        self.stats
            .abandoned
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub(crate) fn stats(&self) -> &LaneStats {
        &self.stats
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher has not been started")]
    NotStarted,

    #[error("Dispatcher is closed")]
    Closed,

    #[error("Shard index {index} out of range for {lanes} lanes")]
    ShardOutOfRange { index: ShardIndex, lanes: usize },
}
