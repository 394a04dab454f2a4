//! Channel-bound units of work.
//!
//! The I/O layer creates one [Task] per readable, writable, or processable event on a channel and
//! submits it to the [Dispatcher](crate::Dispatcher). A lane runs the task exactly once and then
//! drops it.

use crate::adaptor::ChannelAdaptor;
use crate::lanes::ShardIndex;
use crate::memory::{Buffer, BufferPool, PoolError};

use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;

/// Identifies one logical connection.
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical connection, owned by the I/O layer.
///
/// The dispatcher only ever closes a session, and only after one of its tasks failed.
pub trait ChannelSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Closes the underlying connection.
    fn close(&self) -> io::Result<()>;
}

type TaskBody = Box<dyn FnOnce(&TaskContext<'_>) -> Result<()> + Send>;

/// One unit of channel-bound work.
pub struct Task {
    shard: Option<ShardIndex>,
    session: Arc<dyn ChannelSession>,
    body: TaskBody,
}

impl Task {
    /// Creates an unassigned task. The dispatcher picks its shard on submission.
    pub fn new<F>(session: Arc<dyn ChannelSession>, body: F) -> Self
    where
        F: FnOnce(&TaskContext<'_>) -> Result<()> + Send + 'static,
    {
        Task {
            shard: None,
            session,
            body: Box::new(body),
        }
    }

    /// Pins the task to shard `index`.
    pub fn on_shard(mut self, index: ShardIndex) -> Self {
        self.shard = Some(index);
        self
    }

    /// The shard this task is assigned to, if any.
    pub fn shard(&self) -> Option<ShardIndex> {
        self.shard
    }

    pub(crate) fn assign(&mut self, index: ShardIndex) {
        self.shard = Some(index);
    }

    /// The session this task acts on behalf of.
    pub fn session(&self) -> &Arc<dyn ChannelSession> {
        &self.session
    }

    /// Consumes the task and runs its body.
    pub(crate) fn run(self, ctx: &TaskContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("shard", &self.shard)
            .field("session", &self.session.id())
            .finish()
    }
}

/// What a running task can reach: its lane, the shared buffer pool, and the channel adaptor.
pub struct TaskContext<'a> {
    lane: ShardIndex,
    pool: &'a BufferPool,
    adaptor: &'a dyn ChannelAdaptor,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        lane: ShardIndex,
        pool: &'a BufferPool,
        adaptor: &'a dyn ChannelAdaptor,
    ) -> Self {
        TaskContext {
            lane,
            pool,
            adaptor,
        }
    }

    /// Index of the lane running the task.
    pub fn lane(&self) -> ShardIndex {
        self.lane
    }

    pub fn adaptor(&self) -> &dyn ChannelAdaptor {
        self.adaptor
    }

    pub fn pool(&self) -> &BufferPool {
        self.pool
    }

    /// Borrows a buffer from the shared pool.
    pub fn borrow_buffer(&self) -> Result<Buffer, PoolError> {
        self.pool.borrow()
    }

    /// Returns a buffer to the shared pool.
    pub fn release_buffer(&self, buffer: Buffer) {
        self.pool.release(buffer)
    }
}
