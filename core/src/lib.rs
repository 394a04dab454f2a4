//! A sharded task dispatcher for connection-oriented network servers.
//!
//! The I/O layer turns readable, writable, and processable channel events into [Task]s and
//! submits them to a [Dispatcher]. The dispatcher routes each task to one of a fixed number of
//! lanes; every lane is a dedicated thread draining its own FIFO shard, so one channel's work
//! stays in order while different channels run in parallel. A task that fails (by returning an
//! error or panicking) only affects its own channel: the lane logs the failure, closes the
//! channel's session, pauses briefly, and moves on.
//!
//! The dispatcher also owns a pool of fixed-size [Buffer]s that channel read and write paths
//! borrow instead of allocating, and a single [ChannelAdaptor](adaptor::ChannelAdaptor) carrying
//! the protocol behavior, built once at startup from an [AdaptorRegistry](adaptor::AdaptorRegistry).
//!
//! ```rust
//! use lanes_core::adaptor::AdaptorRegistry;
//! use lanes_core::config::default_config;
//! use lanes_core::{ChannelSession, Dispatcher, SessionId, Task};
//! use std::io;
//! use std::sync::Arc;
//!
//! struct Conn(u64);
//!
//! impl ChannelSession for Conn {
//!     fn id(&self) -> SessionId {
//!         SessionId(self.0)
//!     }
//!
//!     fn close(&self) -> io::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new(default_config(), AdaptorRegistry::new());
//! dispatcher.start()?;
//!
//! let conn = Arc::new(Conn(1));
//! dispatcher.submit(Task::new(conn, |ctx| {
//!     let mut buf = ctx.borrow_buffer()?;
//!     buf.extend_from_slice(b"hello")?;
//!     ctx.adaptor().on_read(&Conn(1), &buf)?;
//!     ctx.release_buffer(buf);
//!     Ok(())
//! }))?;
//!
//! dispatcher.wait_for_completion();
//! dispatcher.stop()?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! See [config] for the configuration file format.

pub mod adaptor;
pub mod config;
pub mod lanes;
pub mod memory;
mod runtime;
mod task;

pub use self::lanes::{DispatchError, ShardIndex};
pub use self::memory::{Buffer, BufferPool, PoolError};
pub use self::runtime::{Dispatcher, ShutdownReport, StartError};
pub use self::task::{ChannelSession, SessionId, Task, TaskContext};
