//! Pooled I/O buffers.
//!
//! Channel read and write paths borrow fixed-size [Buffer]s from a shared [BufferPool] and return
//! them when done, so steady-state I/O does not allocate per operation.

pub mod buffer;
pub mod pool;
mod reaper;

pub use self::buffer::{Buffer, BufferError};
pub use self::pool::{BufferPool, PoolError, PoolStats};

pub(crate) use self::reaper::Reaper;
