//! Worker lanes.
//!
//! This module splits channel work across a fixed number of lanes. Each lane is one thread bound
//! to one [shard](Shard) (an unbounded FIFO task queue) for its whole lifetime, so tasks on the
//! same shard run strictly in submission order while different shards run in parallel. A failing
//! task is isolated to its own lane: the lane closes the task's session, pauses briefly, and keeps
//! going.

mod assign;
mod pin;
mod shard;
mod stats;
mod worker;

pub use assign::{assigner_for, ChannelHashAssigner, RandomAssigner, ShardAssigner};
pub use shard::{DispatchError, ShardIndex};
pub use stats::{LaneSnapshot, LaneStats};
pub use worker::SpawnError;

pub(crate) use shard::Shard;
pub(crate) use worker::{LaneSpawner, StopTrigger};
