//! Shard assignment for tasks submitted without an explicit shard.

use super::ShardIndex;
use crate::config::AssignmentPolicy;
use crate::task::Task;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::Rng;

/// Picks a shard in `0..lanes` for a task.
pub trait ShardAssigner: Send + Sync {
    fn assign(&self, task: &Task, lanes: usize) -> ShardIndex;
}

/// Routes every task of a session to the same shard, preserving per-channel order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelHashAssigner;

impl ShardAssigner for ChannelHashAssigner {
    fn assign(&self, task: &Task, lanes: usize) -> ShardIndex {
        // DefaultHasher::new uses fixed keys, so the mapping is stable across processes.
        let mut hasher = DefaultHasher::new();
        task.session().id().hash(&mut hasher);
        (hasher.finish() % lanes as u64) as ShardIndex
    }
}

/// Uniform random shard per task. Tasks of one session may be reordered across lanes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomAssigner;

impl ShardAssigner for RandomAssigner {
    fn assign(&self, _task: &Task, lanes: usize) -> ShardIndex {
        // thread_rng is seeded once per thread from the OS.
        rand::thread_rng().gen_range(0..lanes)
    }
}

/// Returns the assigner for `policy`.
pub fn assigner_for(policy: AssignmentPolicy) -> Box<dyn ShardAssigner> {
    match policy {
        AssignmentPolicy::ChannelHash => Box::new(ChannelHashAssigner),
        AssignmentPolicy::Random => Box::new(RandomAssigner),
    }
}
