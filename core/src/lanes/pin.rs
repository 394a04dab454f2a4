use super::ShardIndex;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Core assigned to `lane`, cycling through `cores`.
pub(crate) fn core_for_lane(cores: &[u32], lane: ShardIndex) -> Option<u32> {
    if cores.is_empty() {
        return None;
    }
    Some(cores[lane % cores.len()])
}

/// Pins the calling lane thread to `core`. On failure the lane runs unpinned.
pub(crate) fn pin_lane(lane: ShardIndex, core: u32) {
    let mut cpu_set = CpuSet::new();
    let pinned = cpu_set
        .set(core as usize)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set));
    match pinned {
        Ok(()) => log::debug!("Pinned lane {} to core {}", lane, core),
        Err(e) => log::warn!("Failed to pin lane {} to core {}: {}", lane, core, e),
    }
}
