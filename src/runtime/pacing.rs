// src/runtime/pacing.rs

use std::time::Duration;

use crate::config::ThreadPacing;

/// How long to sleep after an active pass that took `pass_time`.
pub fn active_sleep(pacing: &ThreadPacing, pass_time: Duration) -> Duration {
  pacing
    .active_frame_time
    .saturating_sub(pass_time)
    .max(pacing.active_min_sleep)
}

/// How long to sleep after an idle loop iteration that took `loop_time`.
pub fn idle_sleep(pacing: &ThreadPacing, loop_time: Duration) -> Duration {
  pacing
    .idle_frame_time
    .saturating_sub(loop_time)
    .max(pacing.idle_min_sleep)
}
