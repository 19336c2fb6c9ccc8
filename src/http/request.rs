// src/http/request.rs

use crate::runtime::ThreadedWork;

use std::fmt;
use std::time::Duration;

/// Where a request is in its life.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestStatus {
  #[default]
  NotStarted,
  Processing,
  /// Cancelled by the caller. Not a failure.
  Cancelled,
  Failed(String),
  Succeeded,
}

impl RequestStatus {
  pub fn is_finished(&self) -> bool {
    matches!(
      self,
      RequestStatus::Cancelled | RequestStatus::Failed(_) | RequestStatus::Succeeded
    )
  }

  pub fn is_success(&self) -> bool {
    matches!(self, RequestStatus::Succeeded)
  }
}

impl fmt::Display for RequestStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RequestStatus::NotStarted => f.write_str("not started"),
      RequestStatus::Processing => f.write_str("processing"),
      RequestStatus::Cancelled => f.write_str("cancelled"),
      RequestStatus::Failed(reason) => write!(f, "failed: {}", reason),
      RequestStatus::Succeeded => f.write_str("succeeded"),
    }
  }
}

/// A unit of work an [`HttpManager`](super::HttpManager) can run.
///
/// The [`ThreadedWork`] half runs on the transport thread; the methods below
/// run on the thread that ticks the manager.
pub trait ThreadedRequest: ThreadedWork {
  /// Per-frame progress on the owning thread, e.g. progress callbacks.
  fn tick(&self, delta: Duration);

  /// Flags the request as cancelled. Returns false if it already was.
  fn mark_cancelled(&self) -> bool;

  fn is_cancelled(&self) -> bool;

  /// Runs the completion callback. Only the first call has any effect.
  fn finish_request(&self);

  /// Drops every callback so completion no longer calls into user code.
  fn unbind_callbacks(&self);

  fn status(&self) -> RequestStatus;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancelled_is_finished_but_not_success() {
    assert!(RequestStatus::Cancelled.is_finished());
    assert!(!RequestStatus::Cancelled.is_success());
    assert!(!RequestStatus::Processing.is_finished());
    assert_eq!(RequestStatus::Failed("x".into()).to_string(), "failed: x");
  }
}
