// src/runtime/deferred.rs

use std::time::Duration;

/// Keeps retired entries alive for a grace period before dropping them.
///
/// Entries count down by the `delta` passed to [`tick`](Self::tick), so expiry
/// follows the owner's frame clock rather than wall time.
#[derive(Debug)]
pub struct DeferredDestroyList<T> {
  entries: Vec<(T, Duration)>,
}

impl<T> DeferredDestroyList<T> {
  pub fn new() -> Self {
    Self { entries: Vec::new() }
  }

  pub fn push(&mut self, entry: T, grace: Duration) {
    self.entries.push((entry, grace));
  }

  /// Advances every countdown by `delta` and drops the entries that reached zero.
  /// Returns how many were dropped.
  pub fn tick(&mut self, delta: Duration) -> usize {
    let before = self.entries.len();
    self.entries.retain_mut(|(_, remaining)| {
      *remaining = remaining.saturating_sub(delta);
      !remaining.is_zero()
    });
    before - self.entries.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.entries.iter().map(|(entry, _)| entry)
  }

  /// Drops everything immediately.
  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

impl<T> Default for DeferredDestroyList<T> {
  fn default() -> Self {
    Self::new()
  }
}
