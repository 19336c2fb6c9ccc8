// src/runtime/queue.rs

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

/// A lock-protected FIFO used as a hand-off point between threads.
///
/// Producers push under the lock; the consumer swaps the whole backlog out in
/// one short critical section (`drain`) and processes it without holding the lock.
pub struct LockedQueue<T> {
  items: Mutex<VecDeque<T>>,
}

impl<T> LockedQueue<T> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
    }
  }

  /// Appends an item and returns the queue length before the push.
  pub fn push(&self, item: T) -> usize {
    let mut items = self.items.lock();
    let previous_len = items.len();
    items.push_back(item);
    previous_len
  }

  pub fn extend<I: IntoIterator<Item = T>>(&self, iter: I) {
    self.items.lock().extend(iter);
  }

  /// Takes everything queued so far, preserving insertion order.
  pub fn drain(&self) -> Vec<T> {
    let taken = std::mem::take(&mut *self.items.lock());
    taken.into()
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  /// Runs `f` against the queued items while holding the lock.
  pub fn with_items<R>(&self, f: impl FnOnce(&VecDeque<T>) -> R) -> R {
    f(&self.items.lock())
  }
}

impl<T> Default for LockedQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> fmt::Debug for LockedQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockedQueue").field("len", &self.len()).finish()
  }
}
