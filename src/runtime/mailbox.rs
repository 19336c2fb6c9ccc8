// src/runtime/mailbox.rs

//! Control channel between transport thread owners and the thread itself, based on `kanal`.

use std::time::Duration;

use kanal::ReceiveErrorTimeout;

/// Messages posted to a running transport thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadControl {
  /// New work was queued; cut the current sleep short.
  Wake,
  /// Leave the loop after the current pass.
  Stop,
}

/// The sending end of a transport thread's mailbox. Cloneable.
pub type MailboxSender = kanal::Sender<ThreadControl>;

/// The receiving end of a transport thread's mailbox.
pub type MailboxReceiver = kanal::Receiver<ThreadControl>;

/// Creates a new unbounded mailbox channel pair.
///
/// Unbounded so that posting a wake-up from a submitting thread never blocks.
pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
  kanal::unbounded()
}

/// Outcome of sleeping on the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SleepOutcome {
  /// The full duration elapsed or a wake-up arrived.
  Continue,
  /// A stop was requested or every sender is gone.
  Stop,
}

/// Sleeps up to `duration`, returning early when a control message arrives.
///
/// Pending messages are drained so a burst of wake-ups costs one early return.
pub(crate) fn sleep_on(rx: &MailboxReceiver, duration: Duration) -> SleepOutcome {
  let first = if duration.is_zero() {
    match rx.try_recv() {
      Ok(Some(msg)) => Some(msg),
      Ok(None) => None,
      Err(_) => return SleepOutcome::Stop,
    }
  } else {
    match rx.recv_timeout(duration) {
      Ok(msg) => Some(msg),
      Err(ReceiveErrorTimeout::Timeout) => None,
      Err(_) => return SleepOutcome::Stop,
    }
  };

  let mut stop = first == Some(ThreadControl::Stop);
  if first.is_some() {
    while let Ok(Some(msg)) = rx.try_recv() {
      stop |= msg == ThreadControl::Stop;
    }
  }

  if stop {
    SleepOutcome::Stop
  } else {
    SleepOutcome::Continue
  }
}
