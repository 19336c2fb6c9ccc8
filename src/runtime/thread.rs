// src/runtime/thread.rs

//! The background transport thread shared by the HTTP and WebSocket managers.
//!
//! Work items are handed in from any thread through lock-protected queues and
//! serviced by exactly one processing pass at a time. A pass:
//!
//! 1. swaps out the pending and cancellation queues,
//! 2. completes cancelled items (pending or running) without further I/O,
//! 3. starts the newly submitted items, routing failures straight to completion,
//! 4. advances every running item by the elapsed time,
//! 5. moves finished items to the completed queue after finalizing them.
//!
//! The pass runs either on a dedicated thread ([`SchedulingMode::Threaded`])
//! or synchronously from the owner's tick ([`SchedulingMode::Cooperative`]).

use crate::config::{SchedulingMode, ThreadPacing};
use crate::error::TransportError;
use crate::runtime::mailbox::{self, MailboxReceiver, MailboxSender, SleepOutcome, ThreadControl};
use crate::runtime::pacing;
use crate::runtime::queue::LockedQueue;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Contract every unit of work driven by a [`TransportThread`] fulfils.
///
/// All methods run on whichever thread executes the processing pass, never
/// concurrently for the same item.
pub trait ThreadedWork: Send + Sync {
  /// Begins I/O. Returning `false` routes the item straight to completion.
  fn start_on_thread(&self) -> bool;

  /// Advances I/O. `elapsed` is the time since the previous pass.
  fn tick_on_thread(&self, elapsed: Duration);

  /// True once the item has nothing more to do on the thread.
  fn is_complete_on_thread(&self) -> bool;

  /// Runs exactly once, when the item moves to the completed queue.
  fn finish_on_thread(&self);

  /// Identifying text for diagnostics (verb + URL, or connection id + state).
  fn describe(&self) -> String;
}

/// Running set, owned by the processing pass.
struct PassState<W: ?Sized> {
  running: Vec<Arc<W>>,
  last_pass: Option<Instant>,
}

struct ThreadShared<W: ?Sized> {
  name: String,
  pending: LockedQueue<Arc<W>>,
  cancelled: LockedQueue<Arc<W>>,
  completed: LockedQueue<Arc<W>>,
  pass: Mutex<PassState<W>>,
  running_len: AtomicUsize,
  mailbox_tx: MailboxSender,
  mailbox_rx: MailboxReceiver,
}

/// Handle used to queue work and cancellations from any thread.
pub struct WorkSubmitter<W: ?Sized> {
  shared: Arc<ThreadShared<W>>,
}

impl<W: ?Sized> Clone for WorkSubmitter<W> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<W: ThreadedWork + ?Sized> WorkSubmitter<W> {
  /// Queues an item for its first pass. Never blocks on I/O.
  pub fn submit(&self, work: Arc<W>) {
    trace!(thread = %self.shared.name, work = %work.describe(), "Work queued");
    self.shared.pending.push(work);
    let _ = self.shared.mailbox_tx.send(ThreadControl::Wake);
  }

  /// Queues a cancellation. The item is completed on the next pass.
  pub fn cancel(&self, work: Arc<W>) {
    trace!(thread = %self.shared.name, work = %work.describe(), "Cancellation queued");
    self.shared.cancelled.push(work);
    let _ = self.shared.mailbox_tx.send(ThreadControl::Wake);
  }
}

impl<W: ?Sized> fmt::Debug for WorkSubmitter<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkSubmitter").field("thread", &self.shared.name).finish()
  }
}

/// Owns the processing pass and, in threaded mode, the thread running it.
pub struct TransportThread<W: ThreadedWork + ?Sized + 'static> {
  shared: Arc<ThreadShared<W>>,
  mode: SchedulingMode,
  pacing: ThreadPacing,
  join_handle: Mutex<Option<JoinHandle<()>>>,
  running: Arc<AtomicBool>,
}

impl<W: ThreadedWork + ?Sized + 'static> fmt::Debug for TransportThread<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TransportThread")
      .field("name", &self.shared.name)
      .field("mode", &self.mode)
      .field("pending_len", &self.shared.pending.len())
      .field("cancelled_len", &self.shared.cancelled.len())
      .field("completed_len", &self.shared.completed.len())
      .field("running_len", &self.running_len())
      .field("thread_running", &self.is_running())
      .finish_non_exhaustive()
  }
}

impl<W: ThreadedWork + ?Sized + 'static> TransportThread<W> {
  pub fn new(name: impl Into<String>, mode: SchedulingMode, pacing: ThreadPacing) -> Self {
    let (mailbox_tx, mailbox_rx) = mailbox::mailbox();
    Self {
      shared: Arc::new(ThreadShared {
        name: name.into(),
        pending: LockedQueue::new(),
        cancelled: LockedQueue::new(),
        completed: LockedQueue::new(),
        pass: Mutex::new(PassState {
          running: Vec::new(),
          last_pass: None,
        }),
        running_len: AtomicUsize::new(0),
        mailbox_tx,
        mailbox_rx,
      }),
      mode,
      pacing,
      join_handle: Mutex::new(None),
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn mode(&self) -> SchedulingMode {
    self.mode
  }

  pub fn submitter(&self) -> WorkSubmitter<W> {
    WorkSubmitter {
      shared: self.shared.clone(),
    }
  }

  pub fn submit(&self, work: Arc<W>) {
    self.submitter().submit(work);
  }

  pub fn cancel(&self, work: Arc<W>) {
    self.submitter().cancel(work);
  }

  /// Spawns the background thread in threaded mode. A no-op in cooperative mode
  /// or when the thread is already running.
  pub fn start(&self) -> Result<(), TransportError> {
    if self.mode == SchedulingMode::Cooperative {
      debug!(thread = %self.shared.name, "Cooperative scheduling; no thread spawned");
      return Ok(());
    }
    let mut join_guard = self.join_handle.lock();
    if join_guard.is_some() {
      warn!(thread = %self.shared.name, "Transport thread already started");
      return Ok(());
    }

    // Discard stale stop requests from an earlier run.
    while let Ok(Some(_)) = self.shared.mailbox_rx.try_recv() {}

    let shared = self.shared.clone();
    let running = self.running.clone();
    let pacing = self.pacing;
    running.store(true, Ordering::SeqCst);
    let handle = std::thread::Builder::new()
      .name(self.shared.name.clone())
      .spawn(move || {
        info!(thread = %shared.name, "Transport thread started");
        run_loop(&shared, &pacing);
        running.store(false, Ordering::SeqCst);
        info!(thread = %shared.name, "Transport thread exited");
      })
      .map_err(|e| {
        self.running.store(false, Ordering::SeqCst);
        error!(thread = %self.shared.name, "Failed to spawn transport thread: {}", e);
        TransportError::Internal(format!("transport thread spawn failed: {}", e))
      })?;
    *join_guard = Some(handle);
    Ok(())
  }

  /// Asks the thread to exit after its current pass and joins it.
  pub fn stop(&self) {
    let handle = self.join_handle.lock().take();
    let Some(handle) = handle else {
      return;
    };
    let _ = self.shared.mailbox_tx.send(ThreadControl::Stop);
    debug!(thread = %self.shared.name, "Joining transport thread...");
    if let Err(e) = handle.join() {
      error!(thread = %self.shared.name, "Transport thread panicked: {:?}", e);
    }
    self.running.store(false, Ordering::SeqCst);
  }

  /// True while a background thread is executing passes.
  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Runs one processing pass on the calling thread.
  ///
  /// This is the cooperative backend and the fallback used while no thread is running.
  pub fn tick(&self) {
    process(&self.shared);
  }

  /// Takes every item finalized since the last call, in completion order.
  pub fn take_completed(&self) -> Vec<Arc<W>> {
    self.shared.completed.drain()
  }

  /// Items started and not yet complete, as of the last pass.
  pub fn running_len(&self) -> usize {
    self.shared.running_len.load(Ordering::Acquire)
  }

  pub fn pending_len(&self) -> usize {
    self.shared.pending.len()
  }

  /// Cancels everything still pending or running and finalizes it in one pass.
  ///
  /// Used on shutdown after [`stop`](Self::stop); the caller drains the
  /// completed queue afterwards.
  pub fn cancel_all(&self) {
    let running: Vec<Arc<W>> = self.shared.pass.lock().running.clone();
    self.shared.cancelled.extend(running);
    let pending: Vec<Arc<W>> = self.shared.pending.with_items(|items| items.iter().cloned().collect());
    self.shared.cancelled.extend(pending);
    process(&self.shared);
  }
}

impl<W: ThreadedWork + ?Sized + 'static> Drop for TransportThread<W> {
  fn drop(&mut self) {
    self.stop();
  }
}

fn run_loop<W: ThreadedWork + ?Sized>(shared: &ThreadShared<W>, pacing: &ThreadPacing) {
  loop {
    let outer_begin = Instant::now();
    loop {
      let pass_begin = Instant::now();
      let still_running = process(shared);
      if still_running == 0 {
        break;
      }
      let sleep = pacing::active_sleep(pacing, pass_begin.elapsed());
      if mailbox::sleep_on(&shared.mailbox_rx, sleep) == SleepOutcome::Stop {
        return;
      }
    }
    let sleep = pacing::idle_sleep(pacing, outer_begin.elapsed());
    if mailbox::sleep_on(&shared.mailbox_rx, sleep) == SleepOutcome::Stop {
      return;
    }
  }
}

fn contains<W: ?Sized>(items: &[Arc<W>], needle: &Arc<W>) -> Option<usize> {
  items.iter().position(|item| Arc::ptr_eq(item, needle))
}

/// One processing pass. Returns the size of the running set afterwards.
fn process<W: ThreadedWork + ?Sized>(shared: &ThreadShared<W>) -> usize {
  let mut pass = shared.pass.lock();

  // Cancellations first: anything cancelled after this point is queued behind
  // its own submission and picked up next pass.
  let to_cancel = shared.cancelled.drain();
  let mut to_start = shared.pending.drain();
  let mut to_complete: Vec<Arc<W>> = Vec::new();

  for work in to_cancel {
    if contains(&to_complete, &work).is_some() {
      continue;
    }
    if let Some(pos) = contains(&to_start, &work) {
      debug!(thread = %shared.name, work = %work.describe(), "Cancelled before start");
      to_start.remove(pos);
      to_complete.push(work);
    } else if let Some(pos) = contains(&pass.running, &work) {
      debug!(thread = %shared.name, work = %work.describe(), "Cancelled while running");
      pass.running.remove(pos);
      to_complete.push(work);
    } else {
      trace!(thread = %shared.name, work = %work.describe(), "Cancellation for unknown or finished work ignored");
    }
  }

  for work in to_start {
    if contains(&pass.running, &work).is_some() || contains(&to_complete, &work).is_some() {
      warn!(thread = %shared.name, work = %work.describe(), "Work submitted twice; ignoring duplicate");
      continue;
    }
    let started = panic::catch_unwind(AssertUnwindSafe(|| work.start_on_thread())).unwrap_or_else(|_| {
      error!(thread = %shared.name, work = %work.describe(), "Panic while starting work");
      false
    });
    if started {
      pass.running.push(work);
    } else {
      debug!(thread = %shared.name, work = %work.describe(), "Work failed to start");
      to_complete.push(work);
    }
  }

  let now = Instant::now();
  let elapsed = pass.last_pass.map(|last| now - last).unwrap_or_default();
  pass.last_pass = Some(now);

  let mut panicked: Vec<Arc<W>> = Vec::new();
  for work in &pass.running {
    if panic::catch_unwind(AssertUnwindSafe(|| work.tick_on_thread(elapsed))).is_err() {
      error!(thread = %shared.name, work = %work.describe(), "Panic while servicing work; completing it");
      panicked.push(work.clone());
    }
  }

  pass.running.retain(|work| {
    let done = contains(&panicked, work).is_some()
      || panic::catch_unwind(AssertUnwindSafe(|| work.is_complete_on_thread())).unwrap_or(true);
    if done {
      to_complete.push(work.clone());
    }
    !done
  });

  for work in &to_complete {
    if panic::catch_unwind(AssertUnwindSafe(|| work.finish_on_thread())).is_err() {
      error!(thread = %shared.name, work = %work.describe(), "Panic while finalizing work");
    }
  }

  let running_len = pass.running.len();
  shared.running_len.store(running_len, Ordering::Release);
  drop(pass);

  if !to_complete.is_empty() {
    trace!(thread = %shared.name, count = to_complete.len(), "Work completed this pass");
    shared.completed.extend(to_complete);
  }
  running_len
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  #[derive(Default)]
  struct Countdown {
    ticks_left: AtomicU32,
    refuse_start: bool,
    started: AtomicBool,
    finished: AtomicU32,
  }

  impl Countdown {
    fn new(ticks: u32) -> Arc<Self> {
      Arc::new(Self {
        ticks_left: AtomicU32::new(ticks),
        ..Default::default()
      })
    }
  }

  impl ThreadedWork for Countdown {
    fn start_on_thread(&self) -> bool {
      self.started.store(true, Ordering::SeqCst);
      !self.refuse_start
    }
    fn tick_on_thread(&self, _elapsed: Duration) {
      let _ = self
        .ticks_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }
    fn is_complete_on_thread(&self) -> bool {
      self.ticks_left.load(Ordering::SeqCst) == 0
    }
    fn finish_on_thread(&self) {
      self.finished.fetch_add(1, Ordering::SeqCst);
    }
    fn describe(&self) -> String {
      "countdown".into()
    }
  }

  fn cooperative() -> TransportThread<Countdown> {
    TransportThread::new("test", SchedulingMode::Cooperative, ThreadPacing::default())
  }

  #[test]
  fn work_runs_until_complete_then_is_finalized_once() {
    let thread = cooperative();
    let work = Countdown::new(2);
    thread.submit(work.clone());

    thread.tick();
    assert_eq!(thread.running_len(), 1);
    assert!(thread.take_completed().is_empty());

    thread.tick();
    let done = thread.take_completed();
    assert_eq!(done.len(), 1);
    assert!(Arc::ptr_eq(&done[0], &work));
    assert_eq!(work.finished.load(Ordering::SeqCst), 1);
    assert_eq!(thread.running_len(), 0);

    thread.tick();
    assert_eq!(work.finished.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn failed_start_goes_straight_to_completed() {
    let thread = cooperative();
    let work = Arc::new(Countdown {
      ticks_left: AtomicU32::new(5),
      refuse_start: true,
      ..Default::default()
    });
    thread.submit(work.clone());
    thread.tick();
    assert_eq!(thread.take_completed().len(), 1);
    assert_eq!(thread.running_len(), 0);
    assert_eq!(work.finished.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn cancel_before_start_never_starts() {
    let thread = cooperative();
    let work = Countdown::new(100);
    thread.submit(work.clone());
    thread.cancel(work.clone());
    thread.cancel(work.clone());
    thread.tick();
    assert!(!work.started.load(Ordering::SeqCst));
    assert_eq!(thread.take_completed().len(), 1);
    assert_eq!(work.finished.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn cancel_running_completes_on_next_pass() {
    let thread = cooperative();
    let work = Countdown::new(100);
    thread.submit(work.clone());
    thread.tick();
    assert_eq!(thread.running_len(), 1);

    thread.cancel(work.clone());
    thread.tick();
    assert_eq!(thread.take_completed().len(), 1);
    assert_eq!(thread.running_len(), 0);
  }

  #[test]
  fn threaded_backend_completes_work() {
    let thread: TransportThread<Countdown> = TransportThread::new(
      "test-threaded",
      SchedulingMode::Threaded,
      ThreadPacing::default(),
    );
    thread.start().unwrap();
    assert!(thread.is_running());
    let work = Countdown::new(3);
    thread.submit(work.clone());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut done = Vec::new();
    while done.is_empty() && Instant::now() < deadline {
      done.extend(thread.take_completed());
      std::thread::sleep(Duration::from_millis(2));
    }
    thread.stop();
    assert!(!thread.is_running());
    assert_eq!(done.len(), 1);
    assert_eq!(work.finished.load(Ordering::SeqCst), 1);
  }
}
