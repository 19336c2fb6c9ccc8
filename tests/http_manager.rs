// tests/http_manager.rs

use rtransport::{FlushMode, HttpConfig, HttpManager, RequestStatus, SchedulingMode, ThreadedRequest, ThreadedWork};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod common;
use common::{http_config, setup_tracing, BACKENDS, PUMP_TIMEOUT};

const FRAME: Duration = Duration::from_millis(16);

/// A request that needs a fixed number of passes, or never finishes.
struct ScriptedRequest {
  name: String,
  passes_needed: Option<usize>,
  fail_start: bool,
  cancelled: AtomicBool,
  passes: AtomicUsize,
  started: AtomicUsize,
  finished_on_thread: AtomicUsize,
  completions: AtomicUsize,
  owner_ticks: AtomicUsize,
  unbound: AtomicBool,
  status: Mutex<RequestStatus>,
  completed_with: Mutex<Option<RequestStatus>>,
}

impl ScriptedRequest {
  fn new(name: &str, passes_needed: Option<usize>) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      passes_needed,
      fail_start: false,
      cancelled: AtomicBool::new(false),
      passes: AtomicUsize::new(0),
      started: AtomicUsize::new(0),
      finished_on_thread: AtomicUsize::new(0),
      completions: AtomicUsize::new(0),
      owner_ticks: AtomicUsize::new(0),
      unbound: AtomicBool::new(false),
      status: Mutex::new(RequestStatus::NotStarted),
      completed_with: Mutex::new(None),
    })
  }

  fn failing(name: &str) -> Arc<Self> {
    let mut request = Self::new(name, Some(1));
    Arc::get_mut(&mut request).expect("unique").fail_start = true;
    request
  }

  fn set_status(&self, status: RequestStatus) {
    let mut current = self.status.lock().unwrap();
    if !current.is_finished() {
      *current = status;
    }
  }

  fn completions(&self) -> usize {
    self.completions.load(Ordering::SeqCst)
  }

  fn completed_with(&self) -> Option<RequestStatus> {
    self.completed_with.lock().unwrap().clone()
  }
}

impl ThreadedWork for ScriptedRequest {
  fn start_on_thread(&self) -> bool {
    self.started.fetch_add(1, Ordering::SeqCst);
    if self.fail_start {
      self.set_status(RequestStatus::Failed("could not start".into()));
      return false;
    }
    self.set_status(RequestStatus::Processing);
    true
  }

  fn tick_on_thread(&self, _elapsed: Duration) {
    let passes = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
    if self.passes_needed.is_some_and(|needed| passes >= needed) {
      self.set_status(RequestStatus::Succeeded);
    }
  }

  fn is_complete_on_thread(&self) -> bool {
    self.status.lock().unwrap().is_finished()
  }

  fn finish_on_thread(&self) {
    self.finished_on_thread.fetch_add(1, Ordering::SeqCst);
    if self.is_cancelled() {
      self.set_status(RequestStatus::Cancelled);
    } else {
      self.set_status(RequestStatus::Failed("aborted".into()));
    }
  }

  fn describe(&self) -> String {
    format!("scripted {}", self.name)
  }
}

impl ThreadedRequest for ScriptedRequest {
  fn tick(&self, _delta: Duration) {
    self.owner_ticks.fetch_add(1, Ordering::SeqCst);
  }

  fn mark_cancelled(&self) -> bool {
    !self.cancelled.swap(true, Ordering::SeqCst)
  }

  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  fn finish_request(&self) {
    if self.completions.fetch_add(1, Ordering::SeqCst) > 0 {
      return;
    }
    if !self.unbound.load(Ordering::SeqCst) {
      *self.completed_with.lock().unwrap() = Some(self.status());
    }
  }

  fn unbind_callbacks(&self) {
    self.unbound.store(true, Ordering::SeqCst);
  }

  fn status(&self) -> RequestStatus {
    self.status.lock().unwrap().clone()
  }
}

fn manager(mode: SchedulingMode) -> HttpManager {
  setup_tracing();
  let manager = HttpManager::new(http_config(mode));
  manager.initialize().expect("initialize");
  manager
}

fn pump_until(manager: &HttpManager, mut cond: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  loop {
    manager.tick(FRAME);
    if cond() {
      return true;
    }
    if start.elapsed() > PUMP_TIMEOUT {
      return false;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
}

// --- Completion ---

#[test]
fn requests_complete_once_on_both_backends() {
  for mode in BACKENDS {
    let manager = manager(mode);
    let requests: Vec<Arc<ScriptedRequest>> = (0..8)
      .map(|i| ScriptedRequest::new(&format!("r{i}"), Some(i % 3 + 1)))
      .collect();
    for request in &requests {
      manager.submit(request.clone());
    }
    assert_eq!(manager.active_count(), requests.len());

    assert!(pump_until(&manager, || manager.active_count() == 0), "{mode:?}");
    for _ in 0..5 {
      manager.tick(FRAME);
    }
    for request in &requests {
      assert_eq!(request.completions(), 1, "{mode:?} {}", request.name);
      assert_eq!(request.completed_with(), Some(RequestStatus::Succeeded));
      assert_eq!(request.finished_on_thread.load(Ordering::SeqCst), 1);
      assert_eq!(request.started.load(Ordering::SeqCst), 1);
    }
  }
}

#[test]
fn failed_start_completes_with_failure() {
  for mode in BACKENDS {
    let manager = manager(mode);
    let request = ScriptedRequest::failing("bad");
    manager.submit(request.clone());
    assert!(pump_until(&manager, || request.completions() == 1), "{mode:?}");
    assert_eq!(
      request.completed_with(),
      Some(RequestStatus::Failed("could not start".into()))
    );
    assert_eq!(request.passes.load(Ordering::SeqCst), 0);
  }
}

#[test]
fn owner_tick_reaches_active_requests() {
  let manager = manager(SchedulingMode::Cooperative);
  let request = ScriptedRequest::new("slow", Some(3));
  manager.submit(request.clone());
  manager.tick(FRAME);
  manager.tick(FRAME);
  assert!(request.owner_ticks.load(Ordering::SeqCst) >= 2);
  assert!(manager.is_active(&request));
}

#[test]
fn submitting_twice_is_ignored() {
  let manager = manager(SchedulingMode::Cooperative);
  let request = ScriptedRequest::new("dup", Some(1));
  manager.submit(request.clone());
  manager.submit(request.clone());
  assert_eq!(manager.active_count(), 1);
  assert!(pump_until(&manager, || manager.active_count() == 0));
  assert_eq!(request.started.load(Ordering::SeqCst), 1);
  assert_eq!(request.completions(), 1);
}

// --- Cancellation ---

#[test]
fn cancel_before_io_completes_on_next_pass() {
  let manager = manager(SchedulingMode::Cooperative);
  let request = ScriptedRequest::new("never", None);
  manager.submit(request.clone());
  manager.cancel(&request);

  manager.tick(FRAME);
  assert_eq!(request.completions(), 1);
  assert_eq!(request.completed_with(), Some(RequestStatus::Cancelled));
  assert_eq!(request.started.load(Ordering::SeqCst), 0);
  assert_eq!(manager.active_count(), 0);
}

#[test]
fn cancel_while_running_reports_cancelled() {
  for mode in BACKENDS {
    let manager = manager(mode);
    let request = ScriptedRequest::new("never", None);
    manager.submit(request.clone());
    assert!(pump_until(&manager, || request.started.load(Ordering::SeqCst) == 1));

    manager.cancel(&request);
    assert!(pump_until(&manager, || request.completions() == 1), "{mode:?}");
    assert_eq!(request.status(), RequestStatus::Cancelled);
    assert!(!request.status().is_success());
    assert_eq!(request.completed_with(), Some(RequestStatus::Cancelled));
  }
}

#[test]
fn second_cancel_is_a_no_op() {
  for mode in BACKENDS {
    let manager = manager(mode);
    let request = ScriptedRequest::new("never", None);
    manager.submit(request.clone());
    manager.cancel(&request);
    manager.cancel(&request);
    assert!(pump_until(&manager, || request.completions() == 1), "{mode:?}");
    for _ in 0..5 {
      manager.tick(FRAME);
    }
    assert_eq!(request.completions(), 1);
    assert_eq!(request.finished_on_thread.load(Ordering::SeqCst), 1);
    assert_eq!(request.status(), RequestStatus::Cancelled);
  }
}

#[test]
fn cancelled_http_request_is_not_a_failure() {
  let manager = manager(SchedulingMode::Cooperative);
  let outcome: Arc<Mutex<Vec<RequestStatus>>> = Arc::default();
  let o = outcome.clone();
  let request = manager
    .create_request("GET", "http://127.0.0.1:9/never")
    .on_complete(move |status, response| {
      assert!(response.is_none());
      o.lock().unwrap().push(status.clone());
    })
    .build();
  manager.submit(request.clone());
  manager.cancel(&request);
  manager.tick(FRAME);

  assert_eq!(*outcome.lock().unwrap(), vec![RequestStatus::Cancelled]);
  assert_eq!(request.status(), RequestStatus::Cancelled);
  assert_eq!(request.bytes_sent(), 0);
}

// --- Flush ---

#[test]
fn flush_drains_every_request() {
  for mode in BACKENDS {
    let manager = manager(mode);
    let requests: Vec<Arc<ScriptedRequest>> = (0..5)
      .map(|i| ScriptedRequest::new(&format!("f{i}"), Some(2 * i + 1)))
      .collect();
    for request in &requests {
      manager.submit(request.clone());
    }
    manager.flush(FlushMode::Drain);
    assert_eq!(manager.active_count(), 0, "{mode:?}");
    for request in &requests {
      assert_eq!(request.completions(), 1);
      assert_eq!(request.completed_with(), Some(RequestStatus::Succeeded));
    }
  }
}

#[test]
fn flush_time_limit_cancels_the_rest() {
  for mode in BACKENDS {
    setup_tracing();
    let config = HttpConfig {
      max_flush_time: Some(Duration::from_millis(30)),
      ..http_config(mode)
    };
    let manager = HttpManager::new(config);
    manager.initialize().expect("initialize");

    let quick = ScriptedRequest::new("quick", Some(1));
    let stuck = ScriptedRequest::new("stuck", None);
    manager.submit(quick.clone());
    manager.submit(stuck.clone());

    let begin = Instant::now();
    manager.flush(FlushMode::Drain);
    assert!(begin.elapsed() < PUMP_TIMEOUT);
    assert_eq!(manager.active_count(), 0, "{mode:?}");
    assert_eq!(quick.completed_with(), Some(RequestStatus::Succeeded));
    assert_eq!(stuck.completed_with(), Some(RequestStatus::Cancelled));
  }
}

#[test]
fn shutdown_flush_unbinds_callbacks() {
  setup_tracing();
  let config = HttpConfig {
    max_flush_time: Some(Duration::from_millis(10)),
    ..http_config(SchedulingMode::Threaded)
  };
  let manager = HttpManager::new(config);
  manager.initialize().expect("initialize");
  let stuck = ScriptedRequest::new("stuck", None);
  manager.submit(stuck.clone());

  manager.shutdown();
  assert_eq!(manager.active_count(), 0);
  assert_eq!(manager.deferred_count(), 0);
  assert_eq!(stuck.completions(), 1);
  assert_eq!(stuck.completed_with(), None);
  assert_eq!(stuck.status(), RequestStatus::Cancelled);
}

// --- Deferred destroy ---

#[test]
fn completed_requests_are_released_after_grace_period() {
  setup_tracing();
  let config = HttpConfig {
    deferred_destroy_delay: Duration::from_millis(100),
    ..http_config(SchedulingMode::Cooperative)
  };
  let manager = HttpManager::new(config);
  manager.initialize().expect("initialize");

  let request = ScriptedRequest::new("short", Some(1));
  manager.submit(request.clone());
  manager.tick(Duration::ZERO);
  assert_eq!(request.completions(), 1);
  assert_eq!(manager.deferred_count(), 1);
  assert_eq!(Arc::strong_count(&request), 2);

  manager.tick(Duration::from_millis(60));
  assert_eq!(manager.deferred_count(), 1);
  manager.tick(Duration::from_millis(60));
  assert_eq!(manager.deferred_count(), 0);
  assert_eq!(Arc::strong_count(&request), 1);
}

#[test]
fn tick_without_thread_still_makes_progress() {
  setup_tracing();
  // Threaded scheduling, but the thread is never started.
  let manager = HttpManager::new(http_config(SchedulingMode::Threaded));
  let request = ScriptedRequest::new("fallback", Some(2));
  manager.submit(request.clone());
  assert!(pump_until(&manager, || request.completions() == 1));
  assert_eq!(request.completed_with(), Some(RequestStatus::Succeeded));
}
