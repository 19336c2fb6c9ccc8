// src/http/manager.rs

use crate::config::{HttpConfig, SchedulingMode};
use crate::error::TransportError;
use crate::http::client::HttpRequestBuilder;
use crate::http::request::ThreadedRequest;
use crate::runtime::{DeferredDestroyList, TransportThread};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// How [`HttpManager::flush`] treats the requests it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
  /// Wait for everything to complete normally.
  Drain,
  /// Unbind completion callbacks first; used while tearing down.
  Shutdown,
}

/// The any-thread entry point for HTTP requests.
///
/// `submit` and `cancel` may be called from any thread. `tick` and `flush`
/// belong to one owning thread and must not run concurrently.
pub struct HttpManager {
  config: HttpConfig,
  thread: TransportThread<dyn ThreadedRequest>,
  active: Mutex<Vec<Arc<dyn ThreadedRequest>>>,
  deferred: Mutex<DeferredDestroyList<Arc<dyn ThreadedRequest>>>,
  next_id: AtomicU64,
}

impl fmt::Debug for HttpManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpManager")
      .field("scheduling", &self.config.scheduling)
      .field("active", &self.active_count())
      .field("deferred", &self.deferred_count())
      .field("thread", &self.thread)
      .finish_non_exhaustive()
  }
}

impl HttpManager {
  pub fn new(config: HttpConfig) -> Self {
    let thread = TransportThread::new("rtransport-http", config.scheduling, config.pacing);
    Self {
      config,
      thread,
      active: Mutex::new(Vec::new()),
      deferred: Mutex::new(DeferredDestroyList::new()),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn config(&self) -> &HttpConfig {
    &self.config
  }

  /// Starts the transport thread (threaded scheduling only).
  pub fn initialize(&self) -> Result<(), TransportError> {
    self.thread.start()?;
    info!(scheduling = ?self.config.scheduling, "HTTP manager initialized");
    Ok(())
  }

  /// Flushes in [`FlushMode::Shutdown`], stops the thread and releases retired requests.
  pub fn shutdown(&self) {
    self.flush(FlushMode::Shutdown);
    self.thread.stop();
    self.deferred.lock().clear();
    info!("HTTP manager shut down");
  }

  /// Starts building a request with this manager's defaults.
  pub fn create_request(&self, verb: &str, url: &str) -> HttpRequestBuilder {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    HttpRequestBuilder::new(id, verb, url, self.config.request_timeout, &self.config.user_agent)
  }

  /// Queues a request. Never blocks and never fails; I/O failures surface as
  /// a failed status on completion.
  pub fn submit<R: ThreadedRequest + 'static>(&self, request: Arc<R>) {
    let request: Arc<dyn ThreadedRequest> = request;
    {
      let mut active = self.active.lock();
      if active.iter().any(|a| Arc::ptr_eq(a, &request)) {
        warn!(request = %request.describe(), "Request already submitted; ignoring");
        return;
      }
      active.push(request.clone());
    }
    debug!(request = %request.describe(), "Request submitted");
    self.thread.submit(request);
  }

  /// Cancels a request. It completes on the next pass with a cancelled status.
  /// A second call only logs a warning.
  pub fn cancel<R: ThreadedRequest + 'static>(&self, request: &Arc<R>) {
    let request: Arc<dyn ThreadedRequest> = request.clone();
    self.cancel_inner(request, true);
  }

  fn cancel_inner(&self, request: Arc<dyn ThreadedRequest>, warn_repeat: bool) {
    if !request.mark_cancelled() {
      if warn_repeat {
        warn!(request = %request.describe(), "Request already cancelled; ignoring");
      }
      return;
    }
    debug!(request = %request.describe(), "Request cancelled");
    self.thread.cancel(request);
  }

  /// Requests submitted and not yet completed.
  pub fn active_count(&self) -> usize {
    self.active.lock().len()
  }

  /// Completed requests still inside their destroy grace period.
  pub fn deferred_count(&self) -> usize {
    self.deferred.lock().len()
  }

  pub fn is_active<R: ThreadedRequest + 'static>(&self, request: &Arc<R>) -> bool {
    let request: Arc<dyn ThreadedRequest> = request.clone();
    self.active.lock().iter().any(|a| Arc::ptr_eq(a, &request))
  }

  /// Per-frame work on the owning thread.
  ///
  /// Ticks every active request, runs a pass when no thread does, then
  /// completes what the thread finished: each completion callback runs once,
  /// after which the request waits out its grace period in the deferred list.
  pub fn tick(&self, delta: Duration) {
    let active: Vec<Arc<dyn ThreadedRequest>> = self.active.lock().clone();
    for request in &active {
      request.tick(delta);
    }

    if self.config.scheduling == SchedulingMode::Cooperative || !self.thread.is_running() {
      self.thread.tick();
    }

    let released = self.deferred.lock().tick(delta);
    if released > 0 {
      debug!(released, "Released retired requests");
    }

    for request in self.thread.take_completed() {
      self.active.lock().retain(|a| !Arc::ptr_eq(a, &request));
      request.finish_request();
      self
        .deferred
        .lock()
        .push(request, self.config.deferred_destroy_delay);
    }
  }

  /// Ticks until no request is active, sleeping `flush_sleep` between ticks.
  ///
  /// With `max_flush_time` set, everything still active when it runs out is
  /// cancelled, which completes it on the next pass.
  pub fn flush(&self, mode: FlushMode) {
    let outstanding: Vec<Arc<dyn ThreadedRequest>> = self.active.lock().clone();
    if outstanding.is_empty() {
      return;
    }
    info!(count = outstanding.len(), ?mode, "Flushing outstanding requests");
    for request in &outstanding {
      info!(request = %request.describe(), status = %request.status(), "Outstanding request");
      if mode == FlushMode::Shutdown {
        request.unbind_callbacks();
      }
    }
    drop(outstanding);

    let begin = Instant::now();
    let mut last_tick = begin;
    let mut cancelled_remaining = false;
    while self.active_count() > 0 {
      if let Some(limit) = self.config.max_flush_time {
        if !cancelled_remaining && begin.elapsed() >= limit {
          let remaining: Vec<Arc<dyn ThreadedRequest>> = self.active.lock().clone();
          warn!(count = remaining.len(), ?limit, "Flush time limit reached; cancelling remaining requests");
          for request in remaining {
            self.cancel_inner(request, false);
          }
          cancelled_remaining = true;
        }
      }
      std::thread::sleep(self.config.flush_sleep);
      let now = Instant::now();
      self.tick(now - last_tick);
      last_tick = now;
    }
    info!(elapsed = ?begin.elapsed(), "Flush complete");
  }
}
