// src/config.rs

use std::time::Duration;

/// Default time budget for one pass while work is running (HTTP).
pub const DEFAULT_HTTP_ACTIVE_FRAME_TIME: Duration = Duration::from_millis(5);
/// Default time budget for one pass while work is running (WebSocket).
pub const DEFAULT_WS_ACTIVE_FRAME_TIME: Duration = Duration::from_millis(10);
/// Default time budget for one pass while the running set is empty.
pub const DEFAULT_IDLE_FRAME_TIME: Duration = Duration::from_millis(33);
/// Sleep floor applied even when a pass overran its frame.
pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(1);

pub const DEFAULT_DEFERRED_DESTROY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_USER_AGENT: &str = concat!("rtransport/", env!("CARGO_PKG_VERSION"));

/// How a transport thread's processing pass gets scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
  /// A dedicated background thread runs passes continuously.
  #[default]
  Threaded,
  /// No thread is spawned; the owner's `tick` runs one pass synchronously.
  /// Used on targets without real multithreading and in deterministic tests.
  Cooperative,
}

/// Sleep targets for the transport thread loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPacing {
  /// Target duration of one pass while the running set is non-empty.
  pub active_frame_time: Duration,
  /// Minimum sleep between active passes.
  pub active_min_sleep: Duration,
  /// Target duration of one loop iteration while idle.
  pub idle_frame_time: Duration,
  /// Minimum sleep between idle iterations.
  pub idle_min_sleep: Duration,
}

impl ThreadPacing {
  pub fn http_default() -> Self {
    Self {
      active_frame_time: DEFAULT_HTTP_ACTIVE_FRAME_TIME,
      active_min_sleep: DEFAULT_MIN_SLEEP,
      idle_frame_time: DEFAULT_IDLE_FRAME_TIME,
      idle_min_sleep: DEFAULT_MIN_SLEEP,
    }
  }

  pub fn websocket_default() -> Self {
    Self {
      active_frame_time: DEFAULT_WS_ACTIVE_FRAME_TIME,
      ..Self::http_default()
    }
  }
}

impl Default for ThreadPacing {
  fn default() -> Self {
    Self::http_default()
  }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
  pub scheduling: SchedulingMode,
  pub pacing: ThreadPacing,
  /// Grace period a completed request stays alive after its completion callback ran.
  pub deferred_destroy_delay: Duration,
  /// Sleep between ticks while `flush` waits.
  pub flush_sleep: Duration,
  /// When set, `flush` cancels everything still outstanding once this much time passed.
  pub max_flush_time: Option<Duration>,
  pub request_timeout: Duration,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      scheduling: SchedulingMode::Threaded,
      pacing: ThreadPacing::http_default(),
      deferred_destroy_delay: DEFAULT_DEFERRED_DESTROY_DELAY,
      flush_sleep: Duration::from_millis(10),
      max_flush_time: None,
      request_timeout: DEFAULT_REQUEST_TIMEOUT,
      user_agent: DEFAULT_USER_AGENT.to_string(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
  pub scheduling: SchedulingMode,
  pub pacing: ThreadPacing,
  /// Owned by the wire: a connection not established within this window is torn down.
  pub connect_timeout: Duration,
  /// How long a locally requested close waits for the peer's close frame.
  pub close_timeout: Duration,
  /// Keepalive ping interval once connected. `None` disables pings.
  pub ping_interval: Option<Duration>,
  /// Frames, and fragmented messages as a whole, larger than this are a protocol violation.
  pub max_frame_size: usize,
  pub user_agent: String,
}

impl Default for WebSocketConfig {
  fn default() -> Self {
    Self {
      scheduling: SchedulingMode::Threaded,
      pacing: ThreadPacing::websocket_default(),
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      close_timeout: DEFAULT_CLOSE_TIMEOUT,
      ping_interval: None,
      max_frame_size: DEFAULT_MAX_FRAME_SIZE,
      user_agent: DEFAULT_USER_AGENT.to_string(),
    }
  }
}
