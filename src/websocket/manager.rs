// src/websocket/manager.rs

use crate::config::{SchedulingMode, WebSocketConfig};
use crate::error::TransportError;
use crate::runtime::{ThreadedWork, TransportThread};
use crate::websocket::connection::WebSocketConnection;
use crate::websocket::socket::{SocketShared, WebSocket};
use crate::websocket::state::ConnectionState;
use crate::websocket::wire::{TcpConnector, WireConnector};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Multiplexes every WebSocket it creates over one transport thread.
///
/// Construct it explicitly, call [`initialize`](Self::initialize), tick it once
/// per frame from the owning thread and call [`shutdown`](Self::shutdown) when done.
pub struct WebSocketsManager {
  config: WebSocketConfig,
  connector: Arc<dyn WireConnector>,
  thread: TransportThread<WebSocketConnection>,
  sockets: Mutex<Vec<Arc<SocketShared>>>,
  next_id: AtomicU64,
  shut_down: AtomicBool,
}

impl fmt::Debug for WebSocketsManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WebSocketsManager")
      .field("scheduling", &self.config.scheduling)
      .field("sockets", &self.sockets.lock().len())
      .field("thread", &self.thread)
      .finish_non_exhaustive()
  }
}

impl WebSocketsManager {
  /// A manager whose sockets run over TCP, with TLS for `wss` URLs.
  pub fn new(config: WebSocketConfig) -> Self {
    let connector = Arc::new(TcpConnector::new(config.clone()));
    Self::with_connector(config, connector)
  }

  /// A manager whose sockets open their wires through `connector`.
  pub fn with_connector(config: WebSocketConfig, connector: Arc<dyn WireConnector>) -> Self {
    let thread = TransportThread::new("rtransport-websockets", config.scheduling, config.pacing);
    Self {
      config,
      connector,
      thread,
      sockets: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
      shut_down: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &WebSocketConfig {
    &self.config
  }

  /// Starts the transport thread (threaded scheduling only).
  pub fn initialize(&self) -> Result<(), TransportError> {
    self.shut_down.store(false, Ordering::Release);
    self.thread.start()?;
    info!(scheduling = ?self.config.scheduling, "WebSockets manager initialized");
    Ok(())
  }

  /// Stops the transport thread and aborts every live connection.
  ///
  /// Aborted sockets still report their terminal event on the next [`tick`](Self::tick).
  pub fn shutdown(&self) {
    if self.shut_down.swap(true, Ordering::AcqRel) {
      return;
    }
    self.thread.stop();
    let outstanding = self.outstanding();
    info!(count = outstanding.len(), "Aborting outstanding WebSockets");
    for connection in &outstanding {
      info!(connection = %connection, "Outstanding WebSocket");
    }
    self.thread.cancel_all();
    let aborted = self.thread.take_completed().len();
    info!(aborted, remaining_sockets = self.socket_count(), "WebSockets manager shut down");
  }

  pub fn create_web_socket(&self, url: &str, protocols: &[&str]) -> WebSocket {
    self.create_web_socket_with_headers(url, protocols, &[])
  }

  /// Creates a socket whose upgrade request carries `headers` in addition to the standard ones.
  pub fn create_web_socket_with_headers(&self, url: &str, protocols: &[&str], headers: &[(&str, &str)]) -> WebSocket {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let connection = WebSocketConnection::new(
      id,
      url.to_string(),
      protocols.iter().map(|p| p.to_string()).collect(),
      headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
      self.connector.clone(),
    );
    let shared = Arc::new(SocketShared::new(connection, self.thread.submitter()));
    self.sockets.lock().push(shared.clone());
    debug!(conn_id = id, %url, ?protocols, "WebSocket created");
    WebSocket::new(shared)
  }

  /// Descriptions of connections started and not yet terminal.
  fn outstanding(&self) -> Vec<String> {
    self
      .sockets
      .lock()
      .iter()
      .filter(|s| {
        let state = s.connection.state();
        state != ConnectionState::None && !state.is_terminal()
      })
      .map(|s| s.connection.describe())
      .collect()
  }

  /// Sockets not yet retired.
  pub fn socket_count(&self) -> usize {
    self.sockets.lock().len()
  }

  /// Per-frame work on the owning thread: runs a pass when no thread does,
  /// then fires each socket's pending events and retires finished sockets.
  ///
  /// After [`shutdown`](Self::shutdown) a pass only aborts, so a late
  /// `connect` ends in an error without opening a connection.
  pub fn tick(&self) {
    if self.shut_down.load(Ordering::Acquire) {
      self.thread.cancel_all();
    } else if self.config.scheduling == SchedulingMode::Cooperative || !self.thread.is_running() {
      self.thread.tick();
    }
    // Completed connections are already terminal; sockets keep them alive.
    drop(self.thread.take_completed());

    let sockets: Vec<Arc<SocketShared>> = self.sockets.lock().clone();
    let mut retired: Vec<Arc<SocketShared>> = Vec::new();
    for socket in sockets {
      if socket.game_thread_tick() {
        retired.push(socket);
      }
    }
    if !retired.is_empty() {
      self
        .sockets
        .lock()
        .retain(|s| !retired.iter().any(|r| Arc::ptr_eq(r, s)));
      debug!(count = retired.len(), "Retired finished WebSockets");
    }
  }
}

impl Drop for WebSocketsManager {
  fn drop(&mut self) {
    self.shutdown();
  }
}
