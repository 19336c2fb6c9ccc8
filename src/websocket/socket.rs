// src/websocket/socket.rs

use crate::runtime::WorkSubmitter;
use crate::websocket::bridge::GameThreadBridge;
use crate::websocket::connection::WebSocketConnection;
use crate::websocket::frame::CLOSE_GOING_AWAY;
use crate::websocket::state::ConnectionState;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

/// State shared between a [`WebSocket`] handle and its manager.
pub(crate) struct SocketShared {
  pub(crate) connection: Arc<WebSocketConnection>,
  pub(crate) bridge: GameThreadBridge,
  submitter: WorkSubmitter<WebSocketConnection>,
  /// The user handle is gone.
  released: AtomicBool,
}

impl SocketShared {
  pub(crate) fn new(connection: WebSocketConnection, submitter: WorkSubmitter<WebSocketConnection>) -> Self {
    Self {
      connection: Arc::new(connection),
      bridge: GameThreadBridge::new(),
      submitter,
      released: AtomicBool::new(false),
    }
  }

  /// Runs the owning-thread side for one frame. Returns true once the socket
  /// can be forgotten by its manager.
  pub(crate) fn game_thread_tick(&self) -> bool {
    if self.connection.state() == ConnectionState::None {
      // Never started: nothing will ever fire.
      return self.released.load(Ordering::Acquire);
    }
    self.bridge.game_thread_tick(&self.connection)
  }
}

/// A client WebSocket created by a [`WebSocketsManager`](super::WebSocketsManager).
///
/// All methods are meant for the thread that ticks the manager. Events fire
/// from that manager's `tick`.
pub struct WebSocket {
  shared: Arc<SocketShared>,
}

impl WebSocket {
  pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
    Self { shared }
  }

  pub fn id(&self) -> u64 {
    self.shared.connection.id()
  }

  pub fn url(&self) -> &str {
    self.shared.connection.url()
  }

  /// Current state as seen by the transport thread.
  pub fn state(&self) -> ConnectionState {
    self.shared.connection.state()
  }

  /// State as of the last manager tick.
  pub fn observed_state(&self) -> ConnectionState {
    self.shared.bridge.observed_state()
  }

  pub fn is_connected(&self) -> bool {
    self.state() == ConnectionState::Connected
  }

  /// Subprotocol chosen by the server, once connected.
  pub fn protocol(&self) -> Option<String> {
    self.shared.connection.snapshot().protocol
  }

  /// Messages queued and not yet fully written.
  pub fn pending_send_count(&self) -> usize {
    self.shared.connection.outbound_len()
  }

  /// Starts connecting. Only valid once, from the initial state; otherwise logs and returns.
  ///
  /// Which message observers are bound at this moment decides what inbound
  /// data gets buffered for the rest of the connection.
  pub fn connect(&self) {
    let interest = self.shared.bridge.interest();
    if self.shared.connection.begin_connect(interest) {
      debug!(conn_id = self.id(), url = %self.url(), ?interest, "Connecting");
      self.shared.submitter.submit(self.shared.connection.clone());
    }
  }

  /// Queues a message for the transport thread. Never blocks.
  pub fn send(&self, data: &[u8], is_binary: bool) {
    self.shared.connection.enqueue_send(data, is_binary);
  }

  pub fn send_text(&self, text: &str) {
    self.send(text.as_bytes(), false);
  }

  /// Starts the close handshake. A second call logs a warning and does nothing.
  pub fn close(&self, code: u16, reason: &str) {
    self.shared.connection.request_close(code, reason);
  }

  pub fn on_connected(&self, f: impl Fn() + Send + Sync + 'static) {
    self.shared.bridge.add_connected(Arc::new(f));
  }

  /// Whole text messages. Must be bound before `connect`.
  pub fn on_message(&self, f: impl Fn(&str) + Send + Sync + 'static) {
    self.shared.bridge.add_message(Arc::new(f));
  }

  /// Every inbound chunk with the bytes remaining in its frame. Must be bound before `connect`.
  pub fn on_raw_message(&self, f: impl Fn(&[u8], usize) + Send + Sync + 'static) {
    self.shared.bridge.add_raw_message(Arc::new(f));
  }

  pub fn on_closed(&self, f: impl Fn(u16, &str, bool) + Send + Sync + 'static) {
    self.shared.bridge.add_closed(Arc::new(f));
  }

  pub fn on_connection_error(&self, f: impl Fn(&str) + Send + Sync + 'static) {
    self.shared.bridge.add_error(Arc::new(f));
  }

  /// Text messages once fully written. Must be bound before `connect`.
  pub fn on_message_sent(&self, f: impl Fn(&str) + Send + Sync + 'static) {
    self.shared.bridge.add_message_sent(Arc::new(f));
  }
}

// A live connection whose handle is dropped is closed with "going away"; its
// manager keeps ticking it until the terminal event.
impl Drop for WebSocket {
  fn drop(&mut self) {
    self.shared.released.store(true, Ordering::Release);
    let state = self.state();
    if !state.is_terminal() && state != ConnectionState::None && !self.shared.connection.close_requested() {
      trace!(conn_id = self.id(), %state, "Handle dropped while live; closing");
      self.shared.connection.request_close(CLOSE_GOING_AWAY, "");
    }
  }
}

impl fmt::Debug for WebSocket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WebSocket")
      .field("id", &self.id())
      .field("url", &self.url())
      .field("state", &self.state())
      .finish()
  }
}
