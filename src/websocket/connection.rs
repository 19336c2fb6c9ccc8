// src/websocket/connection.rs

use crate::runtime::{LockedQueue, ThreadedWork};
use crate::websocket::buffer::{MessageAssembler, ReceiveBuffer, SendBuffer};
use crate::websocket::frame::CLOSE_ABNORMAL;
use crate::websocket::state::{CloseRequest, Closure, ConnectionState};
use crate::websocket::target::parse_target;
use crate::websocket::wire::{Wire, WireConnector, WireEvent};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

bitflags! {
    /// Which inbound deliveries a connection buffers for its owning thread.
    /// Captured once, when the connection is started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventInterest: u8 {
        /// Whole text messages.
        const MESSAGE = 0b001;
        /// Every inbound chunk, with its remaining-byte count.
        const RAW_MESSAGE = 0b010;
        /// Text messages once fully written.
        const MESSAGE_SENT = 0b100;
    }
}

/// Payload handed from the transport thread to the owning thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
  Message(String),
  Raw(ReceiveBuffer),
  Sent(String),
}

/// Copy of the lock-protected fields, taken by the owning thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot {
  pub state: ConnectionState,
  pub was_connected: bool,
  pub closure: Option<Closure>,
  pub error: Option<String>,
  pub protocol: Option<String>,
}

#[derive(Debug, Default)]
struct StateBlock {
  state: ConnectionState,
  interest: EventInterest,
  /// Set by the first `close` call; later calls are ignored.
  close_request: Option<CloseRequest>,
  close_sent: bool,
  was_connected: bool,
  protocol: Option<String>,
  peer_close: Option<(u16, String)>,
  closure: Option<Closure>,
  error: Option<String>,
}

#[derive(Debug)]
struct Outbound {
  buffer: SendBuffer,
  /// Kept for the message-sent notification.
  text: Option<String>,
}

#[derive(Default)]
struct IoState {
  wire: Option<Box<dyn Wire>>,
  assembler: MessageAssembler,
  events: Vec<WireEvent>,
}

/// Per-connection state shared by the owning thread and the transport thread.
///
/// The owning thread starts, sends and closes; the transport thread drives the
/// wire and performs every other transition. `state` and `outbound` each carry
/// their own lock and are always taken in that order.
pub struct WebSocketConnection {
  id: u64,
  url: String,
  protocols: Vec<String>,
  headers: Vec<(String, String)>,
  connector: Arc<dyn WireConnector>,
  state: Mutex<StateBlock>,
  outbound: Mutex<VecDeque<Outbound>>,
  deliveries: LockedQueue<Delivery>,
  /// Raised when the outbound queue goes from empty to non-empty while established.
  wants_writable: AtomicBool,
  io: Mutex<IoState>,
}

impl fmt::Debug for WebSocketConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WebSocketConnection")
      .field("id", &self.id)
      .field("url", &self.url)
      .field("state", &self.state())
      .field("outbound_len", &self.outbound.lock().len())
      .finish_non_exhaustive()
  }
}

impl WebSocketConnection {
  pub(crate) fn new(
    id: u64,
    url: String,
    protocols: Vec<String>,
    headers: Vec<(String, String)>,
    connector: Arc<dyn WireConnector>,
  ) -> Self {
    Self {
      id,
      url,
      protocols,
      headers,
      connector,
      state: Mutex::new(StateBlock::default()),
      outbound: Mutex::new(VecDeque::new()),
      deliveries: LockedQueue::new(),
      wants_writable: AtomicBool::new(false),
      io: Mutex::new(IoState::default()),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn state(&self) -> ConnectionState {
    self.state.lock().state
  }

  pub fn outbound_len(&self) -> usize {
    self.outbound.lock().len()
  }

  fn transition(&self, block: &mut StateBlock, next: ConnectionState) {
    if !block.state.can_transition(next) {
      error!(conn_id = self.id, from = %block.state, to = %next, "Rejected invalid state transition");
      return;
    }
    debug!(conn_id = self.id, url = %self.url, from = %block.state, to = %next, "State transition");
    block.state = next;
    if next == ConnectionState::Connected {
      block.was_connected = true;
    }
  }

  fn fail(&self, block: &mut StateBlock, reason: String) {
    debug!(conn_id = self.id, url = %self.url, %reason, "Connection error");
    block.error = Some(reason);
    self.transition(block, ConnectionState::Error);
  }

  fn close_unclean(&self, block: &mut StateBlock, reason: String) {
    let (code, reason) = match block.peer_close.take() {
      Some((code, peer_reason)) if reason.is_empty() => (code, peer_reason),
      _ => (CLOSE_ABNORMAL, reason),
    };
    block.closure = Some(Closure {
      code,
      reason,
      clean: false,
    });
    self.transition(block, ConnectionState::Closed);
  }

  // --- Owning thread ---

  /// `None -> StartConnecting`. Returns false, with a warning, in any other state.
  pub(crate) fn begin_connect(&self, interest: EventInterest) -> bool {
    let mut block = self.state.lock();
    if block.state != ConnectionState::None {
      warn!(conn_id = self.id, url = %self.url, state = %block.state, "connect() ignored; already started");
      return false;
    }
    block.interest = interest;
    self.transition(&mut block, ConnectionState::StartConnecting);
    true
  }

  /// Queues one message. Never blocks and has no capacity limit.
  pub(crate) fn enqueue_send(&self, payload: &[u8], is_binary: bool) -> bool {
    let block = self.state.lock();
    let accepting = matches!(
      block.state,
      ConnectionState::StartConnecting | ConnectionState::Connecting | ConnectionState::Connected
    ) && block.close_request.is_none();
    if !accepting {
      warn!(conn_id = self.id, state = %block.state, "send() ignored; connection is not open");
      return false;
    }
    let text = if !is_binary && block.interest.contains(EventInterest::MESSAGE_SENT) {
      Some(String::from_utf8_lossy(payload).into_owned())
    } else {
      None
    };
    let mut outbound = self.outbound.lock();
    let was_empty = outbound.is_empty();
    outbound.push_back(Outbound {
      buffer: SendBuffer::new(payload, is_binary, rand::random()),
      text,
    });
    if was_empty && block.state == ConnectionState::Connected {
      self.wants_writable.store(true, Ordering::Release);
    }
    trace!(conn_id = self.id, len = payload.len(), is_binary, queued = outbound.len(), "Message queued");
    true
  }

  /// Records a close request. Only the first call has any effect.
  pub(crate) fn request_close(&self, code: u16, reason: &str) {
    let mut block = self.state.lock();
    if let Some(existing) = &block.close_request {
      warn!(
        conn_id = self.id,
        code,
        first_code = existing.code,
        "close() called again; ignoring"
      );
      return;
    }
    match block.state {
      ConnectionState::None => {
        warn!(conn_id = self.id, "close() on a connection that was never started; ignoring");
      }
      ConnectionState::StartConnecting | ConnectionState::Connecting => {
        debug!(conn_id = self.id, code, "Close requested before connect completed; deferring");
        block.close_request = Some(CloseRequest {
          code,
          reason: reason.to_string(),
        });
      }
      ConnectionState::Connected => {
        block.close_request = Some(CloseRequest {
          code,
          reason: reason.to_string(),
        });
        self.transition(&mut block, ConnectionState::ClosingByRequest);
        self.wants_writable.store(true, Ordering::Release);
      }
      ConnectionState::ClosingByRequest | ConnectionState::Closed | ConnectionState::Error => {
        warn!(conn_id = self.id, state = %block.state, "close() on a closing or finished connection; ignoring");
      }
    }
  }

  pub(crate) fn close_requested(&self) -> bool {
    self.state.lock().close_request.is_some()
  }

  pub(crate) fn snapshot(&self) -> Snapshot {
    let block = self.state.lock();
    Snapshot {
      state: block.state,
      was_connected: block.was_connected,
      closure: block.closure.clone(),
      error: block.error.clone(),
      protocol: block.protocol.clone(),
    }
  }

  pub(crate) fn take_deliveries(&self) -> Vec<Delivery> {
    self.deliveries.drain()
  }

  // --- Transport thread ---

  fn handle_event(&self, wire: &mut dyn Wire, assembler: &mut MessageAssembler, event: WireEvent) {
    match event {
      WireEvent::Established { protocol } => {
        let mut block = self.state.lock();
        if block.state != ConnectionState::Connecting {
          trace!(conn_id = self.id, state = %block.state, "Late establish ignored");
          return;
        }
        block.protocol = protocol;
        self.transition(&mut block, ConnectionState::Connected);
        let mut want_write = !self.outbound.lock().is_empty();
        if block.close_request.is_some() {
          self.transition(&mut block, ConnectionState::ClosingByRequest);
          want_write = true;
        }
        drop(block);
        if want_write {
          wire.request_writable();
        }
      }
      WireEvent::Receive(chunk) => {
        let interest = {
          let block = self.state.lock();
          if !block.state.is_established() {
            return;
          }
          block.interest
        };
        if interest.contains(EventInterest::MESSAGE) && !chunk.is_binary {
          if let Some(message) = assembler.push(&chunk) {
            self
              .deliveries
              .push(Delivery::Message(String::from_utf8_lossy(&message).into_owned()));
          }
        }
        if interest.contains(EventInterest::RAW_MESSAGE) {
          self.deliveries.push(Delivery::Raw(chunk));
        }
      }
      WireEvent::Writable => self.on_writable(wire),
      WireEvent::PeerClosing { code, reason } => {
        debug!(conn_id = self.id, code, %reason, "Peer is closing the connection");
        self.state.lock().peer_close = Some((code, reason));
      }
      WireEvent::Closed { code, reason } => {
        let mut block = self.state.lock();
        match block.state {
          ConnectionState::ClosingByRequest if block.close_sent => {
            block.closure = Some(Closure {
              code,
              reason,
              clean: true,
            });
            self.transition(&mut block, ConnectionState::Closed);
          }
          ConnectionState::Connected | ConnectionState::ClosingByRequest => {
            block.peer_close = Some((code, reason));
            self.close_unclean(&mut block, String::new());
          }
          ConnectionState::StartConnecting | ConnectionState::Connecting => {
            self.fail(&mut block, "connection closed before it was established".into());
          }
          _ => {}
        }
      }
      WireEvent::ConnectionError(reason) => {
        let mut block = self.state.lock();
        match block.state {
          ConnectionState::StartConnecting | ConnectionState::Connecting => self.fail(&mut block, reason),
          ConnectionState::Connected | ConnectionState::ClosingByRequest => self.close_unclean(&mut block, reason),
          _ => {}
        }
      }
      WireEvent::Destroyed => {
        let mut block = self.state.lock();
        match block.state {
          ConnectionState::StartConnecting | ConnectionState::Connecting => {
            self.fail(&mut block, "connection timed out".into());
          }
          ConnectionState::Connected | ConnectionState::ClosingByRequest => {
            self.close_unclean(&mut block, "connection lost".into());
          }
          _ => {}
        }
      }
    }
  }

  /// Writes queued messages in order, then the close frame once they are out.
  fn on_writable(&self, wire: &mut dyn Wire) {
    let (state, close_request, close_sent) = {
      let block = self.state.lock();
      (block.state, block.close_request.clone(), block.close_sent)
    };
    if !state.is_established() {
      return;
    }

    let mut sent: Vec<String> = Vec::new();
    let mut failure = None;
    let drained = {
      let mut outbound = self.outbound.lock();
      while let Some(front) = outbound.front_mut() {
        if let Err(e) = wire.write(&mut front.buffer) {
          failure = Some(e.to_string());
          break;
        }
        if !front.buffer.is_complete() {
          trace!(conn_id = self.id, written = front.buffer.bytes_written(), "Partial write; waiting for writable");
          wire.request_writable();
          break;
        }
        if let Some(done) = outbound.pop_front() {
          trace!(conn_id = self.id, len = done.buffer.payload_len(), "Message written");
          sent.extend(done.text);
        }
      }
      outbound.is_empty()
    };
    self.deliveries.extend(sent.into_iter().map(Delivery::Sent));

    if let Some(reason) = failure {
      let mut block = self.state.lock();
      if block.state.is_established() {
        self.close_unclean(&mut block, reason);
      }
      return;
    }

    if state == ConnectionState::ClosingByRequest && drained && !close_sent {
      if let Some(request) = close_request {
        debug!(conn_id = self.id, code = request.code, "Sending close frame");
        wire.close(request.code, &request.reason);
        self.state.lock().close_sent = true;
      }
    }
  }
}

impl ThreadedWork for WebSocketConnection {
  fn start_on_thread(&self) -> bool {
    let mut block = self.state.lock();
    if block.state != ConnectionState::StartConnecting {
      warn!(conn_id = self.id, state = %block.state, "Start skipped; unexpected state");
      return false;
    }
    let target = match parse_target(&self.url) {
      Ok(target) => target,
      Err(e) => {
        self.fail(&mut block, e.to_string());
        return false;
      }
    };
    self.transition(&mut block, ConnectionState::Connecting);
    drop(block);

    match self.connector.connect(&target, &self.protocols, &self.headers) {
      Ok(wire) => {
        self.io.lock().wire = Some(wire);
        true
      }
      Err(e) => {
        self.fail(&mut self.state.lock(), e.to_string());
        false
      }
    }
  }

  fn tick_on_thread(&self, elapsed: Duration) {
    let mut io = self.io.lock();
    let Some(mut wire) = io.wire.take() else {
      return;
    };
    if self.wants_writable.swap(false, Ordering::AcqRel) {
      wire.request_writable();
    }

    let mut events = std::mem::take(&mut io.events);
    wire.service(elapsed, &mut events);
    for event in events.drain(..) {
      self.handle_event(wire.as_mut(), &mut io.assembler, event);
      if self.state().is_terminal() {
        break;
      }
    }
    events.clear();
    io.events = events;

    if self.state().is_terminal() {
      wire.teardown();
    } else {
      io.wire = Some(wire);
    }
  }

  fn is_complete_on_thread(&self) -> bool {
    self.state().is_terminal()
  }

  fn finish_on_thread(&self) {
    if let Some(mut wire) = self.io.lock().wire.take() {
      wire.teardown();
    }
    let discarded = {
      let mut outbound = self.outbound.lock();
      let n = outbound.len();
      outbound.clear();
      n
    };
    let mut block = self.state.lock();
    if !block.state.is_terminal() {
      if block.state.is_established() {
        self.close_unclean(&mut block, "connection aborted".into());
      } else {
        self.fail(&mut block, "connection aborted".into());
      }
    }
    debug!(conn_id = self.id, state = %block.state, discarded, "Connection finished on transport thread");
  }

  fn describe(&self) -> String {
    format!("ws#{} {} [{}]", self.id, self.url, self.state())
  }
}
