// src/websocket/bridge.rs

use crate::websocket::connection::{Delivery, EventInterest, WebSocketConnection};
use crate::websocket::state::ConnectionState;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

pub type ConnectedObserver = Arc<dyn Fn() + Send + Sync>;
pub type MessageObserver = Arc<dyn Fn(&str) + Send + Sync>;
/// Receives each inbound chunk and the bytes still to come in its frame.
pub type RawMessageObserver = Arc<dyn Fn(&[u8], usize) + Send + Sync>;
/// Receives status code, reason and whether the close was clean.
pub type ClosedObserver = Arc<dyn Fn(u16, &str, bool) + Send + Sync>;
pub type ErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;
pub type MessageSentObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Registered callbacks, each list invoked in registration order.
#[derive(Clone, Default)]
struct Observers {
  connected: Vec<ConnectedObserver>,
  message: Vec<MessageObserver>,
  raw_message: Vec<RawMessageObserver>,
  closed: Vec<ClosedObserver>,
  error: Vec<ErrorObserver>,
  message_sent: Vec<MessageSentObserver>,
}

#[derive(Debug, Default)]
struct Progress {
  last_observed: ConnectionState,
  connected_fired: bool,
  terminal_fired: bool,
}

/// Turns a connection's state changes into one-shot events on the owning thread.
#[derive(Default)]
pub struct GameThreadBridge {
  observers: Mutex<Observers>,
  progress: Mutex<Progress>,
}

impl fmt::Debug for GameThreadBridge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GameThreadBridge")
      .field("progress", &*self.progress.lock())
      .finish_non_exhaustive()
  }
}

impl GameThreadBridge {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_connected(&self, f: ConnectedObserver) {
    self.observers.lock().connected.push(f);
  }

  pub fn add_message(&self, f: MessageObserver) {
    self.observers.lock().message.push(f);
  }

  pub fn add_raw_message(&self, f: RawMessageObserver) {
    self.observers.lock().raw_message.push(f);
  }

  pub fn add_closed(&self, f: ClosedObserver) {
    self.observers.lock().closed.push(f);
  }

  pub fn add_error(&self, f: ErrorObserver) {
    self.observers.lock().error.push(f);
  }

  pub fn add_message_sent(&self, f: MessageSentObserver) {
    self.observers.lock().message_sent.push(f);
  }

  /// Deliveries the connection should buffer, based on the observers bound right now.
  pub fn interest(&self) -> EventInterest {
    let observers = self.observers.lock();
    let mut interest = EventInterest::empty();
    interest.set(EventInterest::MESSAGE, !observers.message.is_empty());
    interest.set(EventInterest::RAW_MESSAGE, !observers.raw_message.is_empty());
    interest.set(EventInterest::MESSAGE_SENT, !observers.message_sent.is_empty());
    interest
  }

  /// State as of the last tick.
  pub fn observed_state(&self) -> ConnectionState {
    self.progress.lock().last_observed
  }

  pub fn terminal_fired(&self) -> bool {
    self.progress.lock().terminal_fired
  }

  /// Fires whatever `connection` has produced since the previous call.
  ///
  /// Order within one call: connected, then buffered messages, then the
  /// terminal closed or error event. Returns true once the terminal event has
  /// been delivered; later calls do nothing.
  pub fn game_thread_tick(&self, connection: &WebSocketConnection) -> bool {
    // Deliveries are taken before the snapshot so none can predate a missed
    // connect, and again after it once terminal since none can follow.
    let mut deliveries = connection.take_deliveries();
    let snapshot = connection.snapshot();
    if snapshot.state.is_terminal() {
      deliveries.extend(connection.take_deliveries());
    }

    let (fire_connected, fire_terminal) = {
      let mut progress = self.progress.lock();
      if progress.terminal_fired {
        return true;
      }
      if progress.last_observed != snapshot.state {
        trace!(
          conn_id = connection.id(),
          from = %progress.last_observed,
          to = %snapshot.state,
          "State change observed"
        );
        progress.last_observed = snapshot.state;
      }
      let fire_connected = snapshot.was_connected && !progress.connected_fired;
      progress.connected_fired |= fire_connected;
      let fire_terminal = snapshot.state.is_terminal();
      progress.terminal_fired = fire_terminal;
      (fire_connected, fire_terminal)
    };

    // Invoked without holding any lock so observers may call back into the socket.
    let observers = self.observers.lock().clone();

    if fire_connected {
      for f in &observers.connected {
        f();
      }
    }

    for delivery in deliveries {
      match delivery {
        Delivery::Message(text) => observers.message.iter().for_each(|f| f(&text)),
        Delivery::Raw(chunk) => observers
          .raw_message
          .iter()
          .for_each(|f| f(&chunk.payload, chunk.bytes_remaining)),
        Delivery::Sent(text) => observers.message_sent.iter().for_each(|f| f(&text)),
      }
    }

    if fire_terminal {
      match snapshot.state {
        ConnectionState::Closed => {
          let (code, reason, clean) = snapshot
            .closure
            .map(|c| (c.code, c.reason, c.clean))
            .unwrap_or((0, String::new(), false));
          for f in &observers.closed {
            f(code, &reason, clean);
          }
        }
        _ => {
          let reason = snapshot.error.unwrap_or_default();
          for f in &observers.error {
            f(&reason);
          }
        }
      }
    }
    fire_terminal
  }
}
