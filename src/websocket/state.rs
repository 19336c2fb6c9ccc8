// src/websocket/state.rs

use std::fmt;

/// Lifecycle of one WebSocket connection.
///
/// Transitions only move forward along the edges accepted by
/// [`ConnectionState::can_transition`]; `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
  #[default]
  None,
  StartConnecting,
  Connecting,
  Connected,
  ClosingByRequest,
  Closed,
  Error,
}

impl ConnectionState {
  pub fn is_terminal(self) -> bool {
    matches!(self, ConnectionState::Closed | ConnectionState::Error)
  }

  /// True for `Connected` and `ClosingByRequest`, the states in which the wire is established.
  pub fn is_established(self) -> bool {
    matches!(self, ConnectionState::Connected | ConnectionState::ClosingByRequest)
  }

  /// Whether `self -> next` is an edge of the connection state machine.
  pub fn can_transition(self, next: ConnectionState) -> bool {
    use ConnectionState::*;
    match (self, next) {
      (None, StartConnecting) => true,
      (StartConnecting, Connecting) => true,
      (Connecting, Connected) => true,
      (Connected, ClosingByRequest) => true,
      (Connected, Closed) | (ClosingByRequest, Closed) => true,
      (StartConnecting | Connecting | Connected | ClosingByRequest, Error) => true,
      _ => false,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ConnectionState::None => "None",
      ConnectionState::StartConnecting => "StartConnecting",
      ConnectionState::Connecting => "Connecting",
      ConnectionState::Connected => "Connected",
      ConnectionState::ClosingByRequest => "ClosingByRequest",
      ConnectionState::Closed => "Closed",
      ConnectionState::Error => "Error",
    }
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A close request stored by the owning thread until the wire can act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
  pub code: u16,
  pub reason: String,
}

/// How a connection that reached `Closed` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
  pub code: u16,
  pub reason: String,
  /// True only for a locally requested close that completed the close handshake.
  pub clean: bool,
}
