use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum TransportError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  // --- Address Errors ---
  #[error("Invalid URL: {0}")]
  InvalidUrl(String),
  #[error("Invalid protocol in URL '{0}': expected ws, wss or wss+insecure")]
  UnsupportedScheme(String),
  #[error("Address resolution failed: {0}")]
  ResolutionFailed(String),

  // --- Connection Errors ---
  #[error("Connection refused by peer: {0}")]
  ConnectionRefused(String),
  #[error("Connection closed by peer or transport")]
  ConnectionClosed,
  #[error("Operation timed out")]
  Timeout,

  // --- Security ---
  #[error("TLS error: {0}")]
  Tls(String),

  // --- Protocol Errors ---
  #[error("Handshake failed: {0}")]
  Handshake(String),
  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),

  // --- State Errors ---
  #[error("Operation is invalid for the current state: {0}")]
  InvalidState(&'static str),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

impl TransportError {
  /// Maps the common `io::ErrorKind`s seen while connecting onto specific variants.
  pub fn from_io_endpoint(e: io::Error, endpoint: &str) -> Self {
    match e.kind() {
      io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(endpoint.to_string()),
      io::ErrorKind::TimedOut => TransportError::Timeout,
      io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
        TransportError::ConnectionClosed
      }
      _ => TransportError::Io(e),
    }
  }
}

impl From<native_tls::Error> for TransportError {
  fn from(e: native_tls::Error) -> Self {
    TransportError::Tls(e.to_string())
  }
}

impl From<httparse::Error> for TransportError {
  fn from(e: httparse::Error) -> Self {
    TransportError::ProtocolViolation(format!("malformed HTTP response: {}", e))
  }
}
