// src/websocket/handshake.rs

//! Client side of the HTTP upgrade that opens a WebSocket.

use crate::error::TransportError;
use crate::websocket::target::Target;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEADERS: usize = 64;

/// A fresh random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
  let nonce: [u8; 16] = rand::random();
  BASE64.encode(nonce)
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
pub fn accept_for_key(key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(key.as_bytes());
  hasher.update(ACCEPT_GUID.as_bytes());
  BASE64.encode(hasher.finalize())
}

/// Builds the upgrade request. Protocols are offered as one comma-separated header.
pub fn build_request(
  target: &Target,
  key: &str,
  protocols: &[String],
  extra_headers: &[(String, String)],
  user_agent: &str,
) -> Vec<u8> {
  let mut req = String::with_capacity(256);
  req.push_str(&format!("GET {} HTTP/1.1\r\n", target.resource));
  req.push_str(&format!("Host: {}\r\n", target.host_header()));
  req.push_str("Upgrade: websocket\r\n");
  req.push_str("Connection: Upgrade\r\n");
  req.push_str(&format!("Sec-WebSocket-Key: {}\r\n", key));
  req.push_str("Sec-WebSocket-Version: 13\r\n");
  if !protocols.is_empty() {
    req.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")));
  }
  if !user_agent.is_empty() {
    req.push_str(&format!("User-Agent: {}\r\n", user_agent));
  }
  for (name, value) in extra_headers {
    req.push_str(&format!("{}: {}\r\n", name, value));
  }
  req.push_str("\r\n");
  req.into_bytes()
}

/// A validated `101 Switching Protocols` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
  /// Bytes consumed by the response head. Anything after it is frame data.
  pub head_len: usize,
  /// Subprotocol the server selected, if any.
  pub protocol: Option<String>,
}

/// Parses the server's answer. `Ok(None)` means the head is still incomplete.
pub fn parse_response(buf: &[u8], key: &str, offered: &[String]) -> Result<Option<HandshakeResponse>, TransportError> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
  let mut response = httparse::Response::new(&mut headers);
  let head_len = match response.parse(buf)? {
    httparse::Status::Complete(n) => n,
    httparse::Status::Partial => return Ok(None),
  };

  let code = response.code.unwrap_or(0);
  if code != 101 {
    return Err(TransportError::Handshake(format!(
      "server answered {} {}",
      code,
      response.reason.unwrap_or("")
    )));
  }

  let header = |name: &str| {
    response
      .headers
      .iter()
      .find(|h| h.name.eq_ignore_ascii_case(name))
      .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
  };

  if !header("Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
    return Err(TransportError::Handshake("missing 'Upgrade: websocket'".into()));
  }
  if !header("Connection").is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))) {
    return Err(TransportError::Handshake("missing 'Connection: Upgrade'".into()));
  }
  if header("Sec-WebSocket-Accept").as_deref() != Some(accept_for_key(key).as_str()) {
    return Err(TransportError::Handshake("Sec-WebSocket-Accept mismatch".into()));
  }

  let protocol = header("Sec-WebSocket-Protocol").filter(|p| !p.is_empty());
  if let Some(selected) = &protocol {
    if !offered.iter().any(|p| p == selected) {
      return Err(TransportError::Handshake(format!("server selected unoffered protocol '{}'", selected)));
    }
  }

  Ok(Some(HandshakeResponse { head_len, protocol }))
}
