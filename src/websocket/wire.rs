// src/websocket/wire.rs

//! The underlying transport a [`WebSocketConnection`](super::connection::WebSocketConnection)
//! drives. A wire owns the socket, the upgrade handshake and the framing, and
//! reports what happened through [`WireEvent`]s each time it is serviced.

use crate::config::WebSocketConfig;
use crate::error::TransportError;
use crate::net::{NetStream, PendingConnect};
use crate::websocket::buffer::{ReceiveBuffer, SendBuffer};
use crate::websocket::frame::{self, Decoded, FrameDecoder, Opcode, CLOSE_PROTOCOL_ERROR};
use crate::websocket::handshake;
use crate::websocket::target::Target;

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Notifications produced while servicing a wire, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
  /// Upgrade completed. Carries the subprotocol the server selected.
  Established { protocol: Option<String> },
  /// A chunk of inbound message payload.
  Receive(ReceiveBuffer),
  /// The wire can take outbound data. Only sent after `request_writable`.
  Writable,
  /// The peer started the close handshake; the wire has answered it.
  PeerClosing { code: u16, reason: String },
  /// The connection finished closing.
  Closed { code: u16, reason: String },
  /// Fatal failure.
  ConnectionError(String),
  /// Torn down without a close or error, e.g. the connect timeout fired.
  Destroyed,
}

/// One underlying connection, serviced from the transport thread only.
pub trait Wire: Send {
  /// Performs pending I/O and appends what happened to `events`.
  fn service(&mut self, elapsed: Duration, events: &mut Vec<WireEvent>);

  /// Asks for a single [`WireEvent::Writable`] on a following `service`.
  fn request_writable(&mut self);

  /// Writes as much of `buf` as the socket takes, advancing `buf.bytes_written()`.
  fn write(&mut self, buf: &mut SendBuffer) -> Result<(), TransportError>;

  /// Sends a close frame and waits for the peer's answer.
  fn close(&mut self, code: u16, reason: &str);

  /// Drops the connection immediately. No further events are produced.
  fn teardown(&mut self);
}

/// Opens wires. Swappable so connections can run over something other than TCP.
pub trait WireConnector: Send + Sync {
  fn connect(
    &self,
    target: &Target,
    protocols: &[String],
    headers: &[(String, String)],
  ) -> Result<Box<dyn Wire>, TransportError>;
}

/// Connector for [`TcpWire`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
  config: WebSocketConfig,
}

impl TcpConnector {
  pub fn new(config: WebSocketConfig) -> Self {
    Self { config }
  }
}

impl WireConnector for TcpConnector {
  fn connect(
    &self,
    target: &Target,
    protocols: &[String],
    headers: &[(String, String)],
  ) -> Result<Box<dyn Wire>, TransportError> {
    let pending = PendingConnect::start(&target.host, target.port, target.tls)?;
    let key = handshake::generate_key();
    let request = handshake::build_request(target, &key, protocols, headers, &self.config.user_agent);
    Ok(Box::new(TcpWire {
      url: target.url.clone(),
      key,
      protocols: protocols.to_vec(),
      config: self.config.clone(),
      phase: Phase::Connecting(pending),
      request,
      request_written: 0,
      read_buf: BytesMut::with_capacity(READ_CHUNK),
      decoder: FrameDecoder::new(self.config.max_frame_size),
      control_out: BytesMut::new(),
      mid_frame: false,
      writable_requested: false,
      age: Duration::ZERO,
      since_ping: Duration::ZERO,
      closing_for: Duration::ZERO,
      close_sent: false,
    }))
  }
}

enum Phase {
  Connecting(PendingConnect),
  Handshake(NetStream),
  Open(NetStream),
  /// Our close frame is out; waiting for the peer's.
  Closing(NetStream),
  Finished,
}

impl Phase {
  fn name(&self) -> &'static str {
    match self {
      Phase::Connecting(_) => "connecting",
      Phase::Handshake(_) => "handshake",
      Phase::Open(_) => "open",
      Phase::Closing(_) => "closing",
      Phase::Finished => "finished",
    }
  }

  fn stream(&mut self) -> Option<&mut NetStream> {
    match self {
      Phase::Handshake(s) | Phase::Open(s) | Phase::Closing(s) => Some(s),
      _ => None,
    }
  }
}

/// RFC 6455 client over a non-blocking TCP or TLS stream.
pub struct TcpWire {
  url: String,
  key: String,
  protocols: Vec<String>,
  config: WebSocketConfig,
  phase: Phase,
  request: Vec<u8>,
  request_written: usize,
  read_buf: BytesMut,
  decoder: FrameDecoder,
  /// Whole control frames waiting to go out.
  control_out: BytesMut,
  /// A data frame is partially written; control frames must wait.
  mid_frame: bool,
  writable_requested: bool,
  age: Duration,
  since_ping: Duration,
  closing_for: Duration,
  close_sent: bool,
}

impl fmt::Debug for TcpWire {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TcpWire")
      .field("url", &self.url)
      .field("phase", &self.phase.name())
      .field("close_sent", &self.close_sent)
      .finish_non_exhaustive()
  }
}

enum ReadOutcome {
  Progress,
  Eof,
}

impl TcpWire {
  fn finish(&mut self) {
    if let Some(stream) = self.phase.stream() {
      stream.shutdown();
    }
    self.phase = Phase::Finished;
  }

  fn fail(&mut self, reason: String, events: &mut Vec<WireEvent>) {
    debug!(url = %self.url, phase = self.phase.name(), "Wire failed: {}", reason);
    self.finish();
    events.push(WireEvent::ConnectionError(reason));
  }

  fn queue_control(&mut self, opcode: Opcode, payload: &[u8]) {
    let frame = SendBuffer::with_opcode(payload, opcode, rand::random());
    self.control_out.extend_from_slice(frame.unwritten());
  }

  /// Writes queued control frames unless a data frame is half written.
  fn flush_control(&mut self) -> io::Result<()> {
    if self.mid_frame {
      return Ok(());
    }
    let Some(stream) = self.phase.stream() else {
      return Ok(());
    };
    while !self.control_out.is_empty() {
      match stream.write(&self.control_out) {
        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => self.control_out.advance(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  fn read_available(&mut self) -> io::Result<ReadOutcome> {
    let Some(stream) = self.phase.stream() else {
      return Ok(ReadOutcome::Progress);
    };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
      match stream.read(&mut chunk) {
        Ok(0) => return Ok(ReadOutcome::Eof),
        Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Progress),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      }
    }
  }

  fn service_connecting(&mut self, events: &mut Vec<WireEvent>) {
    let Phase::Connecting(pending) = &mut self.phase else {
      return;
    };
    match pending.poll() {
      Ok(Some(stream)) => {
        trace!(url = %self.url, "Socket connected, sending upgrade request");
        self.phase = Phase::Handshake(stream);
      }
      Ok(None) => {}
      Err(e) => self.fail(e.to_string(), events),
    }
  }

  fn service_handshake(&mut self, events: &mut Vec<WireEvent>) {
    let Phase::Handshake(stream) = &mut self.phase else {
      return;
    };
    while self.request_written < self.request.len() {
      match stream.write(&self.request[self.request_written..]) {
        Ok(0) => return self.fail("connection closed during upgrade".into(), events),
        Ok(n) => self.request_written += n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return self.fail(e.to_string(), events),
      }
    }
    // A server refusing the upgrade may hang up right after answering.
    let eof = match self.read_available() {
      Ok(ReadOutcome::Progress) => false,
      Ok(ReadOutcome::Eof) => true,
      Err(e) => return self.fail(e.to_string(), events),
    };
    match handshake::parse_response(&self.read_buf, &self.key, &self.protocols) {
      Ok(Some(response)) => {
        self.read_buf.advance(response.head_len);
        let Phase::Handshake(stream) = std::mem::replace(&mut self.phase, Phase::Finished) else {
          return;
        };
        self.phase = Phase::Open(stream);
        debug!(url = %self.url, protocol = ?response.protocol, "WebSocket upgrade complete");
        events.push(WireEvent::Established {
          protocol: response.protocol,
        });
      }
      Ok(None) if eof => self.fail("connection closed during upgrade".into(), events),
      Ok(None) => {}
      Err(e) => self.fail(e.to_string(), events),
    }
  }

  fn service_open(&mut self, elapsed: Duration, events: &mut Vec<WireEvent>) {
    let eof = match self.read_available() {
      Ok(ReadOutcome::Progress) => false,
      Ok(ReadOutcome::Eof) => true,
      Err(e) => return self.fail(e.to_string(), events),
    };

    loop {
      match self.decoder.decode(&mut self.read_buf) {
        Ok(Some(Decoded::Data {
          payload,
          remaining,
          fin,
          is_binary,
        })) => {
          if matches!(self.phase, Phase::Open(_)) {
            events.push(WireEvent::Receive(ReceiveBuffer::new(payload, remaining, is_binary, fin)));
          }
        }
        Ok(Some(Decoded::Control { opcode, payload })) => match opcode {
          Opcode::Ping => {
            trace!(url = %self.url, "Ping received, answering");
            self.queue_control(Opcode::Pong, &payload);
          }
          Opcode::Pong => trace!(url = %self.url, "Pong received"),
          Opcode::Close => {
            let (code, reason) = frame::parse_close_payload(&payload);
            if !self.close_sent {
              debug!(url = %self.url, code, %reason, "Peer initiated close");
              events.push(WireEvent::PeerClosing {
                code,
                reason: reason.clone(),
              });
              self.queue_control(Opcode::Close, &frame::close_payload(code, ""));
              let _ = self.flush_control();
            } else {
              debug!(url = %self.url, code, "Close handshake completed");
            }
            self.finish();
            events.push(WireEvent::Closed { code, reason });
            return;
          }
          _ => {}
        },
        Ok(None) => break,
        Err(e) => {
          warn!(url = %self.url, "Inbound protocol violation: {}", e);
          self.queue_control(Opcode::Close, &frame::close_payload(CLOSE_PROTOCOL_ERROR, ""));
          let _ = self.flush_control();
          return self.fail(e.to_string(), events);
        }
      }
    }

    if eof {
      return self.fail("connection closed by peer without a close frame".into(), events);
    }

    if let Some(interval) = self.config.ping_interval {
      self.since_ping += elapsed;
      if self.since_ping >= interval && matches!(self.phase, Phase::Open(_)) {
        self.since_ping = Duration::ZERO;
        self.queue_control(Opcode::Ping, &[]);
      }
    }

    if let Err(e) = self.flush_control() {
      return self.fail(e.to_string(), events);
    }

    if self.close_sent {
      self.closing_for += elapsed;
      if self.closing_for >= self.config.close_timeout {
        return self.fail("close handshake timed out".into(), events);
      }
    } else if self.writable_requested {
      self.writable_requested = false;
      events.push(WireEvent::Writable);
    }
  }
}

impl Wire for TcpWire {
  fn service(&mut self, elapsed: Duration, events: &mut Vec<WireEvent>) {
    if matches!(self.phase, Phase::Connecting(_) | Phase::Handshake(_)) {
      self.age += elapsed;
      if self.age >= self.config.connect_timeout {
        debug!(url = %self.url, phase = self.phase.name(), "Connect timeout; tearing down");
        self.finish();
        events.push(WireEvent::Destroyed);
        return;
      }
    }
    if matches!(self.phase, Phase::Connecting(_)) {
      self.service_connecting(events);
    }
    if matches!(self.phase, Phase::Handshake(_)) {
      self.service_handshake(events);
    }
    if matches!(self.phase, Phase::Open(_) | Phase::Closing(_)) {
      self.service_open(elapsed, events);
    }
  }

  fn request_writable(&mut self) {
    self.writable_requested = true;
  }

  fn write(&mut self, buf: &mut SendBuffer) -> Result<(), TransportError> {
    if !matches!(self.phase, Phase::Open(_)) {
      return Err(TransportError::InvalidState("wire is not open for writing"));
    }
    if buf.bytes_written() == 0 {
      self.flush_control()?;
      if !self.control_out.is_empty() {
        return Ok(());
      }
    }
    let Some(stream) = self.phase.stream() else {
      return Err(TransportError::ConnectionClosed);
    };
    while !buf.is_complete() {
      match stream.write(buf.unwritten()) {
        Ok(0) => return Err(TransportError::ConnectionClosed),
        Ok(n) => buf.advance(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(TransportError::from_io_endpoint(e, &self.url)),
      }
    }
    self.mid_frame = buf.bytes_written() > 0 && !buf.is_complete();
    Ok(())
  }

  fn close(&mut self, code: u16, reason: &str) {
    let Phase::Open(_) = &self.phase else {
      debug!(url = %self.url, phase = self.phase.name(), "Close on a wire that is not open; tearing down");
      self.finish();
      return;
    };
    self.queue_control(Opcode::Close, &frame::close_payload(code, reason));
    self.close_sent = true;
    self.closing_for = Duration::ZERO;
    if let Phase::Open(stream) = std::mem::replace(&mut self.phase, Phase::Finished) {
      self.phase = Phase::Closing(stream);
    }
    if let Err(e) = self.flush_control() {
      debug!(url = %self.url, "Failed to flush close frame: {}", e);
    }
  }

  fn teardown(&mut self) {
    if !matches!(self.phase, Phase::Finished) {
      trace!(url = %self.url, phase = self.phase.name(), "Wire torn down");
    }
    self.finish();
  }
}
