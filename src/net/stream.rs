// src/net/stream.rs

use crate::error::TransportError;

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use native_tls::{HandshakeError, MidHandshakeTlsStream, TlsConnector, TlsStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, trace};

/// TLS requirements for an outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
  /// Plain TCP.
  None,
  /// TLS with certificate and host name validation.
  Verified,
  /// TLS accepting self-signed or mismatched certificates.
  Insecure,
}

/// A connected, non-blocking byte stream.
pub enum NetStream {
  Plain(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl NetStream {
  fn tcp(&self) -> &TcpStream {
    match self {
      NetStream::Plain(s) => s,
      NetStream::Tls(s) => s.get_ref(),
    }
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    self.tcp().peer_addr()
  }

  /// Best-effort orderly shutdown of both directions.
  pub fn shutdown(&mut self) {
    if let NetStream::Tls(s) = self {
      let _ = s.shutdown();
    }
    let _ = self.tcp().shutdown(std::net::Shutdown::Both);
  }
}

impl Read for NetStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      NetStream::Plain(s) => s.read(buf),
      NetStream::Tls(s) => s.read(buf),
    }
  }
}

impl Write for NetStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    match self {
      NetStream::Plain(s) => s.write(buf),
      NetStream::Tls(s) => s.write(buf),
    }
  }

  fn flush(&mut self) -> io::Result<()> {
    match self {
      NetStream::Plain(s) => s.flush(),
      NetStream::Tls(s) => s.flush(),
    }
  }
}

impl fmt::Debug for NetStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self {
      NetStream::Plain(_) => "plain",
      NetStream::Tls(_) => "tls",
    };
    f.debug_struct("NetStream")
      .field("kind", &kind)
      .field("peer_addr", &self.peer_addr().ok())
      .finish()
  }
}

enum Stage {
  /// Non-blocking `connect` issued, waiting for the socket to become connected.
  Tcp { socket: Socket, addr: SocketAddr },
  /// TLS handshake in progress.
  Tls(MidHandshakeTlsStream<TcpStream>),
  /// Connected; handed out on the next poll.
  Ready(NetStream),
  Done,
}

/// A connection attempt advanced by repeated [`poll`](Self::poll) calls, so a
/// single servicing thread can drive many of them without blocking.
pub struct PendingConnect {
  host: String,
  endpoint: String,
  tls: TlsMode,
  stage: Stage,
  remaining_addrs: Vec<SocketAddr>,
}

impl fmt::Debug for PendingConnect {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stage = match &self.stage {
      Stage::Tcp { addr, .. } => format!("tcp({})", addr),
      Stage::Tls(_) => "tls".to_string(),
      Stage::Ready(_) => "ready".to_string(),
      Stage::Done => "done".to_string(),
    };
    f.debug_struct("PendingConnect")
      .field("endpoint", &self.endpoint)
      .field("tls", &self.tls)
      .field("stage", &stage)
      .finish_non_exhaustive()
  }
}

fn connect_in_progress(e: &io::Error) -> bool {
  if e.kind() == io::ErrorKind::WouldBlock {
    return true;
  }
  #[cfg(unix)]
  {
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
      return true;
    }
  }
  false
}

fn begin_tcp(addr: SocketAddr) -> io::Result<Socket> {
  let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  socket.set_nonblocking(true)?;
  match socket.connect(&addr.into()) {
    Ok(()) => Ok(socket),
    Err(e) if connect_in_progress(&e) => Ok(socket),
    Err(e) => Err(e),
  }
}

impl PendingConnect {
  /// Resolves `host:port` and issues a non-blocking connect to the first address.
  ///
  /// Name resolution itself is synchronous.
  pub fn start(host: &str, port: u16, tls: TlsMode) -> Result<Self, TransportError> {
    let endpoint = format!("{}:{}", host, port);
    let mut addrs: Vec<SocketAddr> = (host, port)
      .to_socket_addrs()
      .map_err(|e| TransportError::ResolutionFailed(format!("{}: {}", endpoint, e)))?
      .collect();
    if addrs.is_empty() {
      return Err(TransportError::ResolutionFailed(format!("{}: no addresses", endpoint)));
    }
    addrs.reverse();

    let mut last_err = None;
    while let Some(addr) = addrs.pop() {
      match begin_tcp(addr) {
        Ok(socket) => {
          debug!(%endpoint, %addr, ?tls, "Connect issued");
          return Ok(Self {
            host: host.to_string(),
            endpoint,
            tls,
            stage: Stage::Tcp { socket, addr },
            remaining_addrs: addrs,
          });
        }
        Err(e) => last_err = Some(e),
      }
    }
    let e = last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no usable address"));
    Err(TransportError::from_io_endpoint(e, &endpoint))
  }

  /// Advances the attempt. `Ok(None)` means "not yet"; call again next pass.
  pub fn poll(&mut self) -> Result<Option<NetStream>, TransportError> {
    loop {
      match mem::replace(&mut self.stage, Stage::Done) {
        Stage::Tcp { socket, addr } => match tcp_state(&socket) {
          Ok(true) => {
            let stream: TcpStream = socket.into();
            let _ = stream.set_nodelay(true);
            trace!(endpoint = %self.endpoint, %addr, "TCP connected");
            if self.tls == TlsMode::None {
              return Ok(Some(NetStream::Plain(stream)));
            }
            self.stage = self.begin_tls(stream)?;
          }
          Ok(false) => {
            self.stage = Stage::Tcp { socket, addr };
            return Ok(None);
          }
          Err(e) => {
            debug!(endpoint = %self.endpoint, %addr, "Connect failed: {}", e);
            match self.remaining_addrs.pop() {
              Some(next) => {
                let socket = begin_tcp(next).map_err(|e| TransportError::from_io_endpoint(e, &self.endpoint))?;
                self.stage = Stage::Tcp { socket, addr: next };
                return Ok(None);
              }
              None => return Err(TransportError::from_io_endpoint(e, &self.endpoint)),
            }
          }
        },
        Stage::Tls(mid) => match mid.handshake() {
          Ok(tls) => {
            trace!(endpoint = %self.endpoint, "TLS handshake complete");
            return Ok(Some(NetStream::Tls(Box::new(tls))));
          }
          Err(HandshakeError::WouldBlock(mid)) => {
            self.stage = Stage::Tls(mid);
            return Ok(None);
          }
          Err(HandshakeError::Failure(e)) => return Err(e.into()),
        },
        Stage::Ready(stream) => return Ok(Some(stream)),
        Stage::Done => return Err(TransportError::InvalidState("connect already finished")),
      }
    }
  }

  fn begin_tls(&self, stream: TcpStream) -> Result<Stage, TransportError> {
    let insecure = self.tls == TlsMode::Insecure;
    let connector = TlsConnector::builder()
      .danger_accept_invalid_certs(insecure)
      .danger_accept_invalid_hostnames(insecure)
      .build()?;
    match connector.connect(&self.host, stream) {
      Ok(tls) => Ok(Stage::Ready(NetStream::Tls(Box::new(tls)))),
      Err(HandshakeError::WouldBlock(mid)) => Ok(Stage::Tls(mid)),
      Err(HandshakeError::Failure(e)) => Err(e.into()),
    }
  }
}

/// `Ok(true)` once connected, `Ok(false)` while the connect is in flight.
fn tcp_state(socket: &Socket) -> io::Result<bool> {
  if let Some(e) = socket.take_error()? {
    return Err(e);
  }
  match SockRef::from(socket).peer_addr() {
    Ok(_) => Ok(true),
    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
    Err(e) if connect_in_progress(&e) => Ok(false),
    Err(e) => Err(e),
  }
}
