// src/http/client.rs

use crate::error::TransportError;
use crate::http::request::{RequestStatus, ThreadedRequest};
use crate::net::{NetStream, PendingConnect, TlsMode};
use crate::runtime::ThreadedWork;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

const MAX_RESPONSE_HEADERS: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// Invoked once with the final status and, on success, the response.
pub type CompletionCallback = Box<dyn FnOnce(&RequestStatus, Option<&HttpResponse>) + Send>;
/// Invoked with total bytes sent and received whenever either changed.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status_code: u16,
  pub reason: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl HttpResponse {
  /// First header named `name`, compared case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

// --- URL handling ---

#[derive(Debug, Clone, PartialEq, Eq)]
struct Destination {
  host: String,
  port: u16,
  host_header: String,
  resource: String,
  tls: TlsMode,
}

fn parse_destination(url_str: &str) -> Result<Destination, TransportError> {
  let url = Url::parse(url_str).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url_str, e)))?;
  let tls = match url.scheme() {
    "http" => TlsMode::None,
    "https" => TlsMode::Verified,
    other => {
      return Err(TransportError::InvalidUrl(format!(
        "{}: unsupported scheme '{}'",
        url_str, other
      )))
    }
  };
  let host = match url.host() {
    Some(url::Host::Domain(d)) => d.to_string(),
    Some(url::Host::Ipv4(ip)) => ip.to_string(),
    Some(url::Host::Ipv6(ip)) => ip.to_string(),
    None => return Err(TransportError::InvalidUrl(format!("{}: missing host", url_str))),
  };
  let port = url
    .port_or_known_default()
    .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing port", url_str)))?;
  let bracketed = if host.contains(':') {
    format!("[{}]", host)
  } else {
    host.clone()
  };
  let host_header = match url.port() {
    Some(p) => format!("{}:{}", bracketed, p),
    None => bracketed,
  };
  let mut resource = url.path().to_string();
  if let Some(q) = url.query() {
    resource.push('?');
    resource.push_str(q);
  }
  Ok(Destination {
    host,
    port,
    host_header,
    resource,
    tls,
  })
}

// --- Wire exchange (transport thread only) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
  Empty,
  Length(usize),
  Chunked,
  UntilEof,
}

#[derive(Debug)]
struct Head {
  status_code: u16,
  reason: String,
  headers: Vec<(String, String)>,
  framing: Framing,
}

enum Phase {
  Connecting(PendingConnect),
  Streaming(NetStream),
}

struct Exchange {
  phase: Phase,
  outgoing: Vec<u8>,
  written: usize,
  inbound: BytesMut,
  received: u64,
  head: Option<Head>,
  body: BytesMut,
  is_head_request: bool,
  elapsed: Duration,
}

fn parse_head(buf: &[u8], is_head_request: bool) -> Result<Option<(usize, Head)>, TransportError> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
  let mut response = httparse::Response::new(&mut headers);
  let consumed = match response.parse(buf)? {
    httparse::Status::Complete(n) => n,
    httparse::Status::Partial => return Ok(None),
  };
  let status_code = response.code.unwrap_or(0);
  let headers: Vec<(String, String)> = response
    .headers
    .iter()
    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
    .collect();
  let find = |name: &str| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v);

  let framing = if is_head_request || (100..200).contains(&status_code) || status_code == 204 || status_code == 304 {
    Framing::Empty
  } else if find("Transfer-Encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
    Framing::Chunked
  } else if let Some(len) = find("Content-Length") {
    let len = len
      .parse::<usize>()
      .map_err(|_| TransportError::ProtocolViolation(format!("invalid Content-Length '{}'", len)))?;
    Framing::Length(len)
  } else {
    Framing::UntilEof
  };

  Ok(Some((
    consumed,
    Head {
      status_code,
      reason: response.reason.unwrap_or("").to_string(),
      headers,
      framing,
    },
  )))
}

/// Moves every complete chunk from `inbound` to `body`. Returns true after the last chunk.
fn decode_chunks(inbound: &mut BytesMut, body: &mut BytesMut) -> Result<bool, TransportError> {
  loop {
    let (consumed, size) = match httparse::parse_chunk_size(inbound) {
      Ok(httparse::Status::Complete(parsed)) => parsed,
      Ok(httparse::Status::Partial) => return Ok(false),
      Err(_) => return Err(TransportError::ProtocolViolation("invalid chunk size".into())),
    };
    if size == 0 {
      let rest = &inbound[consumed..];
      if rest.starts_with(b"\r\n") {
        inbound.advance(consumed + 2);
        return Ok(true);
      }
      // Trailer section.
      return match rest.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => {
          inbound.advance(consumed + end + 4);
          Ok(true)
        }
        None => Ok(false),
      };
    }
    let chunk_end = usize::try_from(size)
      .ok()
      .and_then(|size| consumed.checked_add(size))
      .and_then(|n| n.checked_add(2))
      .ok_or_else(|| TransportError::ProtocolViolation("chunk too large".into()))?;
    let size = chunk_end - consumed - 2;
    if inbound.len() < chunk_end {
      return Ok(false);
    }
    inbound.advance(consumed);
    body.extend_from_slice(&inbound[..size]);
    inbound.advance(size + 2);
  }
}

impl Exchange {
  /// Advances the exchange. `Ok(Some(_))` once the whole response arrived.
  fn step(&mut self) -> Result<Option<HttpResponse>, TransportError> {
    if let Phase::Connecting(pending) = &mut self.phase {
      match pending.poll()? {
        Some(stream) => self.phase = Phase::Streaming(stream),
        None => return Ok(None),
      }
    }
    let Phase::Streaming(stream) = &mut self.phase else {
      return Ok(None);
    };

    while self.written < self.outgoing.len() {
      match stream.write(&self.outgoing[self.written..]) {
        Ok(0) => return Err(TransportError::ConnectionClosed),
        Ok(n) => self.written += n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }

    let mut eof = false;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
      match stream.read(&mut chunk) {
        Ok(0) => {
          eof = true;
          break;
        }
        Ok(n) => {
          self.received += n as u64;
          self.inbound.extend_from_slice(&chunk[..n]);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }

    // Interim 1xx heads are skipped.
    while self.head.is_none() {
      let Some((consumed, head)) = parse_head(&self.inbound, self.is_head_request)? else {
        break;
      };
      self.inbound.advance(consumed);
      if (100..200).contains(&head.status_code) {
        trace!(status = head.status_code, "Interim response skipped");
        continue;
      }
      self.head = Some(head);
    }

    let Some(head) = &self.head else {
      return if eof {
        Err(TransportError::ProtocolViolation("connection closed before response head".into()))
      } else {
        Ok(None)
      };
    };

    let done = match head.framing {
      Framing::Empty => true,
      Framing::Length(total) => {
        let take = (total - self.body.len()).min(self.inbound.len());
        self.body.extend_from_slice(&self.inbound.split_to(take));
        self.body.len() == total
      }
      Framing::Chunked => decode_chunks(&mut self.inbound, &mut self.body)?,
      Framing::UntilEof => {
        self.body.extend_from_slice(&self.inbound.split());
        eof
      }
    };

    if done {
      let Some(head) = self.head.take() else {
        return Ok(None);
      };
      return Ok(Some(HttpResponse {
        status_code: head.status_code,
        reason: head.reason,
        headers: head.headers,
        body: self.body.split().freeze(),
      }));
    }
    if eof {
      return Err(TransportError::ProtocolViolation(
        "connection closed before response body completed".into(),
      ));
    }
    Ok(None)
  }
}

// --- Request ---

#[derive(Default)]
struct Callbacks {
  on_complete: Option<CompletionCallback>,
  on_progress: Option<ProgressCallback>,
}

#[derive(Debug, Default)]
struct Outcome {
  status: RequestStatus,
  response: Option<HttpResponse>,
}

/// A single HTTP/1.1 request, run by an [`HttpManager`](super::HttpManager).
///
/// Created through [`HttpManager::create_request`](super::HttpManager::create_request).
pub struct HttpRequest {
  id: u64,
  verb: String,
  url: String,
  headers: Vec<(String, String)>,
  body: Bytes,
  timeout: Duration,
  user_agent: String,
  cancelled: AtomicBool,
  completion_fired: AtomicBool,
  bytes_sent: AtomicU64,
  bytes_received: AtomicU64,
  reported_progress: Mutex<(u64, u64)>,
  outcome: Mutex<Outcome>,
  exchange: Mutex<Option<Exchange>>,
  callbacks: Mutex<Callbacks>,
}

impl fmt::Debug for HttpRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpRequest")
      .field("id", &self.id)
      .field("verb", &self.verb)
      .field("url", &self.url)
      .field("status", &self.outcome.lock().status)
      .finish_non_exhaustive()
  }
}

impl HttpRequest {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn verb(&self) -> &str {
    &self.verb
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// The response, once the request succeeded.
  pub fn response(&self) -> Option<HttpResponse> {
    self.outcome.lock().response.clone()
  }

  pub fn bytes_sent(&self) -> u64 {
    self.bytes_sent.load(Ordering::Relaxed)
  }

  pub fn bytes_received(&self) -> u64 {
    self.bytes_received.load(Ordering::Relaxed)
  }

  fn set_status(&self, status: RequestStatus) {
    let mut outcome = self.outcome.lock();
    if outcome.status.is_finished() {
      return;
    }
    debug!(request_id = self.id, url = %self.url, %status, "Request status");
    outcome.status = status;
  }

  fn build_wire_request(&self, dest: &Destination) -> Vec<u8> {
    let has_header = |name: &str| self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.verb, dest.resource, dest.host_header);
    if !has_header("User-Agent") && !self.user_agent.is_empty() {
      head.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
    }
    let needs_length = !self.body.is_empty() || matches!(self.verb.as_str(), "POST" | "PUT" | "PATCH");
    if needs_length && !has_header("Content-Length") {
      head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
    }
    if !has_header("Connection") {
      head.push_str("Connection: close\r\n");
    }
    for (name, value) in &self.headers {
      head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(&self.body);
    out
  }

  fn report_progress(&self) {
    let on_progress = self.callbacks.lock().on_progress.clone();
    let Some(on_progress) = on_progress else {
      return;
    };
    let current = (self.bytes_sent(), self.bytes_received());
    {
      let mut reported = self.reported_progress.lock();
      if *reported == current {
        return;
      }
      *reported = current;
    }
    on_progress(current.0, current.1);
  }
}

impl ThreadedWork for HttpRequest {
  fn start_on_thread(&self) -> bool {
    if self.is_cancelled() {
      return false;
    }
    let exchange = parse_destination(&self.url).and_then(|dest| {
      let phase = Phase::Connecting(PendingConnect::start(&dest.host, dest.port, dest.tls)?);
      Ok(Exchange {
        phase,
        outgoing: self.build_wire_request(&dest),
        written: 0,
        inbound: BytesMut::with_capacity(READ_CHUNK),
        received: 0,
        head: None,
        body: BytesMut::new(),
        is_head_request: self.verb.eq_ignore_ascii_case("HEAD"),
        elapsed: Duration::ZERO,
      })
    });
    match exchange {
      Ok(exchange) => {
        *self.exchange.lock() = Some(exchange);
        self.set_status(RequestStatus::Processing);
        true
      }
      Err(e) => {
        self.set_status(RequestStatus::Failed(e.to_string()));
        false
      }
    }
  }

  fn tick_on_thread(&self, elapsed: Duration) {
    if self.is_cancelled() {
      return;
    }
    let mut guard = self.exchange.lock();
    let Some(exchange) = guard.as_mut() else {
      return;
    };
    exchange.elapsed += elapsed;
    let result = if exchange.elapsed >= self.timeout {
      Err(TransportError::Timeout)
    } else {
      exchange.step()
    };
    self.bytes_sent.store(exchange.written as u64, Ordering::Relaxed);
    self.bytes_received.store(exchange.received, Ordering::Relaxed);

    match result {
      Ok(None) => {}
      Ok(Some(response)) => {
        *guard = None;
        trace!(request_id = self.id, status = response.status_code, len = response.body.len(), "Response complete");
        self.outcome.lock().response = Some(response);
        self.set_status(RequestStatus::Succeeded);
      }
      Err(TransportError::Timeout) => {
        *guard = None;
        self.set_status(RequestStatus::Failed("request timed out".into()));
      }
      Err(e) => {
        *guard = None;
        self.set_status(RequestStatus::Failed(e.to_string()));
      }
    }
  }

  fn is_complete_on_thread(&self) -> bool {
    self.outcome.lock().status.is_finished()
  }

  fn finish_on_thread(&self) {
    // Dropping the exchange closes its socket.
    self.exchange.lock().take();
    if self.is_cancelled() {
      self.set_status(RequestStatus::Cancelled);
    } else {
      self.set_status(RequestStatus::Failed("request aborted".into()));
    }
  }

  fn describe(&self) -> String {
    format!("#{} {} {}", self.id, self.verb, self.url)
  }
}

impl ThreadedRequest for HttpRequest {
  fn tick(&self, _delta: Duration) {
    self.report_progress();
  }

  fn mark_cancelled(&self) -> bool {
    !self.cancelled.swap(true, Ordering::AcqRel)
  }

  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }

  fn finish_request(&self) {
    if self.completion_fired.swap(true, Ordering::AcqRel) {
      return;
    }
    self.report_progress();
    let on_complete = self.callbacks.lock().on_complete.take();
    let (status, response) = {
      let outcome = self.outcome.lock();
      (outcome.status.clone(), outcome.response.clone())
    };
    debug!(request_id = self.id, url = %self.url, %status, "Request complete");
    if let Some(f) = on_complete {
      f(&status, response.as_ref());
    }
  }

  fn unbind_callbacks(&self) {
    *self.callbacks.lock() = Callbacks::default();
  }

  fn status(&self) -> RequestStatus {
    self.outcome.lock().status.clone()
  }
}

/// Configures an [`HttpRequest`] before it is submitted.
pub struct HttpRequestBuilder {
  id: u64,
  verb: String,
  url: String,
  headers: Vec<(String, String)>,
  body: Bytes,
  timeout: Duration,
  user_agent: String,
  callbacks: Callbacks,
}

impl fmt::Debug for HttpRequestBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpRequestBuilder")
      .field("id", &self.id)
      .field("verb", &self.verb)
      .field("url", &self.url)
      .finish_non_exhaustive()
  }
}

impl HttpRequestBuilder {
  pub(crate) fn new(id: u64, verb: &str, url: &str, timeout: Duration, user_agent: &str) -> Self {
    Self {
      id,
      verb: verb.to_ascii_uppercase(),
      url: url.to_string(),
      headers: Vec::new(),
      body: Bytes::new(),
      timeout,
      user_agent: user_agent.to_string(),
      callbacks: Callbacks::default(),
    }
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn on_complete(mut self, f: impl FnOnce(&RequestStatus, Option<&HttpResponse>) + Send + 'static) -> Self {
    self.callbacks.on_complete = Some(Box::new(f));
    self
  }

  pub fn on_progress(mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
    self.callbacks.on_progress = Some(Arc::new(f));
    self
  }

  pub fn build(self) -> Arc<HttpRequest> {
    Arc::new(HttpRequest {
      id: self.id,
      verb: self.verb,
      url: self.url,
      headers: self.headers,
      body: self.body,
      timeout: self.timeout,
      user_agent: self.user_agent,
      cancelled: AtomicBool::new(false),
      completion_fired: AtomicBool::new(false),
      bytes_sent: AtomicU64::new(0),
      bytes_received: AtomicU64::new(0),
      reported_progress: Mutex::new((0, 0)),
      outcome: Mutex::new(Outcome::default()),
      exchange: Mutex::new(None),
      callbacks: Mutex::new(self.callbacks),
    })
  }
}
