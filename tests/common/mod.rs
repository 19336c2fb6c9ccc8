// tests/common/mod.rs
#![allow(dead_code)] // Each test binary uses a different subset

use rtransport::config::{SchedulingMode, ThreadPacing};
use rtransport::websocket::buffer::SendBuffer;
use rtransport::websocket::frame::{Decoded, FrameDecoder};
use rtransport::websocket::{Target, WebSocket, WebSocketsManager, Wire, WireConnector, WireEvent};
use rtransport::{HttpConfig, TransportError, WebSocketConfig};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG env variable
    let default_filter = "rtransport=debug,warn";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

pub const BACKENDS: [SchedulingMode; 2] = [SchedulingMode::Threaded, SchedulingMode::Cooperative];
pub const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Short frames so threaded tests don't wait on the default idle sleep.
pub fn fast_pacing() -> ThreadPacing {
  ThreadPacing {
    active_frame_time: Duration::from_millis(1),
    active_min_sleep: Duration::from_millis(1),
    idle_frame_time: Duration::from_millis(2),
    idle_min_sleep: Duration::from_millis(1),
  }
}

pub fn ws_config(mode: SchedulingMode) -> WebSocketConfig {
  WebSocketConfig {
    scheduling: mode,
    pacing: fast_pacing(),
    ..Default::default()
  }
}

pub fn http_config(mode: SchedulingMode) -> HttpConfig {
  HttpConfig {
    scheduling: mode,
    pacing: fast_pacing(),
    flush_sleep: Duration::from_millis(1),
    ..Default::default()
  }
}

pub fn ws_manager(mode: SchedulingMode, connector: Arc<ScriptedConnector>) -> WebSocketsManager {
  setup_tracing();
  let manager = WebSocketsManager::with_connector(ws_config(mode), connector);
  manager.initialize().expect("initialize");
  manager
}

/// Ticks `manager` until `cond` holds. Returns false on timeout.
pub fn pump_until(manager: &WebSocketsManager, mut cond: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  loop {
    manager.tick();
    if cond() {
      return true;
    }
    if start.elapsed() > PUMP_TIMEOUT {
      return false;
    }
    std::thread::sleep(Duration::from_millis(1));
  }
}

/// Ticks `manager` a fixed number of times.
pub fn pump_for(manager: &WebSocketsManager, ticks: usize) {
  for _ in 0..ticks {
    manager.tick();
    std::thread::sleep(Duration::from_millis(1));
  }
}

// --- Recorded socket events ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  Connected,
  Message(String),
  Raw(Vec<u8>, usize),
  Closed(u16, String, bool),
  Error(String),
  Sent(String),
}

impl Event {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Event::Closed(..) | Event::Error(_))
  }
}

#[derive(Clone, Default)]
pub struct EventLog {
  events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
  /// Binds connected, closed and error observers.
  pub fn attach(ws: &WebSocket) -> Self {
    let log = Self::default();
    let l = log.clone();
    ws.on_connected(move || l.push(Event::Connected));
    let l = log.clone();
    ws.on_closed(move |code, reason, clean| l.push(Event::Closed(code, reason.to_string(), clean)));
    let l = log.clone();
    ws.on_connection_error(move |reason| l.push(Event::Error(reason.to_string())));
    log
  }

  /// Also binds message, raw message and message-sent observers.
  pub fn attach_all(ws: &WebSocket) -> Self {
    let log = Self::attach(ws);
    let l = log.clone();
    ws.on_message(move |text| l.push(Event::Message(text.to_string())));
    let l = log.clone();
    ws.on_raw_message(move |data, remaining| l.push(Event::Raw(data.to_vec(), remaining)));
    let l = log.clone();
    ws.on_message_sent(move |text| l.push(Event::Sent(text.to_string())));
    log
  }

  pub fn push(&self, event: Event) {
    self.events.lock().unwrap().push(event);
  }

  pub fn events(&self) -> Vec<Event> {
    self.events.lock().unwrap().clone()
  }

  pub fn terminal_count(&self) -> usize {
    self.events().iter().filter(|e| e.is_terminal()).count()
  }

  pub fn connected_count(&self) -> usize {
    self.events().iter().filter(|e| **e == Event::Connected).count()
  }

  pub fn has_terminal(&self) -> bool {
    self.terminal_count() > 0
  }
}

// --- Scripted wire ---

/// What a fake wire was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireAction {
  /// A complete frame, unmasked: (is_binary, payload).
  Frame(bool, Vec<u8>),
  Close(u16, String),
  TornDown,
}

/// Controls one fake wire from the test thread.
#[derive(Default)]
pub struct WireScript {
  pub target: Mutex<Option<Target>>,
  pub protocols: Mutex<Vec<String>>,
  pub headers: Mutex<Vec<(String, String)>>,
  incoming: Mutex<VecDeque<WireEvent>>,
  actions: Mutex<Vec<WireAction>>,
  raw_written: Mutex<BytesMut>,
  writable_requests: Mutex<usize>,
  write_calls: Mutex<usize>,
  /// Bytes accepted per `write` call; `None` takes everything.
  write_budget: Mutex<Option<usize>>,
  /// Answer a local close with a matching `Closed` event.
  pub ack_close: Mutex<bool>,
}

impl WireScript {
  /// Queues an event for the wire's next `service`.
  pub fn push(&self, event: WireEvent) {
    self.incoming.lock().unwrap().push_back(event);
  }

  pub fn establish(&self, protocol: Option<&str>) {
    self.push(WireEvent::Established {
      protocol: protocol.map(str::to_string),
    });
  }

  pub fn actions(&self) -> Vec<WireAction> {
    self.actions.lock().unwrap().clone()
  }

  pub fn frames(&self) -> Vec<Vec<u8>> {
    self
      .actions()
      .into_iter()
      .filter_map(|a| match a {
        WireAction::Frame(_, payload) => Some(payload),
        _ => None,
      })
      .collect()
  }

  pub fn writable_requests(&self) -> usize {
    *self.writable_requests.lock().unwrap()
  }

  pub fn write_calls(&self) -> usize {
    *self.write_calls.lock().unwrap()
  }

  pub fn set_write_budget(&self, budget: Option<usize>) {
    *self.write_budget.lock().unwrap() = budget;
  }

  pub fn torn_down(&self) -> bool {
    self.actions().contains(&WireAction::TornDown)
  }

  /// Decodes every complete frame written so far into actions.
  fn decode_written(&self) {
    let mut raw = self.raw_written.lock().unwrap();
    let mut decoder = FrameDecoder::new(usize::MAX);
    let mut message = Vec::new();
    let mut consumed_total = raw.clone();
    let mut frames = Vec::new();
    while let Ok(Some(decoded)) = decoder.decode(&mut consumed_total) {
      if let Decoded::Data {
        payload, fin, is_binary, remaining, ..
      } = decoded
      {
        message.extend_from_slice(&payload);
        if fin && remaining == 0 {
          frames.push(WireAction::Frame(is_binary, std::mem::take(&mut message)));
        }
      }
    }
    if !message.is_empty() {
      // Incomplete frame stays in the raw buffer until it finishes.
      return;
    }
    raw.clear();
    self.actions.lock().unwrap().extend(frames);
  }
}

struct FakeWire {
  script: Arc<WireScript>,
  writable_requested: bool,
  finished: bool,
}

impl Wire for FakeWire {
  fn service(&mut self, _elapsed: Duration, events: &mut Vec<WireEvent>) {
    if self.finished {
      return;
    }
    let incoming: Vec<WireEvent> = self.script.incoming.lock().unwrap().drain(..).collect();
    for event in incoming {
      let ends = matches!(
        event,
        WireEvent::Closed { .. } | WireEvent::ConnectionError(_) | WireEvent::Destroyed
      );
      events.push(event);
      if ends {
        self.finished = true;
        return;
      }
    }
    if self.writable_requested {
      self.writable_requested = false;
      events.push(WireEvent::Writable);
    }
  }

  fn request_writable(&mut self) {
    self.writable_requested = true;
    *self.script.writable_requests.lock().unwrap() += 1;
  }

  fn write(&mut self, buf: &mut SendBuffer) -> Result<(), TransportError> {
    *self.script.write_calls.lock().unwrap() += 1;
    let budget = self.script.write_budget.lock().unwrap().unwrap_or(usize::MAX);
    let take = buf.unwritten().len().min(budget);
    self
      .script
      .raw_written
      .lock()
      .unwrap()
      .extend_from_slice(&buf.unwritten()[..take]);
    buf.advance(take);
    if buf.is_complete() {
      self.script.decode_written();
    }
    Ok(())
  }

  fn close(&mut self, code: u16, reason: &str) {
    self
      .script
      .actions
      .lock()
      .unwrap()
      .push(WireAction::Close(code, reason.to_string()));
    if *self.script.ack_close.lock().unwrap() {
      self.script.push(WireEvent::Closed {
        code,
        reason: reason.to_string(),
      });
    }
  }

  fn teardown(&mut self) {
    self.finished = true;
    self.script.actions.lock().unwrap().push(WireAction::TornDown);
  }
}

/// Hands out fake wires and keeps their scripts for the test to drive.
#[derive(Default)]
pub struct ScriptedConnector {
  scripts: Mutex<Vec<Arc<WireScript>>>,
  /// When set, `connect` fails with this reason.
  pub refuse: Mutex<Option<String>>,
  attempts: Mutex<usize>,
}

impl ScriptedConnector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn attempts(&self) -> usize {
    *self.attempts.lock().unwrap()
  }

  pub fn script(&self, index: usize) -> Arc<WireScript> {
    self.scripts.lock().unwrap()[index].clone()
  }

  pub fn script_count(&self) -> usize {
    self.scripts.lock().unwrap().len()
  }
}

impl WireConnector for ScriptedConnector {
  fn connect(
    &self,
    target: &Target,
    protocols: &[String],
    headers: &[(String, String)],
  ) -> Result<Box<dyn Wire>, TransportError> {
    *self.attempts.lock().unwrap() += 1;
    if let Some(reason) = self.refuse.lock().unwrap().clone() {
      return Err(TransportError::ConnectionRefused(reason));
    }
    let script = Arc::new(WireScript::default());
    *script.ack_close.lock().unwrap() = true;
    *script.target.lock().unwrap() = Some(target.clone());
    *script.protocols.lock().unwrap() = protocols.to_vec();
    *script.headers.lock().unwrap() = headers.to_vec();
    self.scripts.lock().unwrap().push(script.clone());
    Ok(Box::new(FakeWire {
      script,
      writable_requested: false,
      finished: false,
    }))
  }
}

/// Connects `ws` and waits for its wire to exist. Returns the wire's script.
pub fn connect_scripted(manager: &WebSocketsManager, connector: &ScriptedConnector, ws: &WebSocket) -> Arc<WireScript> {
  let before = connector.script_count();
  ws.connect();
  assert!(
    pump_until(manager, || connector.script_count() > before),
    "wire was never opened"
  );
  connector.script(before)
}
