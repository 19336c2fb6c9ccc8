// src/websocket/mod.rs

//! Client WebSockets driven by a shared transport thread.

pub mod bridge;
pub mod buffer;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod manager;
pub mod socket;
pub mod state;
pub mod target;
pub mod wire;

pub use buffer::{ReceiveBuffer, SendBuffer};
pub use connection::{EventInterest, WebSocketConnection};
pub use manager::WebSocketsManager;
pub use socket::WebSocket;
pub use state::{Closure, ConnectionState};
pub use target::{parse_target, Target};
pub use wire::{TcpConnector, TcpWire, Wire, WireConnector, WireEvent};
