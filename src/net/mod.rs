// src/net/mod.rs

//! Non-blocking client sockets shared by the HTTP and WebSocket transports.

pub mod stream;

pub use stream::{NetStream, PendingConnect, TlsMode};
