//! rtransport - Background-thread HTTP and WebSocket transport.
//!
//! One transport thread per manager services every live connection; work is
//! handed in through lock-protected queues and results come back out through
//! the owning thread's `tick`.

pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod runtime;
pub mod websocket;

// Re-export core types for user convenience
pub use config::{HttpConfig, SchedulingMode, ThreadPacing, WebSocketConfig};
pub use error::TransportError;
pub use http::{FlushMode, HttpManager, HttpRequest, HttpResponse, RequestStatus, ThreadedRequest};
pub use runtime::{DeferredDestroyList, ThreadedWork, TransportThread};
pub use websocket::{ConnectionState, WebSocket, WebSocketsManager};

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

/// Returns the major version number of the library.
pub fn version_major() -> i32 {
  VERSION_MAJOR
}

/// Returns the minor version number of the library.
pub fn version_minor() -> i32 {
  VERSION_MINOR
}

/// Returns the patch version number of the library.
pub fn version_patch() -> i32 {
  VERSION_PATCH
}
