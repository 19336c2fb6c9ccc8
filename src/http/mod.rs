// src/http/mod.rs

//! HTTP requests driven by a background transport thread.

pub mod client;
pub mod manager;
pub mod request;

pub use client::{HttpRequest, HttpRequestBuilder, HttpResponse};
pub use manager::{FlushMode, HttpManager};
pub use request::{RequestStatus, ThreadedRequest};
