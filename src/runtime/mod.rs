// src/runtime/mod.rs

//! Threading primitives: hand-off queues, the control mailbox, loop pacing,
//! deferred destruction and the transport thread itself.

pub mod deferred;
pub mod mailbox;
pub mod pacing;
pub mod queue;
pub mod thread;

pub use deferred::DeferredDestroyList;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender, ThreadControl};
pub use queue::LockedQueue;
pub use thread::{ThreadedWork, TransportThread, WorkSubmitter};
