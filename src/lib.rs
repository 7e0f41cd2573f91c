//! lineserve: an embeddable line-oriented TCP request/response service.
//!
//! Clients send newline-terminated lines; each line is passed to a
//! caller-supplied handler and its reply is written back followed by a
//! newline, in order, on the same connection.
//!
//! Structure:
//! - `runtime`: listener, connection registry, readiness poll, and the
//!   accept and event-loop threads
//! - [`dispatch`]: error classification and per-kind recovery callbacks
//! - [`Service`]: start/stop/join and the public controls
//!
//! Failures raised by the handler (or by the transport) are classified by
//! [`ErrorKind`]:
//! - `ProtocolViolation` and `ConnectionReset` drop only the offending
//!   connection
//! - kinds with a registered callback are recovered in place; the reply
//!   for that line is dropped
//! - any other kind stops the event loop, reaches the fatal observer and
//!   is returned from [`Service::join`]
//!
//! The service emits `tracing` events but never installs a subscriber.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
mod runtime;
mod service;

pub use config::ServiceConfig;
pub use dispatch::{Disposition, ErrorCallback, ErrorDispatchTable};
pub use error::{Error, ErrorKind, Result, ServiceError};
pub use handler::MessageHandler;
pub use runtime::FatalObserver;
pub use service::Service;
