//! Error types for the line service.
//!
//! Two layers:
//! - [`Error`]: a failure while serving a single line. Carries an
//!   [`ErrorKind`] used to look up a recovery callback.
//! - [`ServiceError`]: a failure of the service as a whole (bind, spawn,
//!   or an unhandled [`Error`] that stopped the event loop).

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for service-level operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Discriminator used to classify a failure for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The inbound line violates the application protocol.
    /// Always drops the offending connection.
    ProtocolViolation,
    /// The peer reset the transport (reset, aborted, broken pipe).
    /// Always drops the offending connection.
    ConnectionReset,
    /// Any other transport error, keyed by its I/O kind.
    Io(io::ErrorKind),
    /// The message handler panicked. Fatal unless a callback is registered.
    HandlerPanic,
    /// Caller-defined failure class.
    Application(Cow<'static, str>),
}

impl ErrorKind {
    /// Shorthand for an application-defined kind.
    pub fn application(name: impl Into<Cow<'static, str>>) -> Self {
        ErrorKind::Application(name.into())
    }

    /// Kinds that always cost the offending connection.
    pub fn drops_connection(&self) -> bool {
        matches!(self, ErrorKind::ProtocolViolation | ErrorKind::ConnectionReset)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ProtocolViolation => f.write_str("protocol violation"),
            ErrorKind::ConnectionReset => f.write_str("connection reset"),
            ErrorKind::Io(kind) => write!(f, "i/o error ({kind})"),
            ErrorKind::HandlerPanic => f.write_str("handler panicked"),
            ErrorKind::Application(name) => write!(f, "application error ({name})"),
        }
    }
}

/// A failure raised while serving one line.
///
/// Handlers return this to signal that a line could not be answered.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// The inbound line is malformed; the connection will be dropped.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    /// An application-defined failure, dispatched by `name`.
    pub fn application(name: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::application(name), message)
    }

    /// Attach an underlying cause.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => ErrorKind::ConnectionReset,
            other => ErrorKind::Io(other),
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Service-level errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The listening socket could not be created or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The configured host/port pair is not a socket address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// Polling or registration failed inside a service task.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A service thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    /// A line failed with a kind that has no registered handler.
    #[error("unhandled error: {0}")]
    Unhandled(#[source] Error),

    /// A service thread panicked.
    #[error("{0} thread panicked")]
    TaskPanicked(&'static str),
}
