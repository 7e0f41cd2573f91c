//! Error classification and the per-kind recovery table.

use crate::error::{Error, ErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Recovery callback invoked with the failure it was registered for.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// What the event loop does after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Connection stays open; the reply for the failed line is dropped.
    Recovered,
    /// Connection is removed and closed; the loop continues.
    Dropped,
    /// No handler for this kind; the service stops.
    Fatal,
}

/// Mapping from [`ErrorKind`] to a recovery callback.
///
/// Shared between the controller (which edits it) and the event loop
/// (which consults it), so entries can change while the service runs.
#[derive(Default)]
pub struct ErrorDispatchTable {
    handlers: RwLock<HashMap<ErrorKind, ErrorCallback>>,
}

impl ErrorDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind`, replacing any earlier one.
    pub fn insert(&self, kind: ErrorKind, callback: ErrorCallback) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(kind, callback);
        }
    }

    /// Unregister the callback for `kind`. Absent kinds are ignored.
    pub fn remove(&self, kind: &ErrorKind) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.remove(kind).is_some(),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, kind: &ErrorKind) -> Option<ErrorCallback> {
        self.handlers.read().ok()?.get(kind).cloned()
    }

    /// Decide what happens after `err`, running its callback if one exists.
    ///
    /// Protocol violations and resets always drop the connection; a
    /// callback registered for them only observes the failure. The lock
    /// is released before the callback runs.
    pub fn classify(&self, err: &Error) -> Disposition {
        let callback = self.get(err.kind());

        if err.kind().drops_connection() {
            if let Some(callback) = callback {
                callback(err);
            }
            return Disposition::Dropped;
        }

        match callback {
            Some(callback) => {
                trace!(kind = %err.kind(), "Running recovery callback");
                callback(err);
                Disposition::Recovered
            }
            None => {
                debug!(kind = %err.kind(), "No recovery callback registered");
                Disposition::Fatal
            }
        }
    }
}

impl std::fmt::Debug for ErrorDispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ErrorKind> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ErrorDispatchTable")
            .field("kinds", &kinds)
            .finish()
    }
}
