//! Caller-supplied message handler.

use crate::error::{Error, ErrorKind};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Maps one inbound line (terminator stripped) to one reply line.
///
/// Returning an [`Error`] routes the failure through the error dispatch
/// table instead of replying.
pub type MessageHandler = Arc<dyn Fn(&str) -> Result<String, Error> + Send + Sync>;

/// Replaceable handler reference shared by the controller and event loop.
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<MessageHandler>>,
}

impl HandlerSlot {
    pub fn set<F>(&self, handler: F)
    where
        F: Fn(&str) -> Result<String, Error> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = None;
        }
    }

    fn current(&self) -> Option<MessageHandler> {
        self.handler.read().ok()?.clone()
    }

    /// Produce the reply for `line`. With no handler set the reply is empty.
    ///
    /// A panicking handler yields an [`ErrorKind::HandlerPanic`] error.
    pub fn reply(&self, line: &str) -> Result<String, Error> {
        let Some(handler) = self.current() else {
            return Ok(String::new());
        };
        panic::catch_unwind(AssertUnwindSafe(|| handler(line))).unwrap_or_else(|payload| {
            Err(Error::new(ErrorKind::HandlerPanic, panic_message(&*payload)))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
