//! Readiness-driven runtime behind a [`Service`](crate::Service).
//!
//! Two threads per running service:
//! - accept task: owns the `Listener`, hands accepted streams to the
//!   event loop over a bounded channel
//! - event loop: owns the `ConnectionRegistry`, polls, reads lines,
//!   dispatches them and writes replies
//!
//! Both block in `mio::Poll` with a bounded timeout and a waker, so a stop
//! request is observed promptly and the listener socket is always closed
//! by the time the accept thread exits.

mod accept;
mod connection;
mod event_loop;
mod listener;
mod poll;

pub(crate) use accept::AcceptTask;
pub(crate) use event_loop::EventLoop;
pub(crate) use listener::Listener;

use crate::dispatch::ErrorDispatchTable;
use crate::error::ServiceError;
use crate::handler::HandlerSlot;
use connection::ConnectionRegistry;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, RwLock};

/// Callback told about the error that stopped the event loop.
pub type FatalObserver = Arc<dyn Fn(&ServiceError) + Send + Sync>;

/// State shared between the controller and both tasks.
#[derive(Default)]
pub(crate) struct Shared {
    pub running: AtomicBool,
    /// Mirrors the registry size for `connection_count()`.
    pub connections: Arc<AtomicUsize>,
    pub handler: HandlerSlot,
    pub errors: ErrorDispatchTable,
    pub fatal_observer: RwLock<Option<FatalObserver>>,
    /// Connections left open by a fatal exit of the event loop.
    parked: Mutex<Option<ConnectionRegistry>>,
}

impl Shared {
    pub fn set_fatal_observer(&self, observer: FatalObserver) {
        if let Ok(mut slot) = self.fatal_observer.write() {
            *slot = Some(observer);
        }
    }

    pub fn notify_fatal(&self, err: &ServiceError) {
        let observer = self
            .fatal_observer
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(observer) = observer {
            observer(err);
        }
    }

    fn park(&self, registry: ConnectionRegistry) {
        if let Ok(mut parked) = self.parked.lock() {
            *parked = Some(registry);
        }
    }

    fn take_parked(&self) -> Option<ConnectionRegistry> {
        self.parked.lock().ok()?.take()
    }

    /// Close connections left behind by a fatal exit. Returns how many.
    pub fn close_parked(&self) -> usize {
        match self.take_parked() {
            Some(registry) => {
                let count = registry.count();
                // Dropping the registry drops (and closes) every stream
                drop(registry);
                count
            }
            None => 0,
        }
    }
}
