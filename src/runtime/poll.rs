//! Bounded-wait readiness sampling.
//!
//! Wraps a `mio::Poll` and sorts the events of one wait into the sets the
//! event loop processes. A waker token lets other threads cut a wait short.

use crate::runtime::connection::ConnectionId;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the waker; never a slab key in practice.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// Connections reported by one poll cycle.
#[derive(Debug, Default)]
pub struct Readiness {
    /// Data available or peer closed its write side.
    pub readable: Vec<ConnectionId>,
    /// Queued replies can make progress.
    pub writable: Vec<ConnectionId>,
    /// Socket reports an error; no further I/O is safe.
    pub errored: Vec<ConnectionId>,
    /// The waker fired (stop request or new connections).
    pub woken: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errored.is_empty()
    }
}

pub struct ReadinessPoll {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl ReadinessPoll {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity.max(1)),
            waker,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Handle other threads use to interrupt [`poll`](Self::poll).
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Wait up to `timeout` for readiness.
    ///
    /// Returns empty sets when the timeout elapses or the wait is
    /// interrupted by a signal.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let mut ready = Readiness::default();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ready),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            match event.token() {
                WAKER_TOKEN => ready.woken = true,
                Token(id) => {
                    if event.is_error() {
                        ready.errored.push(id);
                        continue;
                    }
                    if event.is_readable() || event.is_read_closed() {
                        ready.readable.push(id);
                    }
                    if event.is_writable() {
                        ready.writable.push(id);
                    }
                }
            }
        }

        Ok(ready)
    }
}
