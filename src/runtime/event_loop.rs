//! Event loop: readiness polling, line dispatch and error classification.
//!
//! The loop is the only owner of the connection registry. Each cycle it
//! waits for readiness (bounded by the poll timeout), admits connections
//! handed over by the accept task, then processes the errored, readable
//! and writable sets in that order. A connection removed earlier in the
//! cycle is skipped.

use crate::config::ServiceConfig;
use crate::dispatch::Disposition;
use crate::error::{Error, ErrorKind, ServiceError};
use crate::runtime::accept::Handoff;
use crate::runtime::connection::{Connection, ConnectionId, ConnectionRegistry, Line};
use crate::runtime::poll::ReadinessPoll;
use crate::runtime::Shared;
use mio::{Token, Waker};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) struct EventLoop {
    poll: ReadinessPoll,
    registry: ConnectionRegistry,
    incoming: Receiver<Handoff>,
    shared: Arc<Shared>,
    accept_waker: Option<Arc<Waker>>,
    timeout: Duration,
    max_line_length: usize,
    /// Adopted connections whose buffered lines are answered first.
    adopted: Vec<ConnectionId>,
}

/// Clears the running flag if the loop thread unwinds.
struct PanicGuard<'a>(&'a Shared);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.running.store(false, Ordering::SeqCst);
        }
    }
}

impl EventLoop {
    /// Build the loop, adopting connections parked by an earlier fatal exit.
    pub fn new(
        config: &ServiceConfig,
        shared: Arc<Shared>,
        incoming: Receiver<Handoff>,
    ) -> io::Result<Self> {
        let poll = ReadinessPoll::new(config.event_capacity)?;
        let registry = match shared.take_parked() {
            Some(mut parked) => {
                if let Err(e) = parked.reregister_all(poll.registry()) {
                    parked.deregister_all(poll.registry());
                    shared.park(parked);
                    return Err(e);
                }
                debug!(connections = parked.count(), "Adopted parked connections");
                parked
            }
            None => ConnectionRegistry::new(Arc::clone(&shared.connections)),
        };
        let adopted = registry.snapshot();

        Ok(Self {
            poll,
            registry,
            incoming,
            shared,
            accept_waker: None,
            timeout: config.poll_timeout_duration(),
            max_line_length: config.max_line_length,
            adopted,
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.poll.waker()
    }

    /// Woken on a fatal exit so the accept task sees the cleared flag.
    pub fn set_accept_waker(&mut self, waker: Arc<Waker>) {
        self.accept_waker = Some(waker);
    }

    /// Run until stopped or until an unhandled error.
    ///
    /// On stop every connection is closed. On an unhandled error the
    /// running flag is cleared, the fatal observer is notified once and
    /// open connections are parked, still open, for the controller.
    pub fn run(mut self) -> Result<(), ServiceError> {
        let shared = Arc::clone(&self.shared);
        let _guard = PanicGuard(&shared);
        info!("Event loop started");

        match self.serve() {
            Ok(()) => {
                let connections = self.registry.count();
                if !self.registry.is_empty() {
                    self.registry.close_all(self.poll.registry());
                }
                info!(connections, "Event loop stopped");
                Ok(())
            }
            Err(err) => {
                let connections = self.registry.count();
                let accept_waker = self.accept_waker.take();

                // Parked before the flag clears, so a stopped flag means
                // the connections are reachable by the controller.
                self.park();
                if !shared.running.swap(false, Ordering::SeqCst) {
                    // A concurrent stop() may have looked before they were parked
                    let closed = shared.close_parked();
                    if closed > 0 {
                        debug!(connections = closed, "Closed parked connections on stop");
                    }
                }
                if let Some(waker) = &accept_waker {
                    let _ = waker.wake();
                }

                error!(error = %err, connections, "Event loop terminated");
                shared.notify_fatal(&err);
                Err(err)
            }
        }
    }

    /// Leave the open connections with the controller, still open, for
    /// `stop()` to close or the next event loop to adopt.
    pub fn park(mut self) {
        if self.registry.is_empty() {
            return;
        }
        self.registry.deregister_all(self.poll.registry());
        let EventLoop {
            registry, shared, ..
        } = self;
        shared.park(registry);
    }

    fn serve(&mut self) -> Result<(), ServiceError> {
        // Readiness is edge-triggered: lines read before a fatal exit get
        // no new event, so answer them now.
        for id in std::mem::take(&mut self.adopted) {
            if self.dispatch_lines(id)? {
                self.flush(id)?;
            }
        }

        while self.shared.running.load(Ordering::SeqCst) {
            let ready = self.poll.poll(self.timeout)?;
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            self.admit_connections();

            if ready.woken || !ready.is_empty() {
                trace!(
                    readable = ready.readable.len(),
                    writable = ready.writable.len(),
                    errored = ready.errored.len(),
                    "Poll cycle"
                );
            }

            for id in ready.errored {
                self.drop_errored(id);
            }
            for id in ready.readable {
                self.on_readable(id)?;
            }
            for id in ready.writable {
                self.flush(id)?;
            }
        }
        Ok(())
    }

    /// Register every connection the accept task has handed over.
    fn admit_connections(&mut self) {
        while let Ok((stream, peer_addr)) = self.incoming.try_recv() {
            match self
                .registry
                .add(Connection::new(stream, peer_addr), self.poll.registry())
            {
                Ok(id) => debug!(conn_id = id, peer = %peer_addr, "Connection registered"),
                Err(e) => warn!(peer = %peer_addr, error = %e, "Failed to register connection"),
            }
        }
    }

    fn drop_errored(&mut self, id: ConnectionId) {
        if let Some(conn) = self.registry.get_mut(id) {
            let peer = conn.peer_addr();
            let unsent = conn.has_pending_writes();
            match conn.take_error() {
                Ok(Some(e)) => debug!(conn_id = id, peer = %peer, unsent, error = %e, "Socket error"),
                _ => debug!(conn_id = id, peer = %peer, unsent, "Socket error"),
            }
            self.registry.close(id, self.poll.registry());
        }
    }

    fn on_readable(&mut self, id: ConnectionId) -> Result<(), ServiceError> {
        let read = match self.registry.get_mut(id) {
            Some(conn) => conn.fill(self.max_line_length),
            None => return Ok(()),
        };

        if let Err(e) = read {
            if self.handle_failure(id, e.into())? == Disposition::Dropped {
                return Ok(());
            }
        }

        if self.dispatch_lines(id)? {
            self.flush(id)?;
        }
        Ok(())
    }

    /// Answer every complete line buffered on `id`, in order.
    ///
    /// Returns `false` if the connection was dropped along the way.
    fn dispatch_lines(&mut self, id: ConnectionId) -> Result<bool, ServiceError> {
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return Ok(false);
            };

            let line = match conn.next_line() {
                Some(line) => line,
                None if conn.pending_len() > self.max_line_length => {
                    let err = Error::protocol_violation(format!(
                        "line exceeds {} bytes",
                        self.max_line_length
                    ));
                    self.handle_failure(id, err)?;
                    return Ok(self.registry.contains(id));
                }
                None if conn.is_read_closed() => match conn.take_remainder() {
                    Some(line) => line,
                    None => return Ok(true),
                },
                None => return Ok(true),
            };

            let reply = match line {
                Line::Text(text) if text.len() > self.max_line_length => Err(
                    Error::protocol_violation(format!("line exceeds {} bytes", self.max_line_length)),
                ),
                Line::Text(text) => {
                    trace!(conn_id = id, line = %text, "Dispatching line");
                    self.shared.handler.reply(&text)
                }
                Line::Invalid => Err(Error::protocol_violation("line is not valid UTF-8")),
            };

            match reply {
                Ok(reply) => {
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.queue_reply(&reply);
                    }
                }
                Err(err) => {
                    if self.handle_failure(id, err)? == Disposition::Dropped {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Push queued replies out; close the connection once a peer that sent
    /// EOF has been fully answered.
    fn flush(&mut self, id: ConnectionId) -> Result<(), ServiceError> {
        let result = match self.registry.get_mut(id) {
            Some(conn) => conn
                .flush(self.poll.registry(), Token(id))
                .map(|done| done && conn.is_read_closed()),
            None => return Ok(()),
        };

        match result {
            Ok(true) => {
                debug!(conn_id = id, "Peer closed connection");
                self.registry.close(id, self.poll.registry());
            }
            Ok(false) => {}
            Err(e) => {
                self.handle_failure(id, e.into())?;
            }
        }
        Ok(())
    }

    /// Route a failure through the dispatch table.
    fn handle_failure(&mut self, id: ConnectionId, err: Error) -> Result<Disposition, ServiceError> {
        let disposition = self.shared.errors.classify(&err);
        match disposition {
            Disposition::Recovered => {
                debug!(conn_id = id, error = %err, "Recovered, reply dropped");
            }
            Disposition::Dropped => {
                if *err.kind() == ErrorKind::ProtocolViolation {
                    warn!(conn_id = id, error = %err, "Dropping connection");
                } else {
                    debug!(conn_id = id, error = %err, "Dropping connection");
                }
                self.registry.close(id, self.poll.registry());
            }
            Disposition::Fatal => return Err(ServiceError::Unhandled(err)),
        }
        Ok(disposition)
    }
}
