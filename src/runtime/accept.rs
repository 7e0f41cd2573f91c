//! Accept task.
//!
//! Waits for listener readiness in its own poll so that a stop request
//! (flag plus wake) is never stuck behind a blocking `accept`. Accepted
//! streams go to the event loop through a bounded channel; the event loop
//! is woken after each batch.

use crate::runtime::listener::Listener;
use crate::runtime::Shared;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// An accepted stream on its way to the event loop.
pub(crate) type Handoff = (TcpStream, SocketAddr);

pub(crate) struct AcceptTask {
    listener: Listener,
    poll: Poll,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
    handoff: SyncSender<Handoff>,
    loop_waker: Arc<Waker>,
    timeout: Duration,
}

impl AcceptTask {
    pub fn new(
        mut listener: Listener,
        shared: Arc<Shared>,
        handoff: SyncSender<Handoff>,
        loop_waker: Arc<Waker>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            listener,
            poll,
            waker,
            shared,
            handoff,
            loop_waker,
            timeout,
        })
    }

    /// Handle used to interrupt the accept wait.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Run until the running flag clears or the event loop goes away.
    ///
    /// The listener is dropped (socket closed) before this returns.
    pub fn run(mut self) -> io::Result<()> {
        let addr = self.listener.local_addr();
        info!(addr = %addr, "Accept task started");

        let result = self.accept_loop();

        let _ = self.poll.registry().deregister(self.listener.source());
        drop(self.listener);
        info!(addr = %addr, "Listener closed");

        result
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(8);

        while self.shared.running.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(self.timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept poll failed");
                    return Err(e);
                }
            }

            let listener_ready = events.iter().any(|e| e.token() == LISTENER_TOKEN);
            if !listener_ready || !self.shared.running.load(Ordering::SeqCst) {
                continue;
            }

            if !self.accept_connections() {
                debug!("Event loop gone, accept task exiting");
                break;
            }
        }

        Ok(())
    }

    /// Accept until the backlog is empty. Returns `false` once the event
    /// loop has dropped its end of the channel.
    fn accept_connections(&mut self) -> bool {
        let mut accepted = 0usize;
        let open = loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    trace!(peer = %peer_addr, "Accepted connection");
                    if !self.hand_off(stream, peer_addr) {
                        break false;
                    }
                    accepted += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break true;
                }
            }
        };

        if accepted > 0 {
            let _ = self.loop_waker.wake();
        }
        open
    }

    /// Queue a stream for the event loop, waking it first if the queue is
    /// full so it can drain.
    fn hand_off(&self, stream: TcpStream, peer_addr: SocketAddr) -> bool {
        match self.handoff.try_send((stream, peer_addr)) {
            Ok(()) => true,
            Err(TrySendError::Full(pending)) => {
                let _ = self.loop_waker.wake();
                self.handoff.send(pending).is_ok()
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
