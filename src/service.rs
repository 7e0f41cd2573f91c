//! Service controller.
//!
//! Owns the bound listener between runs, spawns the accept and event-loop
//! threads, and exposes the handler and error-table controls.

use crate::config::ServiceConfig;
use crate::dispatch::ErrorCallback;
use crate::error::{Error, ErrorKind, Result, ServiceError};
use crate::runtime::{AcceptTask, EventLoop, Listener, Shared};
use mio::Waker;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Handles of one run's threads.
struct Tasks {
    accept: JoinHandle<io::Result<()>>,
    event_loop: JoinHandle<Result<()>>,
    accept_waker: Arc<Waker>,
    loop_waker: Arc<Waker>,
}

/// A line-oriented TCP request/response service.
///
/// ```no_run
/// use lineserve::Service;
///
/// let mut service = Service::with_handler(7000, |line: &str| Ok(line.to_uppercase()))?;
/// // ... later
/// service.stop();
/// service.join()?;
/// # Ok::<(), lineserve::ServiceError>(())
/// ```
pub struct Service {
    config: ServiceConfig,
    local_addr: SocketAddr,
    /// Bound but not yet handed to an accept task.
    listener: Option<Listener>,
    shared: Arc<Shared>,
    tasks: Option<Tasks>,
}

impl Service {
    /// Bind the listener without starting. Fails if the address is taken.
    pub fn bind(config: ServiceConfig) -> Result<Self> {
        let addr = config.socket_addr()?;
        let listener = Listener::bind(addr, config.backlog)?;
        let local_addr = listener.local_addr();
        info!(addr = %local_addr, "Listener bound");

        Ok(Self {
            config,
            local_addr,
            listener: Some(listener),
            shared: Arc::new(Shared::default()),
            tasks: None,
        })
    }

    /// Bind `port` on all interfaces and start serving with no handler.
    pub fn new(port: u16) -> Result<Self> {
        let mut service = Self::bind(ServiceConfig::with_port(port))?;
        service.start()?;
        Ok(service)
    }

    /// Bind `port` on all interfaces and start serving with `handler`.
    pub fn with_handler<F>(port: u16, handler: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, Error> + Send + Sync + 'static,
    {
        Self::serve(ServiceConfig::with_port(port), handler)
    }

    /// Bind according to `config` and start serving with `handler`.
    pub fn serve<F>(config: ServiceConfig, handler: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, Error> + Send + Sync + 'static,
    {
        let mut service = Self::bind(config)?;
        service.set_message_handler(handler);
        service.start()?;
        Ok(service)
    }

    /// Spawn the accept and event-loop threads. No-op while running.
    ///
    /// After a stop the listener is bound again on the same address;
    /// after a fatal exit the parked connections are served again.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if let Some(previous) = self.tasks.take() {
            if let Err(e) = reap(previous) {
                debug!(error = %e, "Previous run ended with an error");
            }
        }

        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => Listener::bind(self.local_addr, self.config.backlog)?,
        };

        let (handoff, incoming) = sync_channel(self.config.accept_queue.max(1));
        let mut event_loop = EventLoop::new(&self.config, Arc::clone(&self.shared), incoming)?;
        let loop_waker = event_loop.waker();
        let accept = match AcceptTask::new(
            listener,
            Arc::clone(&self.shared),
            handoff,
            Arc::clone(&loop_waker),
            self.config.poll_timeout_duration(),
        ) {
            Ok(accept) => accept,
            Err(e) => {
                event_loop.park();
                return Err(e.into());
            }
        };
        let accept_waker = accept.waker();
        event_loop.set_accept_waker(Arc::clone(&accept_waker));

        self.shared.running.store(true, Ordering::SeqCst);

        let event_loop = thread::Builder::new()
            .name("lineserve-loop".to_string())
            .spawn(move || event_loop.run())
            .map_err(|source| {
                self.shared.running.store(false, Ordering::SeqCst);
                ServiceError::Spawn {
                    name: "event loop",
                    source,
                }
            })?;

        let accept = match thread::Builder::new()
            .name("lineserve-accept".to_string())
            .spawn(move || accept.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let _ = loop_waker.wake();
                let _ = event_loop.join();
                return Err(ServiceError::Spawn {
                    name: "accept",
                    source,
                });
            }
        };

        self.tasks = Some(Tasks {
            accept,
            event_loop,
            accept_waker,
            loop_waker,
        });

        info!(addr = %self.local_addr, "Service started");
        Ok(())
    }

    /// Ask both threads to exit. Idempotent; does not wait.
    ///
    /// Also closes connections left open by a fatal exit.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if let Some(tasks) = &self.tasks {
            let _ = tasks.loop_waker.wake();
            let _ = tasks.accept_waker.wake();
        }

        let parked = self.shared.close_parked();
        if parked > 0 {
            debug!(connections = parked, "Closed connections left by fatal exit");
        }
        if was_running {
            info!(addr = %self.local_addr, "Service stopping");
        }
    }

    /// Wait for both threads to exit.
    ///
    /// Once this returns the listener socket is closed, and after a
    /// `stop()` so is every connection. Returns the error that ended the
    /// run, if any.
    pub fn join(&mut self) -> Result<()> {
        match self.tasks.take() {
            Some(tasks) => reap(tasks),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of open connections held by the service.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Replace the message handler. Takes effect for the next line.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&str) -> std::result::Result<String, Error> + Send + Sync + 'static,
    {
        self.shared.handler.set(handler);
    }

    /// Unset the handler; lines are then answered with an empty line.
    pub fn clear_message_handler(&self) {
        self.shared.handler.clear();
    }

    /// Register a recovery callback for `kind`, replacing any earlier one.
    pub fn add_error_handler<F>(&self, kind: ErrorKind, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let callback: ErrorCallback = Arc::new(callback);
        self.shared.errors.insert(kind, callback);
    }

    /// Unregister the callback for `kind`. Returns whether one existed.
    pub fn remove_error_handler(&self, kind: &ErrorKind) -> bool {
        self.shared.errors.remove(kind)
    }

    /// Observe the error that stops the event loop. Called at most once
    /// per run, from the event-loop thread.
    pub fn set_fatal_observer<F>(&self, observer: F)
    where
        F: Fn(&ServiceError) + Send + Sync + 'static,
    {
        self.shared.set_fatal_observer(Arc::new(observer));
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join() {
            warn!(error = %e, "Service ended with an error");
        }
        self.shared.close_parked();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .field("error_handlers", &self.shared.errors.len())
            .finish()
    }
}

/// Join both threads; the event loop's outcome wins over the accept task's.
fn reap(tasks: Tasks) -> Result<()> {
    let looped = tasks
        .event_loop
        .join()
        .map_err(|_| ServiceError::TaskPanicked("event loop"));
    let accepted = tasks
        .accept
        .join()
        .map_err(|_| ServiceError::TaskPanicked("accept"));

    looped??;
    accepted??;
    Ok(())
}
