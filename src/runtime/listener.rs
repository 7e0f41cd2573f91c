//! Bound server socket.
//!
//! The socket is created with socket2 so `SO_REUSEADDR` is set before
//! binding; a restarted service can rebind its old address while earlier
//! connections linger in `TIME_WAIT`.

use crate::error::{Result, ServiceError};
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Owns the listening socket. Dropping it closes the socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Create, bind and listen. Fails fast if the address is taken.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let listener = create_listener(addr, backlog)
            .map_err(|source| ServiceError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServiceError::Bind { addr, source })?;

        Ok(Self {
            inner: TcpListener::from_std(listener),
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending connection. Returns `WouldBlock` when none is queued.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
