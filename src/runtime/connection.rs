//! Connections and the registry that owns them.
//!
//! Each connection buffers inbound bytes until a full line is available
//! and queues outbound replies until the socket accepts them. The registry
//! is owned by the event loop alone; other threads only read the shared
//! connection gauge.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identifier of a registered connection (its slab key and poll token).
pub type ConnectionId = usize;

/// Bytes pulled from the socket per read call.
const READ_CHUNK: usize = 4096;

/// Outcome of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The socket has no more data for now.
    Open,
    /// The peer closed its write side.
    Eof,
}

/// One line taken from the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// Line text with the terminator stripped.
    Text(String),
    /// Bytes that are not valid UTF-8.
    Invalid,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Registered for writable readiness because a flush would block.
    write_interest: bool,
    /// Peer sent EOF; close once the write buffer drains.
    read_closed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            write_interest: false,
            read_closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// Bytes buffered that do not yet form a complete line.
    pub fn pending_len(&self) -> usize {
        self.read_buf.len()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Read what is currently available into the read buffer.
    ///
    /// Readiness is edge-triggered, so the socket is drained until it would
    /// block or reports EOF. Reading stops early once the unterminated tail
    /// of the buffer is longer than `max_line`; such a peer gets dropped.
    pub fn fill(&mut self, max_line: usize) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut partial = match self.read_buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.read_buf.len() - pos - 1,
            None => self.read_buf.len(),
        };
        loop {
            if partial > max_line {
                return Ok(ReadStatus::Open);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.read_closed = true;
                    return Ok(ReadStatus::Eof);
                }
                Ok(n) => {
                    let data = &chunk[..n];
                    partial = match data.iter().rposition(|&b| b == b'\n') {
                        Some(pos) => n - pos - 1,
                        None => partial + n,
                    };
                    self.read_buf.extend_from_slice(data);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Open)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the next complete line from the read buffer.
    ///
    /// Strips `\n` and an optional preceding `\r`.
    pub fn next_line(&mut self) -> Option<Line> {
        let pos = self.read_buf.iter().position(|&b| b == b'\n')?;
        let raw = self.read_buf.split_to(pos + 1);
        Some(decode_line(&raw[..pos]))
    }

    /// Take whatever is left in the read buffer as a final, unterminated line.
    pub fn take_remainder(&mut self) -> Option<Line> {
        if self.read_buf.is_empty() {
            return None;
        }
        let raw = self.read_buf.split();
        Some(decode_line(&raw))
    }

    /// Queue `reply` plus the line terminator.
    pub fn queue_reply(&mut self, reply: &str) {
        self.write_buf.reserve(reply.len() + 1);
        self.write_buf.extend_from_slice(reply.as_bytes());
        self.write_buf.extend_from_slice(b"\n");
    }

    /// Write queued replies until done or the socket would block.
    ///
    /// Adjusts writable interest so the event loop is woken to finish a
    /// partial flush. Returns `true` once the write buffer is empty.
    pub fn flush(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.write_interest {
                        registry.reregister(
                            &mut self.stream,
                            token,
                            Interest::READABLE | Interest::WRITABLE,
                        )?;
                        self.write_interest = true;
                    }
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if self.write_interest {
            registry.reregister(&mut self.stream, token, Interest::READABLE)?;
            self.write_interest = false;
        }
        Ok(true)
    }

    /// Pending socket error, if the poll flagged this connection.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}

fn decode_line(raw: &[u8]) -> Line {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(text) => Line::Text(text.to_owned()),
        Err(_) => Line::Invalid,
    }
}

/// The set of open connections, keyed by slab index.
///
/// `count` mirrors the number of entries for readers on other threads.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    count: Arc<AtomicUsize>,
}

impl ConnectionRegistry {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.store(0, Ordering::SeqCst);
        Self {
            connections: Slab::new(),
            count,
        }
    }

    /// Insert a connection and register it for readable events.
    pub fn add(&mut self, conn: Connection, registry: &Registry) -> io::Result<ConnectionId> {
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let conn = entry.insert(conn);
        if let Err(e) = registry.register(&mut conn.stream, Token(id), Interest::READABLE) {
            self.connections.remove(id);
            return Err(e);
        }
        self.count.store(self.connections.len(), Ordering::SeqCst);
        Ok(id)
    }

    /// Take a connection out of the registry. Absent ids are a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.try_remove(id)?;
        self.count.store(self.connections.len(), Ordering::SeqCst);
        Some(conn)
    }

    /// Remove, deregister and shut down a connection in one step.
    pub fn close(&mut self, id: ConnectionId, registry: &Registry) -> bool {
        match self.remove(id) {
            Some(mut conn) => {
                let _ = registry.deregister(&mut conn.stream);
                let _ = conn.stream.shutdown(Shutdown::Both);
                debug!(conn_id = id, peer = %conn.peer_addr, "Connection closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub fn close_all(&mut self, registry: &Registry) {
        for id in self.snapshot() {
            self.close(id, registry);
        }
    }

    /// Deregister every connection from `registry`, leaving the sockets open.
    ///
    /// A source must be deregistered before another poll may register it,
    /// so this runs before the registry is parked.
    pub fn deregister_all(&mut self, registry: &Registry) {
        for (id, conn) in self.connections.iter_mut() {
            if let Err(e) = registry.deregister(&mut conn.stream) {
                debug!(conn_id = id, error = %e, "Failed to deregister connection");
            }
        }
    }

    /// Re-register every connection with a new poll instance.
    ///
    /// Used when parked connections are handed to a restarted event loop.
    pub fn reregister_all(&mut self, registry: &Registry) -> io::Result<()> {
        for (id, conn) in self.connections.iter_mut() {
            let interest = if conn.write_interest {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.register(&mut conn.stream, Token(id), interest)?;
        }
        Ok(())
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains(id)
    }

    /// Ids of all open connections.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.count.store(0, Ordering::SeqCst);
    }
}
