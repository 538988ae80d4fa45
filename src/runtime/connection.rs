//! Client connections and the registry that owns them.
//!
//! The registry holds the listening socket and every open client socket.
//! Clients are keyed by their slab index, which doubles as their poll token.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use slab::Slab;
use tracing::debug;

/// Current state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nothing left to send; waiting for the next request.
    Reading,
    /// A reply is partially flushed; waiting for the socket to drain.
    Writing,
}

/// Outcome of a read on a client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed its side.
    Closed,
}

/// A single accepted client.
#[derive(Debug)]
pub struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    /// Reply bytes the socket has not accepted yet.
    pending: BytesMut,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            pending: BytesMut::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    /// Read once from the socket.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue a reply behind anything still pending and write what the
    /// socket will take.
    pub fn send_reply(&mut self, reply: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(reply);
        self.flush()
    }

    /// Write pending bytes until done or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Switch between reading and writing interest to match `pending`.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match (self.state, self.has_pending()) {
            (ConnState::Reading, true) => {
                registry.reregister(
                    &mut self.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                self.state = ConnState::Writing;
            }
            (ConnState::Writing, false) => {
                registry.reregister(&mut self.stream, token, Interest::READABLE)?;
                self.state = ConnState::Reading;
            }
            _ => {}
        }
        Ok(())
    }

    /// Shut down both directions. The descriptor closes when `self` drops.
    fn shutdown(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(peer = %self.peer, error = %e, "Client shutdown failed");
        }
    }
}

/// The listener plus every live client connection.
///
/// Only the event loop mutates the registry. Every member is either the
/// listener or a client whose socket is open and not shut down.
pub struct ConnectionRegistry {
    listener: TcpListener,
    connections: Slab<ClientConnection>,
}

impl ConnectionRegistry {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            connections: Slab::new(),
        }
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Register a new client for readable events and return its id.
    pub fn insert(&mut self, registry: &Registry, conn: ClientConnection) -> io::Result<usize> {
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let conn = entry.insert(conn);
        if let Err(e) = registry.register(&mut conn.stream, Token(id), Interest::READABLE) {
            self.connections.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut ClientConnection> {
        self.connections.get_mut(id)
    }

    /// Remove a client and shut its socket down.
    pub fn remove(&mut self, registry: &Registry, id: usize) -> Option<SocketAddr> {
        let mut conn = self.connections.try_remove(id)?;
        conn.shutdown(registry);
        Some(conn.peer)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of open clients, not counting the listener.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Shut down and drop every client, then the listener.
    pub fn close_all(&mut self, registry: &Registry) {
        for mut conn in self.connections.drain() {
            conn.shutdown(registry);
        }
        let _ = registry.deregister(&mut self.listener);
        if let Err(e) = socket2::SockRef::from(&self.listener).shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown failed");
        }
    }
}
