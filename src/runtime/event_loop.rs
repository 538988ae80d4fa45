//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking reads on clients and a blocking round trip on the
//! device. Uses epoll on Linux, kqueue on macOS.
//!
//! ## Turn serialization
//!
//! Events are dispatched one at a time on a single thread, and a device
//! turn blocks the loop until the reply has been relayed. While one client's
//! turn is outstanding no other client is read and no new client is
//! accepted. That ordering is the only lock on the device.
//!
//! ## Fairness
//!
//! A readable client gets one read, and so at most one turn, per pass.
//! Clients that have not hit `WouldBlock` yet stay in a ready queue and are
//! served again after the next non-blocking poll, so a client that sends
//! faster than the device answers cannot starve the others.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::DeviceLink;
use crate::error::{ProxyError, Result};
use crate::runtime::bridge::Bridge;
use crate::runtime::connection::{ClientConnection, ConnectionRegistry, ReadOutcome};
use crate::runtime::shutdown::{ShutdownHandle, WAKER_TOKEN};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events collected per poll
const EVENT_CAPACITY: usize = 256;

/// Whether the loop should keep going after a batch of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Many inbound clients multiplexed onto one device link.
///
/// The listener and the device are acquired in [`Proxy::bind`] and released
/// exactly once when the proxy is dropped, however the loop ended.
pub struct Proxy<D: DeviceLink> {
    poll: Poll,
    registry: ConnectionRegistry,
    bridge: Bridge<D>,
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    /// Client read buffer, one turn's worth.
    inbound: Vec<u8>,
    /// Clients that may still have unread bytes, in service order.
    ready: VecDeque<usize>,
}

impl<D: DeviceLink> Proxy<D> {
    /// Bind the listener and take ownership of the connected device.
    pub fn bind(config: &Config, device: D) -> Result<Self> {
        let addr = config.listen_addr()?;
        let listener = create_listener(addr, config.backlog)
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let shutdown = ShutdownHandle::new(poll.registry(), device.abort_handle()?)?;

        info!(
            addr = %local_addr,
            buffer_size = config.buffer_size,
            settle_delay_ms = config.settle_delay.as_millis() as u64,
            "Proxy listening"
        );

        Ok(Self {
            poll,
            registry: ConnectionRegistry::new(listener),
            bridge: Bridge::new(device, config.settle_delay, config.buffer_size),
            shutdown,
            local_addr,
            inbound: vec![0u8; config.buffer_size],
            ready: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Number of open clients.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub(crate) fn bridge(&self) -> &Bridge<D> {
        &self.bridge
    }

    /// Run until shutdown is requested or the device fails.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            if self.poll_once(&mut events, None)? == Flow::Shutdown {
                info!(turns = self.bridge.turns(), "Shutdown requested");
                return Ok(());
            }
        }
    }

    /// Wait for readiness (forever if `timeout` is `None`), dispatch every
    /// ready member, then give each queued client one turn.
    ///
    /// While clients are queued the poll does not block.
    pub fn poll_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<Flow> {
        let timeout = if self.ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Flow::Continue);
            }
            return Err(e.into());
        }

        match self.dispatch(events) {
            // A shutdown request aborts the device link mid-turn
            Err(e) if self.shutdown.is_requested() => {
                debug!(error = %e, "Device turn cut short by shutdown");
                Ok(Flow::Shutdown)
            }
            flow => flow,
        }
    }

    fn dispatch(&mut self, events: &Events) -> Result<Flow> {
        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_clients()?,
                WAKER_TOKEN => {
                    if self.shutdown.is_requested() {
                        return Ok(Flow::Shutdown);
                    }
                }
                Token(conn_id) => {
                    if (event.is_readable() || event.is_read_closed())
                        && !self.ready.contains(&conn_id)
                    {
                        self.ready.push_back(conn_id);
                    }
                    if event.is_writable() {
                        self.flush_client(conn_id)?;
                    }
                }
            }
        }

        self.serve_ready()?;
        Ok(Flow::Continue)
    }

    fn accept_clients(&mut self) -> Result<()> {
        loop {
            match self.registry.listener().accept() {
                Ok((stream, peer)) => {
                    let conn = ClientConnection::new(stream, peer);
                    let conn_id = self.registry.insert(self.poll.registry(), conn)?;
                    debug!(conn_id, peer = %peer, clients = self.registry.len(), "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    return Ok(());
                }
            }
        }
    }

    /// One pass over the clients queued when the pass starts.
    fn serve_ready(&mut self) -> Result<()> {
        for _ in 0..self.ready.len() {
            let Some(conn_id) = self.ready.pop_front() else {
                break;
            };
            if self.serve_client(conn_id)? {
                self.ready.push_back(conn_id);
            }
        }
        Ok(())
    }

    /// Read the client once and run a device turn for what arrived.
    ///
    /// Returns whether the client may still have unread bytes.
    fn serve_client(&mut self, conn_id: usize) -> Result<bool> {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return Ok(false);
        };

        let n = match conn.read(&mut self.inbound) {
            Ok(ReadOutcome::Data(n)) => n,
            Ok(ReadOutcome::WouldBlock) => return Ok(false),
            Ok(ReadOutcome::Closed) => {
                self.teardown(conn_id);
                return Ok(false);
            }
            Err(e) => {
                warn!(conn_id, error = %e, "Client read failed");
                self.teardown(conn_id);
                return Ok(false);
            }
        };

        debug!(conn_id, bytes = n, "Received from client");
        let reply = self.bridge.round_trip(&self.inbound[..n])?;
        self.relay(conn_id, &reply)?;
        Ok(self.registry.contains(conn_id))
    }

    /// Hand a reply to the client that asked for it.
    fn relay(&mut self, conn_id: usize, reply: &[u8]) -> Result<()> {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };

        let sent = conn
            .send_reply(reply)
            .and_then(|_| conn.sync_interest(self.poll.registry(), Token(conn_id)));
        if let Err(e) = sent {
            warn!(conn_id, error = %e, "Client write failed");
            self.teardown(conn_id);
        }
        Ok(())
    }

    fn flush_client(&mut self, conn_id: usize) -> Result<()> {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };

        let flushed = conn
            .flush()
            .and_then(|_| conn.sync_interest(self.poll.registry(), Token(conn_id)));
        if let Err(e) = flushed {
            warn!(conn_id, error = %e, "Client write failed");
            self.teardown(conn_id);
        }
        Ok(())
    }

    fn teardown(&mut self, conn_id: usize) {
        self.ready.retain(|&id| id != conn_id);
        if let Some(peer) = self.registry.remove(self.poll.registry(), conn_id) {
            debug!(conn_id, peer = %peer, clients = self.registry.len(), "Connection closed");
        }
    }
}

impl<D: DeviceLink> Drop for Proxy<D> {
    fn drop(&mut self) {
        let clients = self.registry.len();
        self.registry.close_all(self.poll.registry());
        debug!(clients, "Listener and clients closed");
        // The device link is released when `bridge` drops after this.
    }
}

/// Create the listening socket, with SO_REUSEADDR so a restart does not
/// wait out TIME_WAIT on the port.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
