//! Blocking TCP link to the instrument.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::DeviceLink;
use crate::error::{ProxyError, Result};

/// The single outbound connection to the instrument.
///
/// Opened once at startup and never re-created. Dropping it shuts down
/// both directions before the descriptor is closed, unless an
/// [`AbortHandle`] already did.
#[derive(Debug)]
pub struct TcpDevice {
    stream: TcpStream,
    peer: SocketAddr,
    shut: Arc<AtomicBool>,
}

/// Unblocks a device call stuck on another thread by shutting the link down.
#[derive(Debug)]
pub struct AbortHandle {
    stream: TcpStream,
    peer: SocketAddr,
    shut: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Shut the device link down. A blocked `recv` then returns `Ok(0)`.
    pub fn abort(&self) {
        if shutdown_once(&self.stream, &self.shut, self.peer) {
            debug!(device = %self.peer, "Device link aborted");
        }
    }
}

/// Shut `stream` down unless the shared flag says it already was.
fn shutdown_once(stream: &TcpStream, shut: &AtomicBool, peer: SocketAddr) -> bool {
    if shut.swap(true, Ordering::AcqRel) {
        return false;
    }
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!(device = %peer, error = %e, "Device shutdown failed");
    }
    true
}

impl TcpDevice {
    /// Connect to the instrument at `addr`.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).map_err(|source| ProxyError::DeviceConnect { addr, source })?;
        info!(device = %addr, "Connected to device");
        Ok(Self::from_stream(stream, addr))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            shut: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Throw away whatever is already queued on the socket without blocking.
    fn discard_available(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; 512];
        let mut dropped = 0;

        self.stream.set_nonblocking(true)?;
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => dropped += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;

        result.map(|_| dropped)
    }
}

impl DeviceLink for TcpDevice {
    fn send(&mut self, request: &[u8]) -> io::Result<()> {
        self.stream.write_all(request)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = loop {
            match self.stream.read(buf) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        // A full buffer may mean the reply was longer than we can relay.
        if n == buf.len() {
            let dropped = self.discard_available()?;
            if dropped > 0 {
                debug!(dropped, buffer_size = buf.len(), "Truncated oversized device reply");
            }
        }

        Ok(n)
    }

    fn abort_handle(&self) -> io::Result<Option<AbortHandle>> {
        Ok(Some(AbortHandle {
            stream: self.stream.try_clone()?,
            peer: self.peer,
            shut: Arc::clone(&self.shut),
        }))
    }
}

impl Drop for TcpDevice {
    fn drop(&mut self) {
        shutdown_once(&self.stream, &self.shut, self.peer);
        debug!(device = %self.peer, "Device link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// Accept one connection on a fresh loopback port and hand it to `serve`.
    fn fake_instrument<F>(serve: F) -> (SocketAddr, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream);
        });
        (addr, handle)
    }

    #[test]
    fn test_request_reply() {
        let (addr, handle) = fake_instrument(|mut stream| {
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"IDN?");
            stream.write_all(b"Oxford Instruments Mercury iPS").unwrap();
        });

        let mut device = TcpDevice::connect(addr).unwrap();
        device.send(b"IDN?").unwrap();

        let mut buf = [0u8; 4096];
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Oxford Instruments Mercury iPS");

        handle.join().unwrap();
    }

    #[test]
    fn test_oversized_reply_is_dropped() {
        let (addr, handle) = fake_instrument(|mut stream| {
            let mut buf = [0u8; 64];
            stream.read(&mut buf).unwrap();
            stream.write_all(b"AAAABBBB").unwrap();
            stream.read(&mut buf).unwrap();
            stream.write_all(b"CC").unwrap();
        });

        let mut device = TcpDevice::connect(addr).unwrap();
        let mut buf = [0u8; 4];

        device.send(b"first").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(device.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"AAAA");

        device.send(b"second").unwrap();
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"CC");

        handle.join().unwrap();
    }

    #[test]
    fn test_closed_device_reads_zero() {
        let (addr, handle) = fake_instrument(drop);

        let mut device = TcpDevice::connect(addr).unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(device.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_abort_unblocks_recv() {
        let (addr, handle) = fake_instrument(|mut stream| {
            // Never reply; wait for the proxy side to go away
            let mut buf = [0u8; 64];
            while stream.read(&mut buf).unwrap() > 0 {}
        });

        let mut device = TcpDevice::connect(addr).unwrap();
        let abort = device.abort_handle().unwrap().unwrap();
        device.send(b"READ:SYS:CAT").unwrap();

        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            abort.abort();
            // Second abort is a no-op
            abort.abort();
        });

        let mut buf = [0u8; 16];
        assert_eq!(device.recv(&mut buf).unwrap(), 0);
        assert!(device.shut.load(Ordering::Acquire));

        aborter.join().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        match TcpDevice::connect(addr) {
            Err(ProxyError::DeviceConnect { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
