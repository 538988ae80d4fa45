//! Device link implementations.
//!
//! The instrument accepts exactly one connection, so the proxy owns a single
//! `DeviceLink` for its whole lifetime and drives it with blocking
//! send/recv calls from the event loop thread.
//!
//! ## Implementations
//! - `tcp`: the real connection to the instrument
//! - `echo`: test mode, reflects every request back as the reply

pub mod echo;
pub mod tcp;

#[cfg(test)]
pub(crate) mod scripted;

pub use echo::EchoDevice;
pub use tcp::{AbortHandle, TcpDevice};

use std::io;

/// The proxy's side of the single instrument connection.
///
/// Calls block until they complete; there is no framing, so one `recv`
/// is taken to be one reply.
pub trait DeviceLink {
    /// Send a whole request to the device.
    fn send(&mut self, request: &[u8]) -> io::Result<()>;

    /// Read one reply into `buf`, returning the number of bytes read.
    ///
    /// `Ok(0)` means the device closed the link. Bytes beyond `buf.len()`
    /// are discarded, not left for the next call.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// A handle that can break a blocked `send`/`recv` from another thread.
    ///
    /// Links that never block return `None`.
    fn abort_handle(&self) -> io::Result<Option<AbortHandle>> {
        Ok(None)
    }
}
