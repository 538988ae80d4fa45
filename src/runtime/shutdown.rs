//! Stopping the event loop from outside it.
//!
//! The loop blocks in `poll` with no timeout, so a shutdown request sets a
//! flag and then wakes the poll through a mio `Waker` registered on
//! `WAKER_TOKEN`. The loop may instead be stuck inside a device turn, so
//! the request also aborts the device link when the link can block.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Registry, Token, Waker};

use crate::device::AbortHandle;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Cloneable handle that asks a running proxy to stop.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
    device: Option<Arc<AbortHandle>>,
}

impl ShutdownHandle {
    pub(crate) fn new(registry: &Registry, device: Option<AbortHandle>) -> io::Result<Self> {
        Ok(Self {
            waker: Arc::new(Waker::new(registry, WAKER_TOKEN)?),
            requested: Arc::new(AtomicBool::new(false)),
            device: device.map(Arc::new),
        })
    }

    /// Request shutdown. The loop exits at its next wakeup, or as soon as
    /// an in-flight device turn is cut short.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        if let Some(device) = &self.device {
            device.abort();
        }
        self.waker.wake()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_requested())
            .field("aborts_device", &self.device.is_some())
            .finish()
    }
}

/// Turn SIGINT and SIGTERM into a shutdown request from a watcher thread.
#[cfg(unix)]
pub fn watch_signals(handle: ShutdownHandle) -> io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;
    use tracing::{info, warn};

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let name = if signal == SIGINT { "SIGINT" } else { "SIGTERM" };
                info!(signal = name, "Closing connections (requested by user)");
                if let Err(e) = handle.shutdown() {
                    warn!(error = %e, "Failed to wake event loop");
                }
            }
        })?;

    Ok(())
}

#[cfg(not(unix))]
pub fn watch_signals(_handle: ShutdownHandle) -> io::Result<()> {
    Ok(())
}
