//! Error types for ips-proxy.
//!
//! | Category | Variants | Effect |
//! |----------|----------|--------|
//! | Startup | [`ProxyError::Bind`], [`ProxyError::DeviceConnect`], [`ProxyError::Config`] | construction fails |
//! | Device | [`ProxyError::Device`], [`ProxyError::DeviceClosed`] | event loop terminates |
//! | Runtime | [`ProxyError::Io`] | event loop terminates |
//!
//! Client disconnects and client socket errors never surface here; the event
//! loop tears the client down and keeps going.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The listening socket could not be created or bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The device link could not be opened.
    #[error("failed to connect to device at {addr}: {source}")]
    DeviceConnect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Send or receive on the device link failed mid-turn.
    #[error("device link failed: {0}")]
    Device(#[source] io::Error),

    /// The device returned end-of-stream instead of a reply.
    #[error("device closed the connection")]
    DeviceClosed,

    /// Poll or registry failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProxyError {
    /// Whether this error came from the device link.
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            ProxyError::Device(_) | ProxyError::DeviceClosed | ProxyError::DeviceConnect { .. }
        )
    }
}
