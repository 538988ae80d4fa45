//! ips-proxy: share a single-connection instrument between many clients
//!
//! The Oxford Mercury iPS magnet power supply accepts only one TCP
//! connection. This crate holds that connection and lets any number of
//! clients connect to the proxy instead:
//! - Each client request is forwarded unmodified to the instrument
//! - The instrument's reply goes back to the client that asked
//! - Requests from different clients never overlap on the device link
//!
//! There is no framing: one read from a client is one request, and one
//! read from the device, taken after a fixed settling delay, is its reply.

pub mod config;
pub mod device;
pub mod error;
pub mod runtime;

pub use error::{ProxyError, Result};
