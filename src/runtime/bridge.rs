//! Request/response turns against the device link.
//!
//! A turn is: send the client's bytes, wait the settling delay, read one
//! reply of at most `buffer_size` bytes. The bridge takes `&mut self` for
//! the whole turn, so only one turn can be in flight on the device.
//!
//! The settling delay is an empirical allowance for the hardware to compute
//! its reply. Nothing checks that the reply is complete; a command slower
//! than the delay may get a partial or stale reply.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::device::DeviceLink;
use crate::error::{ProxyError, Result};

pub struct Bridge<D> {
    device: D,
    settle_delay: Duration,
    reply_buf: Vec<u8>,
    turns: u64,
}

impl<D: DeviceLink> Bridge<D> {
    pub fn new(device: D, settle_delay: Duration, buffer_size: usize) -> Self {
        Self {
            device,
            settle_delay,
            reply_buf: vec![0u8; buffer_size],
            turns: 0,
        }
    }

    /// Run one turn and return the device's reply.
    ///
    /// Any device failure, including end-of-stream, is returned as an error;
    /// the link is never retried or reopened.
    pub fn round_trip(&mut self, request: &[u8]) -> Result<Bytes> {
        let started = Instant::now();

        self.device.send(request).map_err(ProxyError::Device)?;

        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }

        let n = self
            .device
            .recv(&mut self.reply_buf)
            .map_err(ProxyError::Device)?;
        if n == 0 {
            return Err(ProxyError::DeviceClosed);
        }

        self.turns += 1;
        let reply = Bytes::copy_from_slice(&self.reply_buf[..n]);

        debug!(
            turn = self.turns,
            request = ?Bytes::copy_from_slice(request),
            reply = ?reply,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Device turn"
        );

        Ok(reply)
    }

    /// Number of completed turns.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    #[cfg(test)]
    pub(crate) fn buffer_size(&self) -> usize {
        self.reply_buf.len()
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    pub(crate) fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::scripted::{Call, ScriptedDevice};
    use crate::device::EchoDevice;

    #[test]
    fn test_round_trip() {
        let mut bridge = Bridge::new(ScriptedDevice::new(b"re:"), Duration::ZERO, 4096);

        let reply = bridge.round_trip(b"IDN?").unwrap();
        assert_eq!(&reply[..], b"re:IDN?");
        assert_eq!(bridge.turns(), 1);
        assert_eq!(bridge.device().requests(), vec![b"IDN?".to_vec()]);
    }

    #[test]
    fn test_settle_delay_between_send_and_recv() {
        let delay = Duration::from_millis(20);
        let mut bridge = Bridge::new(ScriptedDevice::new(b""), delay, 4096);

        bridge.round_trip(b"READ:DEV:GRPZ:PSU:SIG:FLD").unwrap();

        let calls = &bridge.device().calls;
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0].0, Call::Send(_)));
        assert!(matches!(calls[1].0, Call::Recv(_)));
        assert!(calls[1].1.duration_since(calls[0].1) >= delay);
    }

    #[test]
    fn test_reply_truncated_to_buffer() {
        let mut bridge = Bridge::new(ScriptedDevice::new(b"0123456789"), Duration::ZERO, 8);
        assert_eq!(bridge.buffer_size(), 8);

        let reply = bridge.round_trip(b"x").unwrap();
        assert_eq!(&reply[..], b"01234567");
    }

    #[test]
    fn test_echo_identity() {
        let mut bridge = Bridge::new(EchoDevice::new(), Duration::from_millis(5), 4096);
        let reply = bridge.round_trip(b"SET:DEV:GRPZ:PSU:SIG:FSET:0.5").unwrap();
        assert_eq!(&reply[..], b"SET:DEV:GRPZ:PSU:SIG:FSET:0.5");
    }

    #[test]
    fn test_send_failure_is_device_error() {
        let mut device = ScriptedDevice::new(b"");
        device.fail_send = true;
        let mut bridge = Bridge::new(device, Duration::ZERO, 4096);

        assert!(matches!(bridge.round_trip(b"x"), Err(ProxyError::Device(_))));
        assert_eq!(bridge.turns(), 0);
    }

    #[test]
    fn test_device_closed() {
        let mut bridge = Bridge::new(ScriptedDevice::new(b""), Duration::ZERO, 4096);
        bridge.device_mut().close_on_recv = true;

        assert!(matches!(
            bridge.round_trip(b"x"),
            Err(ProxyError::DeviceClosed)
        ));
    }
}
