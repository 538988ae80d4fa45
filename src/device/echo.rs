//! Echo device for running the proxy without hardware.

use std::io;

use bytes::BytesMut;

use super::DeviceLink;

/// Stands in for the instrument by answering each request with itself.
#[derive(Debug, Default)]
pub struct EchoDevice {
    pending: BytesMut,
}

impl EchoDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceLink for EchoDevice {
    fn send(&mut self, request: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(request);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        // Oversized requests are truncated like an oversized device reply.
        self.pending.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_reply() {
        let mut device = EchoDevice::new();
        device.send(b"*IDN?\n").unwrap();

        let mut buf = [0u8; 64];
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"*IDN?\n");
    }

    #[test]
    fn test_echo_truncates_to_buffer() {
        let mut device = EchoDevice::new();
        device.send(b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(device.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        // Remainder does not leak into the next turn
        device.send(b"ab").unwrap();
        let n = device.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ab");
    }
}
