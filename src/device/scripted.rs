//! Test double that records every call made on the device link.

use std::io;
use std::time::Instant;

use super::DeviceLink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// Recorded when the request has been handed over.
    Send(Vec<u8>),
    /// Recorded when the read starts.
    Recv(Vec<u8>),
}

/// Replies to each request with `reply_prefix` followed by the request.
///
/// Failures can be injected on either side to exercise the fatal paths.
#[derive(Debug)]
pub struct ScriptedDevice {
    reply_prefix: Vec<u8>,
    last_request: Vec<u8>,
    pub calls: Vec<(Call, Instant)>,
    pub fail_send: bool,
    pub close_on_recv: bool,
}

impl ScriptedDevice {
    pub fn new(reply_prefix: &[u8]) -> Self {
        Self {
            reply_prefix: reply_prefix.to_vec(),
            last_request: Vec::new(),
            calls: Vec::new(),
            fail_send: false,
            close_on_recv: false,
        }
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|(call, _)| match call {
                Call::Send(bytes) => Some(bytes.clone()),
                Call::Recv(_) => None,
            })
            .collect()
    }
}

impl DeviceLink for ScriptedDevice {
    fn send(&mut self, request: &[u8]) -> io::Result<()> {
        if self.fail_send {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.last_request = request.to_vec();
        self.calls.push((Call::Send(request.to_vec()), Instant::now()));
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let started = Instant::now();
        if self.close_on_recv {
            return Ok(0);
        }
        let mut reply = self.reply_prefix.clone();
        reply.extend_from_slice(&self.last_request);
        reply.truncate(buf.len());

        buf[..reply.len()].copy_from_slice(&reply);
        self.calls.push((Call::Recv(reply.clone()), started));
        Ok(reply.len())
    }
}
