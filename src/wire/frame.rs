//! TCP connect, handshake exchange, and length-prefixed framing.
//!
//! A frame is a big-endian `u32` body length followed by the body; the first
//! body byte is the message tag. The reader keeps a carry-over buffer so that
//! frames split across reads (or interrupted by a cancellation poll) are
//! reassembled instead of lost.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::types::Endpoint;

pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body. A length above this almost always
/// means the stream has desynchronized, so the connection is torn down
/// rather than allocating garbage.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How long a blocking read waits before re-checking the cancel predicate.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("frame too large: {got} bytes (max {MAX_FRAME_BYTES})")]
    FrameTooLarge { got: usize },
    #[error("no usable address for {endpoint}")]
    NoAddress { endpoint: String },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake mismatch: peer echo did not match")]
    Mismatch,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Opens a blocking TCP connection to `endpoint`.
pub fn connect(endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(endpoint.addr())?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Opens a TCP connection, giving up after `timeout`.
pub fn connect_timeout(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let addr = endpoint
        .addr()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::NoAddress {
            endpoint: endpoint.to_string(),
        })?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sends the fixed handshake bytes and verifies the peer echoes them back
/// byte for byte. Handshakes are raw writes, not frames.
pub fn handshake(stream: &mut TcpStream, expected: &[u8]) -> Result<(), HandshakeError> {
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(TransportError::from)?;
    stream.write_all(expected).map_err(TransportError::from)?;

    let mut echo = vec![0u8; expected.len()];
    let mut read = 0usize;
    while read < echo.len() {
        match stream.read(&mut echo[read..]) {
            Ok(0) => return Err(TransportError::Closed.into()),
            Ok(n) => read += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::from(err).into()),
        }
    }

    if echo != expected {
        return Err(HandshakeError::Mismatch);
    }
    Ok(())
}

/// Reads frames from a cloned stream. Between reads the cancel predicate is
/// polled, so cancellation granularity is one poll interval; a partially
/// received frame stays in the carry-over buffer across polls.
pub struct FrameReader {
    stream: TcpStream,
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl FrameReader {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        Self::with_poll_interval(stream, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        stream: TcpStream,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        stream.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            stream,
            pending: Vec::new(),
            poll_interval,
        })
    }

    /// Blocks until a whole frame arrives and returns its body (the leading
    /// length prefix is stripped). Returns `Ok(None)` promptly once
    /// `cancelled` reports true; the carry-over buffer is preserved so a
    /// later call can finish the frame.
    pub fn read_next(
        &mut self,
        cancelled: impl Fn() -> bool,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut scratch = [0u8; 4096];
        loop {
            if let Some(body) = self.take_frame()? {
                return Ok(Some(body));
            }
            if cancelled() {
                return Ok(None);
            }
            match self.stream.read(&mut scratch) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.pending.extend_from_slice(&scratch[..n]),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut
                        || err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.pending.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge { got: length });
        }
        if self.pending.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        let body = self.pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();
        self.pending.drain(..FRAME_HEADER_LEN + length);
        Ok(Some(body))
    }

    /// Drops any partially received frame. Reconnect paths call this so a
    /// fresh connection never starts mid-frame.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Writes frames to a cloned stream. Each call is one `write_all`, so a
/// frame is never interleaved with another writer holding the same lock.
pub struct FrameWriter {
    stream: TcpStream,
}

impl FrameWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge { got: body.len() });
        }
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        self.stream.write_all(&buf)?;
        Ok(())
    }
}
