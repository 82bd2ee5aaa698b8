//! Big-endian wire primitives shared by the three protocol codecs.
//!
//! Numeric fields are big-endian. Strings are a `u32` byte length followed by
//! UTF-16BE code units. Sized byte fields are a `u32` length followed by raw
//! bytes.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated message while reading {field}")]
    Truncated { field: &'static str },
    #[error("invalid utf-16 payload in {field}")]
    InvalidUtf16 { field: &'static str },
    #[error("odd utf-16 byte length {len} in {field}")]
    OddUtf16Length { field: &'static str, len: usize },
    #[error("unexpected message tag: expected {expected} got {got}")]
    UnexpectedTag { expected: u8, got: u8 },
    #[error("empty message body")]
    EmptyBody,
    #[error("trailing bytes after message body: {0}")]
    TrailingBytes(usize),
}

/// Reads the message tag from a received body. The long-lived receive loops
/// dispatch on this; a frame too short to carry a tag is reported as
/// `EmptyBody`, which callers log and ignore rather than treat as fatal.
pub fn message_tag(body: &[u8]) -> Result<u8, WireError> {
    body.first().copied().ok_or(WireError::EmptyBody)
}

/// Cursor over a received message body.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Checks and consumes the leading tag byte.
    pub fn expect_tag(&mut self, expected: u8) -> Result<(), WireError> {
        if self.remaining() == 0 {
            return Err(WireError::EmptyBody);
        }
        let got = self.u8("tag")?;
        if got != expected {
            return Err(WireError::UnexpectedTag { expected, got });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails unless the whole body was consumed. Decoders call this last so
    /// that a malformed length field cannot silently hide trailing garbage.
    pub fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated { field });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        Ok(self.u8(field)? != 0)
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self, field: &'static str) -> Result<u64, WireError> {
        let b = self.take(8, field)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn i64(&mut self, field: &'static str) -> Result<i64, WireError> {
        Ok(self.u64(field)? as i64)
    }

    pub fn f32(&mut self, field: &'static str) -> Result<f32, WireError> {
        Ok(f32::from_bits(self.u32(field)?))
    }

    /// `u32` byte length + UTF-16BE code units.
    pub fn utf16(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = self.u32(field)? as usize;
        if len % 2 != 0 {
            return Err(WireError::OddUtf16Length { field, len });
        }
        let raw = self.take(len, field)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| WireError::InvalidUtf16 { field })
    }

    /// `u32` length + raw bytes.
    pub fn bytes(&mut self, field: &'static str) -> Result<Bytes, WireError> {
        let len = self.u32(field)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, field)?))
    }
}

/// Builder for an outbound message body. The first byte pushed is the tag.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn tagged(tag: u8) -> Self {
        let mut w = Self::default();
        w.put_u8(tag);
        w
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.put_u32(v.to_bits());
    }

    pub fn put_utf16(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.put_u32((units.len() * 2) as u32);
        for unit in units {
            self.buf.extend_from_slice(&unit.to_be_bytes());
        }
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    pub fn into_body(self) -> Vec<u8> {
        self.buf
    }
}
