//! Primitive wire encoding shared by every message payload.
//!
//! One canonical encoding, applied uniformly: fixed-width little-endian
//! integers, strings as `len:u32` + UTF-8 bytes, booleans as a single
//! byte. Readers validate the remaining length before every read so a
//! truncated payload surfaces as a typed error, never a panic.

use bytes::{BufMut, BytesMut};

use crate::error::TetherError;

// ── Writing ──────────────────────────────────────────────────────

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

pub fn put_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64_le(value);
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

/// `len:u32` followed by the raw UTF-8 bytes.
pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), TetherError> {
    put_blob(buf, value.as_bytes())
}

/// `len:u32` followed by the raw bytes.
pub fn put_blob(buf: &mut BytesMut, value: &[u8]) -> Result<(), TetherError> {
    let len = u32::try_from(value.len())
        .map_err(|_| TetherError::Encoding(format!("field of {} bytes too long", value.len())))?;
    buf.put_u32_le(len);
    buf.put_slice(value);
    Ok(())
}

/// `count:u32` for a following sequence.
pub fn put_count(buf: &mut BytesMut, count: usize) -> Result<(), TetherError> {
    let count = u32::try_from(count)
        .map_err(|_| TetherError::Encoding(format!("sequence of {count} items too long")))?;
    buf.put_u32_le(count);
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────

/// Cursor over a received payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TetherError> {
        if self.buf.len() < n {
            return Err(TetherError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn get_u32(&mut self) -> Result<u32, TetherError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_i64(&mut self) -> Result<i64, TetherError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool, TetherError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn get_string(&mut self) -> Result<String, TetherError> {
        let bytes = self.get_blob()?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn get_blob(&mut self) -> Result<Vec<u8>, TetherError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_count(&mut self) -> Result<usize, TetherError> {
        Ok(self.get_u32()? as usize)
    }
}
