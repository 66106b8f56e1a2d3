//! SSH wire-format reading and writing.
//!
//! Grounded on `thrussh_keys::encoding::{Encoding, Reader, Position}`: the same
//! cursor-over-a-slice shape, but `position` is public and settable so that
//! callers can save and rewind it, which `exit-signal`'s dual-format parse
//! (§4.4) needs. PuTTY's `BinarySource` instead carries a sticky error flag
//! that poisons every further read once one fails; a `Result`-returning cursor
//! with an explicit save/restore point gets the same rewind-on-failure
//! behavior without the sticky-flag bookkeeping.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cryptovec::CryptoVec;

use crate::error::ConnError;

/// A cursor over a packet body.
pub struct PacketCursor<'a> {
    buf: &'a [u8],
    pub position: usize,
}

impl<'a> PacketCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PacketCursor { buf, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.position)
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    pub fn read_byte(&mut self) -> Result<u8, ConnError> {
        if self.position + 1 > self.buf.len() {
            return Err(ConnError::protocol("packet truncated reading a byte"));
        }
        let b = self.buf[self.position];
        self.position += 1;
        Ok(b)
    }

    pub fn read_bool(&mut self) -> Result<bool, ConnError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, ConnError> {
        if self.position + 4 > self.buf.len() {
            return Err(ConnError::protocol("packet truncated reading a u32"));
        }
        let v = BigEndian::read_u32(&self.buf[self.position..]);
        self.position += 4;
        Ok(v)
    }

    /// Read an SSH string (u32 length prefix + bytes) as a raw byte slice.
    pub fn read_string(&mut self) -> Result<&'a [u8], ConnError> {
        let len = self.read_u32()? as usize;
        if self.position + len > self.buf.len() {
            return Err(ConnError::protocol("packet truncated reading a string"));
        }
        let s = &self.buf[self.position..self.position + len];
        self.position += len;
        Ok(s)
    }

    /// Read an SSH string and require it to be valid UTF-8.
    pub fn read_utf8_string(&mut self) -> Result<String, ConnError> {
        let s = self.read_string()?;
        String::from_utf8(s.to_vec())
            .map_err(|_| ConnError::protocol("string field was not valid UTF-8"))
    }
}

/// Extension trait for building outbound packet bodies. Grounded on
/// `thrussh_keys::encoding::Encoding`, narrowed to what the connection layer
/// actually emits (no mpint/list support is needed above the BPP).
pub trait PacketWriter {
    fn put_u32(&mut self, v: u32);
    fn put_bool(&mut self, v: bool);
    fn put_string(&mut self, s: &[u8]);
}

impl PacketWriter for CryptoVec {
    fn put_u32(&mut self, v: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, v);
        self.extend(&buf);
    }

    fn put_bool(&mut self, v: bool) {
        self.push(if v { 1 } else { 0 });
    }

    fn put_string(&mut self, s: &[u8]) {
        self.put_u32(s.len() as u32);
        self.extend(s);
    }
}

impl PacketWriter for Vec<u8> {
    fn put_u32(&mut self, v: u32) {
        self.write_u32::<BigEndian>(v).expect("Vec<u8> write is infallible");
    }

    fn put_bool(&mut self, v: bool) {
        self.push(if v { 1 } else { 0 });
    }

    fn put_string(&mut self, s: &[u8]) {
        self.put_u32(s.len() as u32);
        self.extend(s);
    }
}
