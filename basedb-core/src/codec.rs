//! # Binary Codec Primitives
//!
//! Fixed-width little-endian readers and writers shared by the modify,
//! query and response paths.
//!
//! - buffers are built with [`bytes::BufMut`]; [`LenPatch`] back-patches
//!   section lengths
//! - `write_*` / `read_*` operate on a slice at a known offset (main records,
//!   whose layout is fixed by the schema)
//! - [`ByteReader`] is a bounds-checked cursor for parsing untrusted buffers

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Length-prefixed sections on a [`BytesMut`]: reserve a u32 slot, write the
/// body with [`BufMut`], then patch the slot with the body's size.
pub trait LenPatch {
    fn reserve_len(&mut self) -> usize;
    fn patch_len(&mut self, pos: usize);
}

impl LenPatch for BytesMut {
    fn reserve_len(&mut self) -> usize {
        let pos = self.len();
        self.put_u32_le(0);
        pos
    }

    fn patch_len(&mut self, pos: usize) {
        let len = (self.len() - pos - 4) as u32;
        (&mut self[pos..pos + 4]).put_u32_le(len);
    }
}

#[inline]
pub fn write_u8(buf: &mut [u8], off: usize, v: u8) {
    buf[off] = v;
}

#[inline]
pub fn write_i8(buf: &mut [u8], off: usize, v: i8) {
    buf[off] = v as u8;
}

#[inline]
pub fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[off..off + 2], v);
}

#[inline]
pub fn write_i16(buf: &mut [u8], off: usize, v: i16) {
    LittleEndian::write_i16(&mut buf[off..off + 2], v);
}

#[inline]
pub fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[off..off + 4], v);
}

#[inline]
pub fn write_i32(buf: &mut [u8], off: usize, v: i32) {
    LittleEndian::write_i32(&mut buf[off..off + 4], v);
}

#[inline]
pub fn write_i64(buf: &mut [u8], off: usize, v: i64) {
    LittleEndian::write_i64(&mut buf[off..off + 8], v);
}

#[inline]
pub fn write_f64(buf: &mut [u8], off: usize, v: f64) {
    LittleEndian::write_f64(&mut buf[off..off + 8], v);
}

#[inline]
pub fn read_u8(buf: &[u8], off: usize) -> u8 {
    buf[off]
}

#[inline]
pub fn read_i8(buf: &[u8], off: usize) -> i8 {
    buf[off] as i8
}

#[inline]
pub fn read_u16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..off + 2])
}

#[inline]
pub fn read_i16(buf: &[u8], off: usize) -> i16 {
    LittleEndian::read_i16(&buf[off..off + 2])
}

#[inline]
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&buf[off..off + 4])
}

#[inline]
pub fn read_i32(buf: &[u8], off: usize) -> i32 {
    LittleEndian::read_i32(&buf[off..off + 4])
}

#[inline]
pub fn read_i64(buf: &[u8], off: usize) -> i64 {
    LittleEndian::read_i64(&buf[off..off + 8])
}

#[inline]
pub fn read_f64(buf: &[u8], off: usize) -> f64 {
    LittleEndian::read_f64(&buf[off..off + 8])
}

/// Bounds-checked little-endian cursor.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// `what` names the buffer in error messages.
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::malformed(
                self.what,
                format!("need {} bytes at {}, have {}", n, self.pos, self.remaining()),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Length-prefixed (u32) section.
    pub fn section(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
