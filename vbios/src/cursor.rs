// Licensed under the Apache-2.0 license

use zerocopy::FromBytes;

use crate::{Result, VbiosError};

/// Bounds-checked little-endian reader over an immutable byte buffer.
///
/// Every read validates its range against the buffer before touching it;
/// an overrun surfaces as [`VbiosError::Bounds`], never a panic or a
/// silent clamp.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor positioned at `pos`, rejecting positions past the end.
    pub fn at(buf: &'a [u8], pos: usize) -> Result<Self> {
        if pos > buf.len() {
            return Err(VbiosError::Bounds {
                offset: pos,
                len: 0,
                bound: buf.len(),
            });
        }
        Ok(Self { buf, pos })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(VbiosError::Bounds {
                offset: pos,
                len: 0,
                bound: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.seek(self.pos.saturating_add(n))
    }

    /// Borrow `len` bytes at the current position and advance past them.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(VbiosError::Bounds {
                offset: self.pos,
                len,
                bound: self.buf.len(),
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Decode a fixed-layout structure at the current position and advance
    /// past it. The layout types are little-endian on ROM and naturally
    /// aligned, so a prefix read is exact.
    pub fn read_struct<T: FromBytes>(&mut self) -> Result<T> {
        let raw = self.bytes(core::mem::size_of::<T>())?;
        T::read_from_prefix(raw)
            .map(|(value, _)| value)
            .map_err(|_| VbiosError::Format("structure prefix read"))
    }
}
