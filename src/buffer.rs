//! Bounds-checked access to frame payload bytes

use crate::error::{DissectError, DissectResult};
use byteorder::{BigEndian, ByteOrder};

/// Read-only view over (part of) a frame
///
/// Every read is checked against the view's length and fails with
/// [`DissectError::Bounds`] instead of panicking.
#[derive(Debug, Clone, Copy)]
pub struct FrameBytes<'a> {
    data: &'a [u8],
}

impl<'a> FrameBytes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FrameBytes { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// True if `len` bytes are readable at `offset`
    pub fn has(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.data.len())
            .unwrap_or(false)
    }

    /// Fail unless `len` bytes are readable at `offset`
    pub fn ensure(&self, offset: usize, len: usize) -> DissectResult<()> {
        if self.has(offset, len) {
            Ok(())
        } else {
            Err(DissectError::Bounds {
                offset,
                needed: len,
                available: self.data.len().saturating_sub(offset),
            })
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> DissectResult<&'a [u8]> {
        self.ensure(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn u8(&self, offset: usize) -> DissectResult<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn u16(&self, offset: usize) -> DissectResult<u16> {
        Ok(BigEndian::read_u16(self.bytes(offset, 2)?))
    }

    pub fn u24(&self, offset: usize) -> DissectResult<u32> {
        Ok(BigEndian::read_u24(self.bytes(offset, 3)?))
    }

    pub fn u32(&self, offset: usize) -> DissectResult<u32> {
        Ok(BigEndian::read_u32(self.bytes(offset, 4)?))
    }

    pub fn u64(&self, offset: usize) -> DissectResult<u64> {
        Ok(BigEndian::read_u64(self.bytes(offset, 8)?))
    }

    /// Sub-view of `len` bytes starting at `offset`
    pub fn subset(&self, offset: usize, len: usize) -> DissectResult<FrameBytes<'a>> {
        Ok(FrameBytes::new(self.bytes(offset, len)?))
    }

    /// Everything from `offset` to the end of the view
    pub fn tail(&self, offset: usize) -> DissectResult<FrameBytes<'a>> {
        if offset > self.data.len() {
            return Err(DissectError::Bounds {
                offset,
                needed: 0,
                available: 0,
            });
        }
        Ok(FrameBytes::new(&self.data[offset..]))
    }
}

impl<'a> From<&'a [u8]> for FrameBytes<'a> {
    fn from(data: &'a [u8]) -> Self {
        FrameBytes::new(data)
    }
}
