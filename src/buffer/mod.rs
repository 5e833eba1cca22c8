//! Bounds-checked byte buffer access for Hexframe
//!
//! This module provides the byte-order-aware cursor over capture memory that
//! every decoder in Hexframe reads through.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewError {
    #[error("out of bounds access: offset {offset} width {width} exceeds buffer size {size}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        size: usize,
    },
}

/// Byte order used when reading or writing multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    /// Get the byte order of the host machine
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }
}

/// A bounds-checked, byte-order-aware view over a contiguous memory region
///
/// Every accessor validates that the full width of the access lies inside the
/// buffer and returns [`ViewError::OutOfBounds`] otherwise; accesses are never
/// silently truncated. The byte order is a mutable property of the view, not
/// of the underlying memory, so the same bytes can be re-read in a different
/// order when the protocol context requires it (e.g. the loopback family
/// field, which is stored in the capturing host's byte order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteView {
    data: Vec<u8>,
    order: ByteOrder,
}

impl ByteView {
    /// Create a view owning the given bytes, using the native byte order
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            order: ByteOrder::native(),
        }
    }

    /// Create a view by copying the given slice
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    /// Set the byte order and return the view, builder style
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Get the byte order currently in effect
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Change the byte order for subsequent accesses
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Get the number of bytes in the view
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the underlying bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn check(&self, offset: usize, width: usize) -> Result<(), ViewError> {
        // offset + width computed in a way that cannot overflow usize
        if width > self.data.len() || offset > self.data.len() - width {
            return Err(ViewError::OutOfBounds {
                offset,
                width,
                size: self.data.len(),
            });
        }
        Ok(())
    }

    /// Read an unsigned 8-bit value
    pub fn get_u8(&self, offset: usize) -> Result<u8, ViewError> {
        self.check(offset, 1)?;
        Ok(self.data[offset])
    }

    /// Read an unsigned 16-bit value in the view's byte order
    pub fn get_u16(&self, offset: usize) -> Result<u16, ViewError> {
        self.check(offset, 2)?;
        let bytes: [u8; 2] = [self.data[offset], self.data[offset + 1]];
        Ok(match self.order {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        })
    }

    /// Read an unsigned 32-bit value in the view's byte order
    pub fn get_u32(&self, offset: usize) -> Result<u32, ViewError> {
        self.check(offset, 4)?;
        let mut bytes: [u8; 4] = [0; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        Ok(match self.order {
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
        })
    }

    /// Read an unsigned 64-bit value in the view's byte order
    pub fn get_u64(&self, offset: usize) -> Result<u64, ViewError> {
        self.check(offset, 8)?;
        let mut bytes: [u8; 8] = [0; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        Ok(match self.order {
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
        })
    }

    /// Write an unsigned 8-bit value
    pub fn set_u8(&mut self, offset: usize, value: u8) -> Result<(), ViewError> {
        self.check(offset, 1)?;
        self.data[offset] = value;
        Ok(())
    }

    /// Write an unsigned 16-bit value in the view's byte order
    pub fn set_u16(&mut self, offset: usize, value: u16) -> Result<(), ViewError> {
        self.check(offset, 2)?;
        let bytes: [u8; 2] = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.data[offset..offset + 2].copy_from_slice(&bytes);
        Ok(())
    }

    /// Write an unsigned 32-bit value in the view's byte order
    pub fn set_u32(&mut self, offset: usize, value: u32) -> Result<(), ViewError> {
        self.check(offset, 4)?;
        let bytes: [u8; 4] = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.data[offset..offset + 4].copy_from_slice(&bytes);
        Ok(())
    }

    /// Write an unsigned 64-bit value in the view's byte order
    pub fn set_u64(&mut self, offset: usize, value: u64) -> Result<(), ViewError> {
        self.check(offset, 8)?;
        let bytes: [u8; 8] = match self.order {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        self.data[offset..offset + 8].copy_from_slice(&bytes);
        Ok(())
    }

    /// Get a slice of bytes from the view
    pub fn get_bytes(&self, offset: usize, length: usize) -> Result<&[u8], ViewError> {
        self.check(offset, length)?;
        Ok(&self.data[offset..offset + length])
    }

    /// Copy `length` bytes starting at `src_offset` into `dest` at `dst_offset`
    pub fn copy_into(
        &self,
        dest: &mut ByteView,
        src_offset: usize,
        length: usize,
        dst_offset: usize,
    ) -> Result<(), ViewError> {
        self.check(src_offset, length)?;
        dest.check(dst_offset, length)?;
        dest.data[dst_offset..dst_offset + length]
            .copy_from_slice(&self.data[src_offset..src_offset + length]);
        Ok(())
    }
}
