//! Fixed-capacity byte buffers.
//!
//! A [Buffer] is opaque storage to the dispatcher. It tracks how many bytes have been written so
//! the I/O layer can hand filled buffers to the adaptor, but it never interprets the contents.

use super::pool::PoolShared;

use std::fmt;
use std::mem;
use std::sync::Weak;

use anyhow::{bail, Result};
use thiserror::Error;

/// A pooled byte buffer.
///
/// Buffers are not `Clone`: a lent buffer has exactly one owner. Dropping it, explicitly through
/// [BufferPool::release](crate::memory::BufferPool::release) or implicitly on an early return,
/// hands the storage back to the pool that lent it.
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    pool: Weak<PoolShared>,
}

impl Buffer {
    /// Creates a buffer that belongs to no pool and is freed on drop.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer::from_pool(vec![0; capacity].into_boxed_slice(), Weak::new())
    }

    pub(crate) fn from_pool(data: Box<[u8]>, pool: Weak<PoolShared>) -> Self {
        Buffer { data, len: 0, pool }
    }

    /// Whether this buffer was lent by `pool`.
    pub(crate) fn belongs_to(&self, pool: &PoolShared) -> bool {
        std::ptr::eq(self.pool.as_ptr(), pool)
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the length of the data written to the buffer.
    pub fn data_len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still available for writing.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Returns the written contents as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Returns a byte slice of data with length count at offset.
    ///
    /// Errors if `offset` is greater than or equal to the data length or `count` exceeds the size
    /// of the data stored at `offset`.
    pub fn get_data_slice(&self, offset: usize, count: usize) -> Result<&[u8]> {
        if offset < self.len {
            match offset.checked_add(count).filter(|end| *end <= self.len) {
                Some(end) => Ok(&self.data[offset..end]),
                None => bail!(BufferError::ReadPastBuffer),
            }
        } else {
            bail!(BufferError::BadOffset)
        }
    }

    /// Appends `bytes` after the current data.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            bail!(BufferError::WritePastBuffer);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Unwritten tail of the buffer, for reads that fill it in place. Follow with
    /// [advance](Buffer::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `count` bytes of the spare region as written.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        if count > self.remaining() {
            bail!(BufferError::WritePastBuffer);
        }
        self.len += count;
        Ok(())
    }

    /// Forgets the written data. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("data_len", &self.len)
            .field("pooled", &(self.pool.strong_count() > 0))
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(mem::take(&mut self.data));
        }
    }
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Offset exceeds data length")]
    BadOffset,

    #[error("Data read exceeds buffer bounds")]
    ReadPastBuffer,

    #[error("Data write exceeds buffer capacity")]
    WritePastBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_buffer_write_and_read() {
        let mut buf = Buffer::with_capacity(8);
        assert!(buf.is_empty());
        buf.extend_from_slice(b"abcd").unwrap();
        assert_eq!(buf.data(), b"abcd");
        assert_eq!(buf.remaining(), 4);
        assert_eq!(buf.get_data_slice(1, 2).unwrap(), b"bc");
        assert!(buf.get_data_slice(4, 1).is_err());
        assert!(buf.get_data_slice(2, 3).is_err());
        assert!(buf.get_data_slice(1, usize::MAX).is_err());
    }

    #[test]
    fn core_buffer_bounds() {
        let mut buf = Buffer::with_capacity(4);
        assert!(buf.extend_from_slice(b"abcde").is_err());
        buf.spare_mut()[..3].copy_from_slice(b"xyz");
        buf.advance(3).unwrap();
        assert_eq!(buf.data(), b"xyz");
        assert!(buf.advance(2).is_err());
        buf.clear();
        assert_eq!(buf.data_len(), 0);
        assert_eq!(buf.capacity(), 4);
    }
}
