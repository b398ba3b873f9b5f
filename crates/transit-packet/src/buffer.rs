//! # Shared Backing Buffer
//!
//! A fixed-capacity, reference-counted byte buffer. Cloning a [`Buffer`]
//! adds a reference to the same bytes; writing requires the handle to be
//! the only one (single writer, many readers), which is checked at the call
//! rather than enforced with a lock.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

struct BufferData {
    bytes: Box<[u8]>,
    len: usize,
}

/// Reference-counted backing storage for packets.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferData>,
}

impl Buffer {
    /// Allocate a zeroed buffer of `capacity` bytes with length 0.
    pub fn new(capacity: usize) -> Self {
        Buffer {
            inner: Arc::new(BufferData {
                bytes: vec![0u8; capacity].into_boxed_slice(),
                len: 0,
            }),
        }
    }

    /// Allocate a buffer holding a copy of `data`; capacity and length are
    /// both `data.len()`.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Buffer {
            inner: Arc::new(BufferData {
                bytes: data.to_vec().into_boxed_slice(),
                len: data.len(),
            }),
        }
    }

    /// Valid data length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.bytes.len()
    }

    /// Number of handles sharing this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// The valid data (`len` bytes).
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.bytes[..self.inner.len]
    }

    /// The whole writable region (`capacity` bytes).
    ///
    /// Fails with [`Error::PermissionDenied`] if the buffer is shared.
    pub fn buf_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.exclusive()?.bytes[..])
    }

    /// Set the valid data length.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        let data = self.exclusive()?;
        if len > data.bytes.len() {
            return Err(Error::InvalidArgument("length exceeds capacity"));
        }
        data.len = len;
        Ok(())
    }

    fn exclusive(&mut self) -> Result<&mut BufferData> {
        Arc::get_mut(&mut self.inner).ok_or(Error::PermissionDenied)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty() {
        let buf = Buffer::new(64);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 64);
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn write_then_set_len() {
        let mut buf = Buffer::new(8);
        buf.buf_mut().unwrap()[..3].copy_from_slice(b"abc");
        buf.set_len(3).unwrap();
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn shared_buffer_rejects_writes() {
        let mut buf = Buffer::copy_from_slice(b"payload");
        let other = buf.clone();
        assert_eq!(buf.ref_count(), 2);
        assert_eq!(buf.buf_mut().unwrap_err(), Error::PermissionDenied);
        assert_eq!(buf.set_len(1).unwrap_err(), Error::PermissionDenied);
        drop(other);
        assert!(buf.set_len(1).is_ok());
    }

    #[test]
    fn set_len_beyond_capacity() {
        let mut buf = Buffer::new(4);
        assert!(matches!(buf.set_len(5), Err(Error::InvalidArgument(_))));
    }
}
