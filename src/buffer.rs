//! The byte buffers queued for delivery.

use bytes::Bytes;
use std::ops::Deref;

/// An owned, reference counted slice of bytes.
///
/// Cloning is cheap and never copies the payload. An empty buffer is the
/// end-of-stream sentinel: feeding one signals that no further data will
/// follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer(Bytes);

impl Buffer {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// The end-of-stream sentinel.
    pub fn eos() -> Self {
        Self(Bytes::new())
    }

    /// Copies `data` into a freshly allocated buffer.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this buffer is the end-of-stream sentinel.
    pub fn is_eos(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&'static str> for Buffer {
    fn from(data: &'static str) -> Self {
        Self(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }
}
