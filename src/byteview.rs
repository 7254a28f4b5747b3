//! Immutable byte snapshots handed out by the cache.

use std::fmt;
use std::sync::Arc;

/// An immutable view over a cached value.
///
/// Clones are cheap (shared buffer). Constructors copy the input bytes, so a
/// caller can never mutate a value after it has been admitted to a cache.
///
/// The empty view is reserved as the negative-cache tombstone: authoritative
/// values are always non-empty, so an empty view means "known absent".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteView {
    b: Arc<[u8]>,
}

impl ByteView {
    /// Creates a view that owns a copy of `bytes`.
    pub fn new(bytes: &[u8]) -> Self {
        Self { b: bytes.into() }
    }

    /// Returns the length of the value in bytes.
    pub fn len(&self) -> usize {
        self.b.len()
    }

    /// Returns `true` if the view holds no bytes (the tombstone).
    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    /// Borrows the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.b
    }

    /// Copies the value out into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.b.to_vec()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(bytes: Vec<u8>) -> Self {
        Self { b: bytes.into() }
    }
}

impl From<&[u8]> for ByteView {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Display for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.b))
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteView({} bytes)", self.b.len())
    }
}
