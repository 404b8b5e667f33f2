//! The receive buffer owned by an [`AsyncSocket`](crate::AsyncSocket).
//!
//! A [`Buffer`] is a fixed-capacity byte region plus the number of bytes in
//! it that are currently valid. The engine never writes into a buffer that
//! an observer may be looking at. Instead buffers are swapped:
//!
//! 1. **Fresh**: [`Buffer::new`] allocates `capacity` zeroed bytes with no
//!    valid data.
//! 2. **Lent**: [`Buffer::lend`] moves the region out to the transport for
//!    the duration of one receive.
//! 3. **Filled**: the region comes back in the completion and is wrapped by
//!    [`Buffer::from_vec`] with the received length, becoming the new current
//!    buffer.
//!
//! If the receive yields nothing, the region is put back with
//! [`Buffer::restore`].
//!
//! With the `zeroize` feature, regions are wiped before they are released.

use std::fmt;

/// Receive capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 8192;

/// A fixed-capacity byte region and a count of valid bytes.
///
/// Invariant: `available_len() <= capacity()`.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
  bytes: Vec<u8>,
  capacity: usize,
  available: usize,
}

impl Buffer {
  /// Allocates a fresh buffer holding no valid data.
  ///
  /// A zero capacity is raised to one byte.
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self { bytes: vec![0; capacity], capacity, available: 0 }
  }

  /// Wraps an existing region of which the first `available` bytes are
  /// valid.
  ///
  /// `available` is clamped to the region's length.
  pub fn from_vec(bytes: Vec<u8>, available: usize) -> Self {
    let capacity = bytes.len();
    Self { bytes, capacity, available: available.min(capacity) }
  }

  /// The full region, including bytes past [`available_len`](Self::available_len).
  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// The valid bytes.
  pub fn as_slice(&self) -> &[u8] {
    &self.bytes[..self.available.min(self.bytes.len())]
  }

  pub fn available_len(&self) -> usize {
    self.available
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn is_empty(&self) -> bool {
    self.available == 0
  }

  /// Whether the region is currently lent out to the transport.
  pub fn is_lent(&self) -> bool {
    self.bytes.is_empty()
  }

  /// Changes the capacity. Previous data is lost when the capacity changes.
  pub fn resize(&mut self, capacity: usize) {
    let capacity = capacity.max(1);
    if capacity != self.capacity {
      self.wipe();
      self.bytes = vec![0; capacity];
      self.capacity = capacity;
      self.available = 0;
    }
  }

  /// Moves the region out, leaving an empty buffer that remembers its
  /// capacity.
  pub(crate) fn lend(&mut self) -> Vec<u8> {
    self.available = 0;
    if self.bytes.is_empty() {
      return vec![0; self.capacity];
    }
    std::mem::take(&mut self.bytes)
  }

  /// Puts a lent region back without marking any of it valid.
  pub(crate) fn restore(&mut self, mut region: Vec<u8>) {
    region.resize(self.capacity, 0);
    self.bytes = region;
    self.available = 0;
  }

  /// Consumes the buffer, returning the valid bytes.
  pub fn into_vec(mut self) -> Vec<u8> {
    let mut bytes = std::mem::take(&mut self.bytes);
    bytes.truncate(self.available);
    bytes
  }

  #[cfg(feature = "bytes")]
  #[cfg_attr(docsrs, doc(cfg(feature = "bytes")))]
  pub fn to_bytes(&self) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(self.as_slice())
  }

  fn wipe(&mut self) {
    #[cfg(feature = "zeroize")]
    zeroize::Zeroize::zeroize(&mut self.bytes);
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    self.wipe();
  }
}

impl Default for Buffer {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl AsRef<[u8]> for Buffer {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("capacity", &self.capacity)
      .field("available", &self.available)
      .field("lent", &self.is_lent())
      .finish()
  }
}

#[cfg(feature = "bytes")]
impl From<Buffer> for bytes::Bytes {
  fn from(value: Buffer) -> Self {
    bytes::Bytes::from(value.into_vec())
  }
}
