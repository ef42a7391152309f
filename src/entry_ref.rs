//! Compact handles into a data store.
//!
//! An [`EntryRef`] packs a buffer id and an element offset into 32 bits, in
//! the same spirit as a compressed arena offset: it is a plain index, never a
//! pointer, so it stays `Copy` and carries no destructor.

use std::fmt;

/// Bits used for the offset within a buffer.
pub const OFFSET_BITS: u32 = 22;

/// Bits used for the buffer id.
pub const BUFFER_BITS: u32 = 32 - OFFSET_BITS;

/// Number of buffer ids a single store can address.
pub const NUM_BUFFERS: usize = 1 << BUFFER_BITS;

/// Number of elements a single buffer can address.
pub const OFFSET_SIZE: usize = 1 << OFFSET_BITS;

const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;

/// Handle to an entry stored in a [`DataStore`](crate::DataStore).
///
/// Layout (as an integer):
/// - bits 0..22: offset of the first element within the buffer
/// - bits 22..32: buffer id
///
/// Raw value 0 (buffer 0, offset 0) is the invalid ref. The first element of
/// buffer 0 is always reserved, so the invalid ref never aliases an entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EntryRef(u32);

impl EntryRef {
    /// The invalid ref.
    pub const INVALID: EntryRef = EntryRef(0);

    /// Pack a buffer id and offset.
    ///
    /// # Panics
    /// Panics if either component does not fit its field.
    #[inline]
    pub fn new(buffer_id: u32, offset: usize) -> Self {
        assert!((buffer_id as usize) < NUM_BUFFERS, "buffer id {buffer_id} out of range");
        assert!(offset < OFFSET_SIZE, "offset {offset} out of range");
        Self((buffer_id << OFFSET_BITS) | offset as u32)
    }

    /// Rebuild a ref from its raw integer form.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn buffer_id(self) -> u32 {
        self.0 >> OFFSET_BITS
    }

    #[inline]
    pub const fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "EntryRef({}:{})", self.buffer_id(), self.offset())
        } else {
            f.write_str("EntryRef(invalid)")
        }
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.buffer_id(), self.offset())
    }
}
