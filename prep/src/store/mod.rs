// SPDX-License-Identifier: Apache-2.0

//! Definition of the [`HibernateStore`] trait, the storage backend boundary
//! the image preparation engine builds on.

extern crate alloc;
use alloc::vec::Vec;

#[cfg(test)]
pub mod test;

/// Error type returned by [`HibernateStore`] primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreIoError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// Insufficient free blocks left on the backing store.
    NoSpace,

    /// A header chunk read was attempted past the end of the written header
    /// stream.
    HeaderStreamOverrun,

    /// Unspecified IO failure.
    IoFailure,
}

/// Interface to the backing store of one hibernation image.
///
/// The engine consumes the backend through exactly two capabilities: a block
/// allocator for the image's data extents and a sequential chunk stream for
/// the image header metadata. Everything else about the device -- bio
/// submission, readahead, completion handling -- is the backend's business
/// and never surfaces here.
///
/// All operations are synchronous: the preparation engine runs on a single
/// control thread per hibernation attempt, with an exclusive
/// one-cycle-at-a-time guard held around it, so there is never more than one
/// outstanding request.
pub trait HibernateStore {
    /// Number of image blocks the backend could still hand out via
    /// [`allocate()`](Self::allocate).
    fn available_blocks(&self) -> u64;

    /// Reserve `blocks` more blocks for the image.
    ///
    /// On success the granted block ranges are returned as inclusive
    /// `(first, last)` pairs, in ascending order. The backend is free to
    /// fragment a request across discontiguous regions of the device; the
    /// engine coalesces the grants into its extent chains itself.
    ///
    /// # Arguments:
    ///
    /// * `blocks` - Number of additional blocks to reserve.
    fn allocate(&mut self, blocks: u64) -> Result<Vec<(u64, u64)>, StoreIoError>;

    /// Return every block previously [allocated](Self::allocate) to the
    /// backend.
    ///
    /// Idempotent; called unconditionally during unwind.
    fn release_all(&mut self);

    /// Append one chunk of raw bytes to the image header stream.
    ///
    /// # Arguments:
    ///
    /// * `chunk` - The bytes to append.
    fn write_header_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreIoError>;

    /// Read the next `buf.len()` bytes from the image header stream.
    ///
    /// Reading past the end of what had been written yields
    /// [`StoreIoError::HeaderStreamOverrun`].
    ///
    /// # Arguments:
    ///
    /// * `buf` - Destination buffer, filled completely on success.
    fn read_header_chunk(&mut self, buf: &mut [u8]) -> Result<(), StoreIoError>;

    /// Reset the header stream read position back to the stream's beginning.
    fn rewind_header(&mut self);
}
