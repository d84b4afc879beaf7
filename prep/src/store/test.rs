// SPDX-License-Identifier: Apache-2.0

//! Implementation of [`TestStore`].

extern crate alloc;
use alloc::vec::Vec;

use super::{HibernateStore, StoreIoError};

/// In-memory [`HibernateStore`] emulation for use with testing.
///
/// Blocks are handed out sequentially from a fixed capacity. Setting
/// `grant_run_limit` to something small forces [`allocate()`](HibernateStore::allocate)
/// to fragment grants into multiple short runs, exercising multi-extent
/// chains in the consumers.
pub struct TestStore {
    capacity_blocks: u64,
    next_free_block: u64,
    grant_run_limit: u64,
    header: Vec<u8>,
    header_read_pos: usize,
}

impl TestStore {
    /// Create a new `TestStore` instance.
    ///
    /// # Arguments:
    ///
    /// * `capacity_blocks` - Total number of image blocks the emulated store
    ///   can hand out.
    /// * `grant_run_limit` - Maximum length of a single contiguous granted
    ///   run, for forcing fragmented allocations. Zero means unlimited.
    pub fn new(capacity_blocks: u64, grant_run_limit: u64) -> Self {
        Self {
            capacity_blocks,
            next_free_block: 0,
            grant_run_limit,
            header: Vec::new(),
            header_read_pos: 0,
        }
    }

    /// Create a snapshot clone, emulating the state found on disk after a
    /// reboot.
    pub fn snapshot(&self) -> Self {
        Self {
            capacity_blocks: self.capacity_blocks,
            next_free_block: self.next_free_block,
            grant_run_limit: self.grant_run_limit,
            header: self.header.clone(),
            header_read_pos: 0,
        }
    }

    /// Number of header bytes written so far.
    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// Like [`snapshot()`](Self::snapshot), but with `patch` spliced into
    /// the header stream at byte `offset`.
    pub fn snapshot_with_corruption(&self, offset: usize, patch: &[u8]) -> Self {
        let mut snapshot = self.snapshot();
        snapshot.header[offset..offset + patch.len()].copy_from_slice(patch);
        snapshot
    }
}

impl HibernateStore for TestStore {
    fn available_blocks(&self) -> u64 {
        self.capacity_blocks - self.next_free_block
    }

    fn allocate(&mut self, blocks: u64) -> Result<Vec<(u64, u64)>, StoreIoError> {
        if blocks == 0 {
            return Ok(Vec::new());
        }
        if blocks > self.available_blocks() {
            return Err(StoreIoError::NoSpace);
        }

        let run_limit = if self.grant_run_limit == 0 {
            blocks
        } else {
            self.grant_run_limit
        };
        let mut granted = Vec::new();
        let mut remaining = blocks;
        while remaining != 0 {
            let run = remaining.min(run_limit);
            let first = self.next_free_block;
            self.next_free_block += run;
            granted.push((first, first + run - 1));
            remaining -= run;
        }
        Ok(granted)
    }

    fn release_all(&mut self) {
        self.next_free_block = 0;
    }

    fn write_header_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreIoError> {
        self.header
            .try_reserve(chunk.len())
            .map_err(|_| StoreIoError::MemoryAllocationFailure)?;
        self.header.extend_from_slice(chunk);
        Ok(())
    }

    fn read_header_chunk(&mut self, buf: &mut [u8]) -> Result<(), StoreIoError> {
        let end = self
            .header_read_pos
            .checked_add(buf.len())
            .ok_or(StoreIoError::HeaderStreamOverrun)?;
        if end > self.header.len() {
            return Err(StoreIoError::HeaderStreamOverrun);
        }
        buf.copy_from_slice(&self.header[self.header_read_pos..end]);
        self.header_read_pos = end;
        Ok(())
    }

    fn rewind_header(&mut self) {
        self.header_read_pos = 0;
    }
}

#[test]
fn allocate_sequential() {
    let mut store = TestStore::new(100, 0);
    assert_eq!(store.available_blocks(), 100);
    assert_eq!(store.allocate(10).unwrap(), [(0, 9)]);
    assert_eq!(store.allocate(5).unwrap(), [(10, 14)]);
    assert_eq!(store.available_blocks(), 85);
    assert_eq!(store.allocate(86), Err(StoreIoError::NoSpace));
    store.release_all();
    assert_eq!(store.available_blocks(), 100);
}

#[test]
fn allocate_fragmented() {
    let mut store = TestStore::new(100, 4);
    assert_eq!(store.allocate(10).unwrap(), [(0, 3), (4, 7), (8, 9)]);
}

#[test]
fn header_stream() {
    let mut store = TestStore::new(1, 0);
    store.write_header_chunk(&[1, 2, 3]).unwrap();
    store.write_header_chunk(&[4, 5]).unwrap();

    let mut buf = [0u8; 4];
    store.read_header_chunk(&mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
    let mut buf = [0u8; 2];
    assert_eq!(
        store.read_header_chunk(&mut buf),
        Err(StoreIoError::HeaderStreamOverrun)
    );

    store.rewind_header();
    let mut buf = [0u8; 5];
    store.read_header_chunk(&mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5]);
}
