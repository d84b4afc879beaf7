// SPDX-License-Identifier: Apache-2.0

//! Implementation of [`ExtentChain`].

extern crate alloc;
use alloc::vec::Vec;

use crate::image::{ImageFormatError, PrepError, layout};
use crate::store::HibernateStore;
use core::mem;

/// One serialized extent chain record, a `(first, last)` or
/// `(count, size)` pair of little-endian machine words.
const CHAIN_RECORD_LEN: usize = 2 * mem::size_of::<u64>();

/// Ordered sequence of disjoint image block extents.
///
/// The chain is kept sorted by block index and maximally coalesced at all
/// times: no two stored extents overlap or touch. [`insert()`](Self::insert)
/// maintains this by merging any new range into its neighbors, so the chain's
/// length stays proportional to the backing store's fragmentation no matter
/// in how many installments the blocks were granted.
pub struct ExtentChain {
    /// The extents as inclusive `(first, last)` block index pairs, ascending.
    extents: Vec<(u64, u64)>,
    /// Total number of blocks covered, the sum over all extent lengths.
    total_blocks: u64,
}

impl ExtentChain {
    pub fn new() -> Self {
        Self {
            extents: Vec::new(),
            total_blocks: 0,
        }
    }

    /// Number of extents in the chain.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total number of blocks covered by the chain.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Get the extent at position `index` in block index order.
    pub fn get(&self, index: usize) -> Option<layout::DeviceBlockRange> {
        self.extents.get(index).map(|e| layout::DeviceBlockRange::from(*e))
    }

    pub fn iter(&self) -> impl Iterator<Item = layout::DeviceBlockRange> + '_ {
        self.extents.iter().map(|e| layout::DeviceBlockRange::from(*e))
    }

    /// Add a block range to the chain.
    ///
    /// The range gets merged with any extents it overlaps or touches,
    /// including bridging two previously separate neighbors into one. Blocks
    /// already covered don't count twice towards
    /// [`total_blocks()`](Self::total_blocks).
    ///
    /// # Arguments:
    ///
    /// * `range` - The block range to add.
    pub fn insert(&mut self, range: layout::DeviceBlockRange) -> Result<(), PrepError> {
        let first = u64::from(range.first());
        let last = u64::from(range.last());

        // Window of extents overlapping or touching the new range.
        let lo = self.extents.partition_point(|e| e.1.saturating_add(1) < first);
        let hi = lo + self.extents[lo..].partition_point(|e| e.0 <= last.saturating_add(1));

        if lo == hi {
            self.extents.try_reserve(1)?;
            self.extents.insert(lo, (first, last));
            self.total_blocks += last - first + 1;
            return Ok(());
        }

        let merged_first = first.min(self.extents[lo].0);
        let merged_last = last.max(self.extents[hi - 1].1);
        let absorbed_blocks: u64 = self.extents[lo..hi].iter().map(|e| e.1 - e.0 + 1).sum();
        self.extents[lo] = (merged_first, merged_last);
        self.extents.drain(lo + 1..hi);
        self.total_blocks += (merged_last - merged_first + 1) - absorbed_blocks;
        Ok(())
    }

    /// Remove all extents.
    pub fn clear(&mut self) {
        self.extents = Vec::new();
        self.total_blocks = 0;
    }

    /// Stream the chain out to the image header.
    ///
    /// The wire format is one `(count, size)` record followed by `count`
    /// `(first, last)` extent records. The covered block total is re-walked
    /// while writing and checked against the recorded size; on mismatch the
    /// chain is dumped to the log and the write fails rather than producing
    /// an unrestorable image.
    pub fn write_to(&self, store: &mut dyn HibernateStore) -> Result<(), PrepError> {
        let mut record = [0u8; CHAIN_RECORD_LEN];
        record[..mem::size_of::<u64>()].copy_from_slice(&(self.extents.len() as u64).to_le_bytes());
        record[mem::size_of::<u64>()..].copy_from_slice(&self.total_blocks.to_le_bytes());
        store.write_header_chunk(&record)?;

        let mut walked_blocks = 0u64;
        for (first, last) in self.extents.iter() {
            let mut record = [0u8; CHAIN_RECORD_LEN];
            record[..mem::size_of::<u64>()].copy_from_slice(&first.to_le_bytes());
            record[mem::size_of::<u64>()..].copy_from_slice(&last.to_le_bytes());
            store.write_header_chunk(&record)?;
            walked_blocks += last - first + 1;
        }

        if walked_blocks != self.total_blocks {
            log::error!(
                "extent chain corrupt: records cover {} blocks, size says {}",
                walked_blocks,
                self.total_blocks
            );
            for (i, (first, last)) in self.extents.iter().enumerate() {
                log::error!("  extent {}: [{}, {}]", i, first, last);
            }
            return Err(PrepError::StructuralInconsistency);
        }
        Ok(())
    }

    /// Read a chain back from the image header.
    ///
    /// The extent records must be ascending and non-overlapping and their
    /// lengths must add up to the recorded size, otherwise the header is
    /// rejected with [`ImageFormatError::InvalidChainRecord`].
    pub fn read_from(store: &mut dyn HibernateStore) -> Result<Self, PrepError> {
        let mut record = [0u8; CHAIN_RECORD_LEN];
        store.read_header_chunk(&mut record)?;
        let count = u64::from_le_bytes(
            *<&[u8; mem::size_of::<u64>()]>::try_from(&record[..mem::size_of::<u64>()])
                .map_err(|_| PrepError::from(ImageFormatError::InvalidChainRecord))?,
        );
        let total_blocks = u64::from_le_bytes(
            *<&[u8; mem::size_of::<u64>()]>::try_from(&record[mem::size_of::<u64>()..])
                .map_err(|_| PrepError::from(ImageFormatError::InvalidChainRecord))?,
        );
        let count =
            usize::try_from(count).map_err(|_| PrepError::from(ImageFormatError::InvalidChainRecord))?;

        let mut extents = Vec::new();
        extents.try_reserve_exact(count)?;
        let mut walked_blocks = 0u64;
        let mut prev_last: Option<u64> = None;
        for _ in 0..count {
            let mut record = [0u8; CHAIN_RECORD_LEN];
            store.read_header_chunk(&mut record)?;
            let first = u64::from_le_bytes(
                *<&[u8; mem::size_of::<u64>()]>::try_from(&record[..mem::size_of::<u64>()])
                    .map_err(|_| PrepError::from(ImageFormatError::InvalidChainRecord))?,
            );
            let last = u64::from_le_bytes(
                *<&[u8; mem::size_of::<u64>()]>::try_from(&record[mem::size_of::<u64>()..])
                    .map_err(|_| PrepError::from(ImageFormatError::InvalidChainRecord))?,
            );
            if first > last || prev_last.map(|p| p >= first).unwrap_or(false) {
                return Err(PrepError::from(ImageFormatError::InvalidChainRecord));
            }
            walked_blocks = walked_blocks
                .checked_add(last - first + 1)
                .ok_or(PrepError::from(ImageFormatError::InvalidChainRecord))?;
            extents.push((first, last));
            prev_last = Some(last);
        }
        if walked_blocks != total_blocks {
            return Err(PrepError::from(ImageFormatError::InvalidChainRecord));
        }

        Ok(Self { extents, total_blocks })
    }
}

impl Default for ExtentChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
fn range(first: u64, last: u64) -> layout::DeviceBlockRange {
    layout::DeviceBlockRange::from((first, last))
}

#[cfg(test)]
fn chain_extents(chain: &ExtentChain) -> Vec<(u64, u64)> {
    chain.iter().map(|e| (u64::from(e.first()), u64::from(e.last()))).collect()
}

#[test]
fn insert_merges_adjacent() {
    let mut chain = ExtentChain::new();
    chain.insert(range(10, 20)).unwrap();
    chain.insert(range(21, 30)).unwrap();
    assert_eq!(chain_extents(&chain), [(10, 30)]);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain.total_blocks(), 21);
}

#[test]
fn insert_bridges_neighbors() {
    let mut chain = ExtentChain::new();
    chain.insert(range(10, 20)).unwrap();
    chain.insert(range(25, 30)).unwrap();
    assert_eq!(chain.len(), 2);
    chain.insert(range(21, 24)).unwrap();
    assert_eq!(chain_extents(&chain), [(10, 30)]);
    assert_eq!(chain.total_blocks(), 21);
}

#[test]
fn insert_disjoint_keeps_order() {
    let mut chain = ExtentChain::new();
    chain.insert(range(100, 110)).unwrap();
    chain.insert(range(0, 5)).unwrap();
    chain.insert(range(50, 60)).unwrap();
    assert_eq!(chain_extents(&chain), [(0, 5), (50, 60), (100, 110)]);
    assert_eq!(chain.total_blocks(), 6 + 11 + 11);
}

#[test]
fn insert_overlap_counts_once() {
    let mut chain = ExtentChain::new();
    chain.insert(range(10, 20)).unwrap();
    chain.insert(range(15, 40)).unwrap();
    assert_eq!(chain_extents(&chain), [(10, 40)]);
    assert_eq!(chain.total_blocks(), 31);

    // Fully contained range changes nothing.
    chain.insert(range(12, 13)).unwrap();
    assert_eq!(chain_extents(&chain), [(10, 40)]);
    assert_eq!(chain.total_blocks(), 31);
}

#[test]
fn insert_sequences_keep_invariants() {
    // Pseudo-random insertion orders with plenty of overlap and adjacency.
    let mut seed = 0x243f6a8885a308d3u64;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for _ in 0..32 {
        let mut chain = ExtentChain::new();
        for _ in 0..64 {
            let first = next() % 256;
            let last = first + next() % 16;
            chain.insert(range(first, last)).unwrap();

            let extents = chain_extents(&chain);
            let mut covered = 0;
            for (i, (first, last)) in extents.iter().enumerate() {
                assert!(first <= last);
                if i > 0 {
                    // Ascending and never adjacent.
                    assert!(extents[i - 1].1 + 1 < *first);
                }
                covered += last - first + 1;
            }
            assert_eq!(chain.total_blocks(), covered);
        }
    }
}

#[test]
fn write_read_roundtrip() {
    use crate::store::test::TestStore;

    let mut chain = ExtentChain::new();
    chain.insert(range(0, 9)).unwrap();
    chain.insert(range(20, 29)).unwrap();
    chain.insert(range(40, 40)).unwrap();

    let mut store = TestStore::new(64, 0);
    chain.write_to(&mut store).unwrap();
    assert_eq!(store.header_len(), (1 + 3) * CHAIN_RECORD_LEN);

    let read_back = ExtentChain::read_from(&mut store).unwrap();
    assert_eq!(chain_extents(&read_back), chain_extents(&chain));
    assert_eq!(read_back.total_blocks(), chain.total_blocks());
}

#[test]
fn read_rejects_inconsistent_records() {
    use crate::store::test::TestStore;

    // Overlapping extents.
    let mut store = TestStore::new(64, 0);
    for record in [(2u64, 21u64), (10, 20), (15, 25)] {
        let mut chunk = [0u8; CHAIN_RECORD_LEN];
        chunk[..8].copy_from_slice(&record.0.to_le_bytes());
        chunk[8..].copy_from_slice(&record.1.to_le_bytes());
        store.write_header_chunk(&chunk).unwrap();
    }
    assert_eq!(
        ExtentChain::read_from(&mut store).err(),
        Some(PrepError::from(ImageFormatError::InvalidChainRecord))
    );

    // Size total not matching the records.
    let mut store = TestStore::new(64, 0);
    for record in [(1u64, 99u64), (10, 20)] {
        let mut chunk = [0u8; CHAIN_RECORD_LEN];
        chunk[..8].copy_from_slice(&record.0.to_le_bytes());
        chunk[8..].copy_from_slice(&record.1.to_le_bytes());
        store.write_header_chunk(&chunk).unwrap();
    }
    assert_eq!(
        ExtentChain::read_from(&mut store).err(),
        Some(PrepError::from(ImageFormatError::InvalidChainRecord))
    );
}
