// SPDX-License-Identifier: Apache-2.0

//! Implementation of [`PfnBitmap`] and [`PageMaps`].

extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

use super::bitmap_word::{BITMAP_WORD_BITS_LOG2, BitmapWord, LEAF_PFNS, LEAF_PFNS_LOG2, LEAF_WORDS};
use crate::image::{PrepError, layout};
use crate::prep_err_internal;
use crate::utils_common::alloc::try_alloc_boxed_slice;

/// Sparse bitmap over the system's page frames.
///
/// The bit storage is split into fixed-size leaves of [`LEAF_PFNS`] bits, one
/// page worth of words each, so that a bitmap never needs a single large
/// contiguous allocation. A sorted leaf directory maps a page frame to its
/// leaf, if any.
///
/// A bitmap is either eager, with all leaves covering the memory map
/// allocated up front, or sparse, with leaves materializing on first
/// [`set()`](Self::set). Eager mode is for the bitmaps known to receive an
/// entry for (nearly) every page during classification; sparse mode for the
/// ones expected to stay mostly empty.
pub struct PfnBitmap {
    /// Leaf directory, sorted by leaf index. Maps each present leaf to its
    /// slot in [`arena`](Self::arena).
    directory: Vec<(u64, usize)>,
    /// Leaf bit storage, in directory insertion order.
    arena: Vec<Box<[BitmapWord]>>,
    /// The memory map ranges the bitmap covers, ascending.
    coverage: Vec<layout::PageFrameRange>,
    /// Whether leaves get allocated lazily on first set.
    sparse: bool,
}

impl PfnBitmap {
    /// Allocate a `PfnBitmap` covering the given memory map.
    ///
    /// # Arguments:
    ///
    /// * `memory_map` - The system memory map as an ascending sequence of
    ///   disjoint page frame ranges.
    /// * `sparse` - If true, defer leaf allocations to the first
    ///   [`set()`](Self::set) hitting each leaf.
    pub fn allocate(memory_map: &[layout::PageFrameRange], sparse: bool) -> Result<Self, PrepError> {
        let mut coverage = Vec::new();
        coverage.try_reserve_exact(memory_map.len())?;
        coverage.extend_from_slice(memory_map);

        let mut bitmap = Self {
            directory: Vec::new(),
            arena: Vec::new(),
            coverage,
            sparse,
        };

        if !sparse {
            let mut last_leaf = None;
            for range in memory_map {
                let first_leaf = u64::from(range.begin()) >> LEAF_PFNS_LOG2;
                let last_range_leaf = (u64::from(range.end()) - 1) >> LEAF_PFNS_LOG2;
                for leaf_index in first_leaf..=last_range_leaf {
                    // Adjacent map ranges may share a boundary leaf.
                    if last_leaf == Some(leaf_index) {
                        continue;
                    }
                    bitmap.alloc_leaf(leaf_index)?;
                    last_leaf = Some(leaf_index);
                }
            }
        }

        Ok(bitmap)
    }

    /// Test whether the bitmap still holds its leaf storage.
    ///
    /// False only before [`allocate()`](Self::allocate) or after
    /// [`free()`](Self::free).
    pub fn is_allocated(&self) -> bool {
        !self.coverage.is_empty()
    }

    /// Release all storage. Idempotent.
    pub fn free(&mut self) {
        self.directory = Vec::new();
        self.arena = Vec::new();
        self.coverage = Vec::new();
    }

    /// Clear every bit, retaining the leaf storage.
    pub fn clear_all(&mut self) {
        for leaf in self.arena.iter_mut() {
            leaf.fill(0);
        }
    }

    /// Set the bit for `pfn`.
    ///
    /// The page frame must be within the covered memory map. For sparse
    /// bitmaps the containing leaf gets allocated as needed.
    pub fn set(&mut self, pfn: layout::PageFrameIndex) -> Result<(), PrepError> {
        if !self.covers(pfn) {
            return Err(prep_err_internal!());
        }

        let pfn = u64::from(pfn);
        let leaf_index = pfn >> LEAF_PFNS_LOG2;
        let slot = match self.leaf_slot(leaf_index) {
            Some(slot) => slot,
            None => {
                if !self.sparse {
                    return Err(prep_err_internal!());
                }
                self.alloc_leaf(leaf_index)?
            }
        };

        let word = ((pfn & (LEAF_PFNS - 1)) >> BITMAP_WORD_BITS_LOG2) as usize;
        self.arena[slot][word] |= (1 as BitmapWord) << (pfn & (BitmapWord::BITS as u64 - 1));
        Ok(())
    }

    /// Clear the bit for `pfn`.
    ///
    /// Clearing a bit whose leaf was never materialized is a nop.
    pub fn clear(&mut self, pfn: layout::PageFrameIndex) {
        let pfn = u64::from(pfn);
        if let Some(slot) = self.leaf_slot(pfn >> LEAF_PFNS_LOG2) {
            let word = ((pfn & (LEAF_PFNS - 1)) >> BITMAP_WORD_BITS_LOG2) as usize;
            self.arena[slot][word] &= !((1 as BitmapWord) << (pfn & (BitmapWord::BITS as u64 - 1)));
        }
    }

    /// Test the bit for `pfn`. Absent leaves read as all-clear.
    pub fn test(&self, pfn: layout::PageFrameIndex) -> bool {
        let pfn = u64::from(pfn);
        match self.leaf_slot(pfn >> LEAF_PFNS_LOG2) {
            Some(slot) => {
                let word = ((pfn & (LEAF_PFNS - 1)) >> BITMAP_WORD_BITS_LOG2) as usize;
                self.arena[slot][word] & ((1 as BitmapWord) << (pfn & (BitmapWord::BITS as u64 - 1))) != 0
            }
            None => false,
        }
    }

    /// Find the first set bit, if any.
    pub fn first_set(&self) -> Option<layout::PageFrameIndex> {
        self.first_set_from(0)
    }

    /// Find the first set bit strictly after `prev`.
    pub fn next_set(&self, prev: layout::PageFrameIndex) -> Option<layout::PageFrameIndex> {
        self.first_set_from(u64::from(prev).checked_add(1)?)
    }

    /// Find the next contiguous run of set bits beginning at or after `from`.
    ///
    /// Returns the run's inclusive bounds.
    pub fn next_run(
        &self,
        from: layout::PageFrameIndex,
    ) -> Option<(layout::PageFrameIndex, layout::PageFrameIndex)> {
        let first = self.first_set_from(u64::from(from))?;
        let end = self.first_clear_from(u64::from(first) + 1);
        Some((first, layout::PageFrameIndex::from(end - 1)))
    }

    /// Number of contiguous runs of set bits.
    ///
    /// Used for sizing the bitmap's image header record before streaming it
    /// out.
    pub fn run_count(&self) -> u64 {
        let mut count = 0;
        let mut pos = layout::PageFrameIndex::from(0);
        while let Some((_, last)) = self.next_run(pos) {
            count += 1;
            pos = match u64::from(last).checked_add(1) {
                Some(next) => layout::PageFrameIndex::from(next),
                None => break,
            };
        }
        count
    }

    /// Test whether `pfn` falls within the covered memory map.
    pub fn covers(&self, pfn: layout::PageFrameIndex) -> bool {
        let i = self.coverage.partition_point(|range| range.end() <= pfn);
        i < self.coverage.len() && self.coverage[i].contains_pfn(pfn)
    }

    fn leaf_slot(&self, leaf_index: u64) -> Option<usize> {
        self.directory
            .binary_search_by_key(&leaf_index, |entry| entry.0)
            .ok()
            .map(|i| self.directory[i].1)
    }

    fn alloc_leaf(&mut self, leaf_index: u64) -> Result<usize, PrepError> {
        let insertion_index = self.directory.partition_point(|entry| entry.0 < leaf_index);
        debug_assert!(
            insertion_index == self.directory.len() || self.directory[insertion_index].0 != leaf_index
        );
        let leaf = try_alloc_boxed_slice::<BitmapWord>(LEAF_WORDS)?;
        self.arena.try_reserve(1)?;
        self.directory.try_reserve(1)?;
        let slot = self.arena.len();
        self.arena.push(leaf);
        self.directory.insert(insertion_index, (leaf_index, slot));
        Ok(slot)
    }

    /// Find the first set bit at or after `from`.
    fn first_set_from(&self, from: u64) -> Option<layout::PageFrameIndex> {
        let mut d = self.directory.partition_point(|entry| entry.0 < from >> LEAF_PFNS_LOG2);
        while d < self.directory.len() {
            let (leaf_index, slot) = self.directory[d];
            let words = &self.arena[slot];
            let leaf_base = leaf_index << LEAF_PFNS_LOG2;
            let skip_words = if leaf_base < from {
                ((from - leaf_base) >> BITMAP_WORD_BITS_LOG2) as usize
            } else {
                0
            };
            for w in skip_words..LEAF_WORDS {
                let word_base = leaf_base + ((w as u64) << BITMAP_WORD_BITS_LOG2);
                let mut word = words[w];
                if word_base < from {
                    word &= !(((1 as BitmapWord) << (from - word_base)) - 1);
                }
                if word != 0 {
                    return Some(layout::PageFrameIndex::from(word_base + word.trailing_zeros() as u64));
                }
            }
            d += 1;
        }
        None
    }

    /// Find the first clear bit at or after `from`, with absent leaves
    /// reading as all-clear.
    fn first_clear_from(&self, from: u64) -> u64 {
        let mut pos = from;
        loop {
            let leaf_index = pos >> LEAF_PFNS_LOG2;
            let slot = match self.leaf_slot(leaf_index) {
                Some(slot) => slot,
                None => return pos,
            };
            let words = &self.arena[slot];
            let leaf_base = leaf_index << LEAF_PFNS_LOG2;
            let mut w = ((pos - leaf_base) >> BITMAP_WORD_BITS_LOG2) as usize;
            while w < LEAF_WORDS {
                let word_base = leaf_base + ((w as u64) << BITMAP_WORD_BITS_LOG2);
                let mut word = words[w];
                if word_base < pos {
                    word |= ((1 as BitmapWord) << (pos - word_base)) - 1;
                }
                if word != BitmapWord::MAX {
                    return word_base + (!word).trailing_zeros() as u64;
                }
                w += 1;
            }
            pos = leaf_base + LEAF_PFNS;
        }
    }

    #[cfg(test)]
    fn allocated_leaves(&self) -> usize {
        self.arena.len()
    }
}

/// The full complement of page frame bitmaps one hibernation cycle works
/// with.
pub struct PageMaps {
    /// Pages to be saved in the atomically restored part of the image.
    pub pageset1: PfnBitmap,
    /// Destination pages holding the atomic copy of pageset 1.
    pub pageset1_copy: PfnBitmap,
    /// Pages saved and restored outside the atomic copy.
    pub pageset2: PfnBitmap,
    /// Pages in flight to or from the backing store.
    pub io: PfnBitmap,
    /// Pages not to be saved at all.
    pub nosave: PfnBitmap,
    /// Pages found free at classification time.
    pub free: PfnBitmap,
    /// Pages to be saved again in the current cycle even though an earlier
    /// incremental image already contains them.
    pub resave: PfnBitmap,
}

impl PageMaps {
    /// Allocate all bitmaps for the given memory map.
    ///
    /// The classification targets and the free map are eager, the rest
    /// sparse.
    pub fn allocate(memory_map: &[layout::PageFrameRange]) -> Result<Self, PrepError> {
        Ok(Self {
            pageset1: PfnBitmap::allocate(memory_map, false)?,
            pageset1_copy: PfnBitmap::allocate(memory_map, true)?,
            pageset2: PfnBitmap::allocate(memory_map, false)?,
            io: PfnBitmap::allocate(memory_map, true)?,
            nosave: PfnBitmap::allocate(memory_map, false)?,
            free: PfnBitmap::allocate(memory_map, false)?,
            resave: PfnBitmap::allocate(memory_map, true)?,
        })
    }

    /// Release all bitmaps. Idempotent.
    pub fn free_all(&mut self) {
        self.pageset1.free();
        self.pageset1_copy.free();
        self.pageset2.free();
        self.io.free();
        self.nosave.free();
        self.free.free();
        self.resave.free();
    }
}

#[cfg(test)]
fn test_memory_map() -> [layout::PageFrameRange; 2] {
    // Two stretches of memory with a large hole in between, the second one
    // beginning in the middle of a leaf.
    [
        layout::PageFrameRange::new(layout::PageFrameIndex::from(0), layout::PageFrameIndex::from(1000)),
        layout::PageFrameRange::new(
            layout::PageFrameIndex::from(3 * LEAF_PFNS + 17),
            layout::PageFrameIndex::from(3 * LEAF_PFNS + 4242),
        ),
    ]
}

#[test]
fn eager_set_test_clear() {
    let mut bitmap = PfnBitmap::allocate(&test_memory_map(), false).unwrap();
    assert_eq!(bitmap.allocated_leaves(), 2);

    let pfn = layout::PageFrameIndex::from(999);
    assert!(!bitmap.test(pfn));
    bitmap.set(pfn).unwrap();
    assert!(bitmap.test(pfn));
    assert!(!bitmap.test(layout::PageFrameIndex::from(998)));
    bitmap.clear(pfn);
    assert!(!bitmap.test(pfn));
}

#[test]
fn sparse_lazy_leaves() {
    let mut bitmap = PfnBitmap::allocate(&test_memory_map(), true).unwrap();
    assert_eq!(bitmap.allocated_leaves(), 0);

    bitmap.set(layout::PageFrameIndex::from(3)).unwrap();
    assert_eq!(bitmap.allocated_leaves(), 1);
    bitmap.set(layout::PageFrameIndex::from(3 * LEAF_PFNS + 100)).unwrap();
    assert_eq!(bitmap.allocated_leaves(), 2);

    // A clear in a never materialized region is a nop.
    let mut other = PfnBitmap::allocate(&test_memory_map(), true).unwrap();
    other.clear(layout::PageFrameIndex::from(3));
    assert_eq!(other.allocated_leaves(), 0);
    assert!(!other.test(layout::PageFrameIndex::from(3)));
}

#[test]
fn next_set_across_leaf_gap() {
    let mut bitmap = PfnBitmap::allocate(&test_memory_map(), false).unwrap();
    bitmap.set(layout::PageFrameIndex::from(63)).unwrap();
    bitmap.set(layout::PageFrameIndex::from(64)).unwrap();
    bitmap.set(layout::PageFrameIndex::from(3 * LEAF_PFNS + 17)).unwrap();

    assert_eq!(bitmap.first_set(), Some(layout::PageFrameIndex::from(63)));
    assert_eq!(
        bitmap.next_set(layout::PageFrameIndex::from(63)),
        Some(layout::PageFrameIndex::from(64))
    );
    assert_eq!(
        bitmap.next_set(layout::PageFrameIndex::from(64)),
        Some(layout::PageFrameIndex::from(3 * LEAF_PFNS + 17))
    );
    assert_eq!(bitmap.next_set(layout::PageFrameIndex::from(3 * LEAF_PFNS + 17)), None);
}

#[test]
fn runs() {
    let mut bitmap = PfnBitmap::allocate(&test_memory_map(), false).unwrap();
    assert_eq!(bitmap.run_count(), 0);

    // One run straddling a word boundary, one single-page run.
    for pfn in 60..70 {
        bitmap.set(layout::PageFrameIndex::from(pfn)).unwrap();
    }
    bitmap.set(layout::PageFrameIndex::from(100)).unwrap();

    assert_eq!(
        bitmap.next_run(layout::PageFrameIndex::from(0)),
        Some((layout::PageFrameIndex::from(60), layout::PageFrameIndex::from(69)))
    );
    assert_eq!(
        bitmap.next_run(layout::PageFrameIndex::from(70)),
        Some((layout::PageFrameIndex::from(100), layout::PageFrameIndex::from(100)))
    );
    assert_eq!(bitmap.run_count(), 2);

    bitmap.clear_all();
    assert_eq!(bitmap.run_count(), 0);
    assert!(bitmap.is_allocated());
}

#[test]
fn free_idempotent() {
    let mut maps = PageMaps::allocate(&test_memory_map()).unwrap();
    maps.pageset1.set(layout::PageFrameIndex::from(1)).unwrap();
    maps.free_all();
    assert!(!maps.pageset1.is_allocated());
    assert!(!maps.pageset1.test(layout::PageFrameIndex::from(1)));
    maps.free_all();
}
