// SPDX-License-Identifier: Apache-2.0

//! Page classification into the image's page sets.

use crate::image::{
    PrepError, layout,
    mm::{AbortFlag, PageOracle},
    pfn_bitmap::{LEAF_PFNS, PageMaps, PfnBitmap},
};
use core::mem;

/// Classification verdict for a single page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageClass {
    /// Not included in the image.
    Nosave,
    /// Saved in the atomically restored part of the image.
    Pageset1,
    /// Saved and restored outside the atomic copy.
    Pageset2,
}

/// Size tally of one page set.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Pageset {
    pub pages: u64,
    pub highmem_pages: u64,
}

impl Pageset {
    pub const fn encoded_len() -> usize {
        2 * mem::size_of::<u64>()
    }

    pub fn encode(&self) -> [u8; Self::encoded_len()] {
        let mut result = [0u8; Self::encoded_len()];
        result[..mem::size_of::<u64>()].copy_from_slice(&self.pages.to_le_bytes());
        result[mem::size_of::<u64>()..].copy_from_slice(&self.highmem_pages.to_le_bytes());
        result
    }

    pub fn decode(buf: &[u8; Self::encoded_len()]) -> Self {
        Self {
            pages: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            highmem_pages: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        }
    }
}

/// Result of one [`classify_pages()`] pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Classification {
    pub pageset1: Pageset,
    pub pageset2: Pageset,
    pub nosave_pages: u64,
    pub free_pages: u64,
}

/// Classify a single page.
///
/// Attention-listed and resave-marked pages always win pageset 1, no matter
/// what the `full_pageset2` policy says; those pages are known to be needed
/// before ordinary reading back of the image can even begin.
fn classify_page(
    pfn: layout::PageFrameIndex,
    oracle: &dyn PageOracle,
    attention: Option<&PfnBitmap>,
    resave: &PfnBitmap,
    full_pageset2: bool,
) -> PageClass {
    if oracle.is_reserved_or_unsaveable(pfn) {
        return PageClass::Nosave;
    }
    if attention.map(|a| a.test(pfn)).unwrap_or(false) || resave.test(pfn) {
        return PageClass::Pageset1;
    }
    if full_pageset2 {
        PageClass::Pageset2
    } else {
        PageClass::Pageset1
    }
}

/// Walk the memory map and assign every page to its set for this cycle.
///
/// Rebuilds the pageset 1, pageset 2, nosave and free bitmaps in `maps` from
/// scratch and returns the resulting size tallies, the negotiation loop's
/// input. Free pages land in the free bitmap only; they are neither saved
/// nor counted against any set.
///
/// # Arguments:
///
/// * `memory_map` - The system memory map.
/// * `oracle` - Per-page queries against the host's memory management.
/// * `attention` - Optional set of pages forced into pageset 1.
/// * `maps` - The cycle's page bitmaps; the resave bitmap is consumed as
///   additional classification input, the rest get rewritten.
/// * `full_pageset2` - Whether ordinary pages default to pageset 2.
/// * `abort` - Cancellation flag, polled once per bitmap leaf worth of
///   pages.
pub fn classify_pages(
    memory_map: &[layout::PageFrameRange],
    oracle: &dyn PageOracle,
    attention: Option<&PfnBitmap>,
    maps: &mut PageMaps,
    full_pageset2: bool,
    abort: &AbortFlag,
) -> Result<Classification, PrepError> {
    maps.pageset1.clear_all();
    maps.pageset2.clear_all();
    maps.nosave.clear_all();
    maps.free.clear_all();

    let mut result = Classification::default();
    for range in memory_map {
        let mut pfn = range.begin();
        while pfn < range.end() {
            if u64::from(pfn) & (LEAF_PFNS - 1) == 0 {
                abort.check()?;
            }

            if oracle.is_free(pfn) {
                maps.free.set(pfn)?;
                result.free_pages += 1;
            } else {
                match classify_page(pfn, oracle, attention, &maps.resave, full_pageset2) {
                    PageClass::Nosave => {
                        maps.nosave.set(pfn)?;
                        result.nosave_pages += 1;
                    }
                    PageClass::Pageset1 => {
                        maps.pageset1.set(pfn)?;
                        result.pageset1.pages += 1;
                        if oracle.is_highmem(pfn) {
                            result.pageset1.highmem_pages += 1;
                        }
                    }
                    PageClass::Pageset2 => {
                        maps.pageset2.set(pfn)?;
                        result.pageset2.pages += 1;
                        if oracle.is_highmem(pfn) {
                            result.pageset2.highmem_pages += 1;
                        }
                    }
                }
            }
            pfn += layout::PageFrameCount::from(1);
        }
    }
    Ok(result)
}

/// [`PageOracle`] with rules simple enough to verify counts by hand.
#[cfg(test)]
struct TestOracle {
    highmem_boundary: u64,
}

#[cfg(test)]
impl PageOracle for TestOracle {
    fn is_reserved_or_unsaveable(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) < 4
    }

    fn is_free(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) % 10 == 9
    }

    fn is_highmem(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) >= self.highmem_boundary
    }
}

#[cfg(test)]
fn test_memory_map() -> [layout::PageFrameRange; 1] {
    [layout::PageFrameRange::new(
        layout::PageFrameIndex::from(0),
        layout::PageFrameIndex::from(100),
    )]
}

#[test]
fn full_pageset2_split() {
    let memory_map = test_memory_map();
    let oracle = TestOracle { highmem_boundary: 50 };
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let c = classify_pages(&memory_map, &oracle, None, &mut maps, true, &AbortFlag::new()).unwrap();
    // 100 pages, 4 reserved, 10 free, rest ordinary.
    assert_eq!(c.nosave_pages, 4);
    assert_eq!(c.free_pages, 10);
    assert_eq!(c.pageset1.pages, 0);
    assert_eq!(c.pageset2.pages, 86);
    // Highmem starts at 50; 5 of those pages are free.
    assert_eq!(c.pageset2.highmem_pages, 45);

    assert!(maps.nosave.test(layout::PageFrameIndex::from(0)));
    assert!(maps.free.test(layout::PageFrameIndex::from(9)));
    assert!(maps.pageset2.test(layout::PageFrameIndex::from(10)));
    assert!(!maps.pageset1.test(layout::PageFrameIndex::from(10)));
}

#[test]
fn attention_and_resave_win_pageset1() {
    let memory_map = test_memory_map();
    let oracle = TestOracle { highmem_boundary: 100 };
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let mut attention = PfnBitmap::allocate(&memory_map, true).unwrap();
    attention.set(layout::PageFrameIndex::from(20)).unwrap();
    maps.resave.set(layout::PageFrameIndex::from(30)).unwrap();

    let c = classify_pages(
        &memory_map,
        &oracle,
        Some(&attention),
        &mut maps,
        true,
        &AbortFlag::new(),
    )
    .unwrap();
    assert_eq!(c.pageset1.pages, 2);
    assert_eq!(c.pageset2.pages, 84);
    assert!(maps.pageset1.test(layout::PageFrameIndex::from(20)));
    assert!(maps.pageset1.test(layout::PageFrameIndex::from(30)));
    assert!(!maps.pageset2.test(layout::PageFrameIndex::from(20)));
}

#[test]
fn without_full_pageset2_everything_is_pageset1() {
    let memory_map = test_memory_map();
    let oracle = TestOracle { highmem_boundary: 100 };
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let c = classify_pages(&memory_map, &oracle, None, &mut maps, false, &AbortFlag::new()).unwrap();
    assert_eq!(c.pageset1.pages, 86);
    assert_eq!(c.pageset2.pages, 0);
}

#[test]
fn reclassification_discards_previous_pass() {
    let memory_map = test_memory_map();
    let oracle = TestOracle { highmem_boundary: 100 };
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let first = classify_pages(&memory_map, &oracle, None, &mut maps, true, &AbortFlag::new()).unwrap();
    let second = classify_pages(&memory_map, &oracle, None, &mut maps, true, &AbortFlag::new()).unwrap();
    assert_eq!(first, second);
    // Pageset 2 holds 4..=8 and the nine stretches between the free pages.
    assert_eq!(maps.pageset2.run_count(), 10);
}

#[test]
fn abort_observed() {
    let memory_map = test_memory_map();
    let oracle = TestOracle { highmem_boundary: 100 };
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let abort = AbortFlag::new();
    abort.set();
    assert_eq!(
        classify_pages(&memory_map, &oracle, None, &mut maps, true, &abort),
        Err(PrepError::Aborted)
    );
}
