// SPDX-License-Identifier: Apache-2.0

//! Image size negotiation.
//!
//! Whether a hibernation image fits is not a single predicate: the amount of
//! memory to save, the free memory needed as atomic copy destination and
//! scratch space, the backing storage and the user's size cap all constrain
//! each other, and freeing memory to satisfy one constraint changes the
//! others. [`Negotiator::negotiate()`] iterates classification, constraint
//! evaluation and reclaim until everything fits at once or the retry budget
//! runs out.

extern crate alloc;

use crate::image::{
    InfeasibleReason, PrepError,
    extents::ExtentChain,
    header,
    layout::{self, ImageSizeLimit, PAGE_BYTES_LOG2, PrepConfig},
    mm::{AbortFlag, Freezer, MemoryCollaborator, PageOracle},
    pageset::{Pageset, classify_pages},
    pfn_bitmap::{PageMaps, PfnBitmap},
};
use crate::prep_err_internal;
use crate::store::{HibernateStore, StoreIoError};
use crate::utils_common::bitmanip::UBitManip as _;

/// Extra extents figured into the header size estimate, on top of the
/// chains' current extent counts.
///
/// The header stores the chains, but the chains must be sized before the
/// header is final. The slack absorbs the extents further allocation rounds
/// may add; sixteen covers even heavily fragmented stores, and the cost of
/// over-estimating is a few header bytes.
const CHAIN_EXTENTS_SLACK: u64 = 16;

/// Outcome of a successful negotiation.
///
/// The storage reservations and page bitmaps backing it stay live; writing
/// the image out consumes them. Userspace remains frozen.
pub struct PreparedImage {
    pub pageset1: Pageset,
    pub pageset2: Pageset,
    pub header_chain: ExtentChain,
    pub pageset1_chain: ExtentChain,
    pub pageset2_chain: ExtentChain,
    /// Total blocks reserved on the backing store across all three chains.
    pub storage_blocks_allocated: u64,
    /// Number of negotiation iterations it took to converge.
    pub tries_used: u32,
}

/// One hibernation attempt's size negotiation.
pub struct Negotiator<'a> {
    config: &'a PrepConfig,
    memory_map: &'a [layout::PageFrameRange],
    oracle: &'a dyn PageOracle,
    /// Pages forced into pageset 1, if any.
    attention: Option<&'a PfnBitmap>,
    /// Total encoded size of the module configuration blocks that will
    /// accompany the header.
    module_config_bytes: u64,
    mm: &'a mut dyn MemoryCollaborator,
    freezer: &'a mut dyn Freezer,
    store: &'a mut dyn HibernateStore,
    abort: &'a AbortFlag,
}

impl<'a> Negotiator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a PrepConfig,
        memory_map: &'a [layout::PageFrameRange],
        oracle: &'a dyn PageOracle,
        attention: Option<&'a PfnBitmap>,
        module_config_bytes: u64,
        mm: &'a mut dyn MemoryCollaborator,
        freezer: &'a mut dyn Freezer,
        store: &'a mut dyn HibernateStore,
        abort: &'a AbortFlag,
    ) -> Self {
        Self {
            config,
            memory_map,
            oracle,
            attention,
            module_config_bytes,
            mm,
            freezer,
            store,
            abort,
        }
    }

    /// Freeze userspace and negotiate the image's size and storage.
    ///
    /// On success userspace stays frozen and the returned
    /// [`PreparedImage`]'s storage reservations are live. On any error the
    /// attempt is fully unwound first: tasks thawed, storage released and
    /// the bitmaps in `maps` freed.
    ///
    /// # Arguments:
    ///
    /// * `maps` - The cycle's page bitmaps, rewritten by the classification
    ///   passes.
    pub fn negotiate(&mut self, maps: &mut PageMaps) -> Result<PreparedImage, PrepError> {
        if let Err(e) = self.freezer.freeze_processes() {
            self.freezer.thaw_processes();
            return Err(e);
        }

        match self.negotiate_frozen(maps) {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.freezer.thaw_processes();
                self.store.release_all();
                maps.free_all();
                Err(e)
            }
        }
    }

    fn negotiate_frozen(&mut self, maps: &mut PageMaps) -> Result<PreparedImage, PrepError> {
        let mut header_chain = ExtentChain::new();
        let mut pageset1_chain = ExtentChain::new();
        let mut pageset2_chain = ExtentChain::new();

        for try_number in 1..=self.config.max_tries {
            self.abort.check()?;

            let classification = classify_pages(
                self.memory_map,
                self.oracle,
                self.attention,
                maps,
                self.config.full_pageset2,
                self.abort,
            )?;
            let pageset1 = classification.pageset1;
            let pageset2 = classification.pageset2;
            let image_pages = pageset1
                .pages
                .checked_add(pageset2.pages)
                .ok_or_else(|| prep_err_internal!())?;

            // Memory constraints. Pageset 2's pages are available as atomic
            // copy destination, so only the halved surplus of pageset 1 over
            // pageset 2 must come out of free memory, per zone.
            let free_highmem = self.mm.free_highmem_pages();
            let free_lowmem = self.mm.free_lowmem_pages();
            let highpages_needed = pageset1
                .highmem_pages
                .saturating_sub(pageset2.highmem_pages)
                .div_ceil(2)
                .saturating_sub(free_highmem);
            let pageset1_lowmem = pageset1.pages - pageset1.highmem_pages;
            let pageset2_lowmem = pageset2.pages - pageset2.highmem_pages;
            let lowpages_needed = (pageset1_lowmem
                .saturating_sub(pageset2_lowmem)
                .div_ceil(2)
                + self.config.min_free_lowmem_pages
                + self.config.extra_pages_allowance)
                .saturating_sub(free_lowmem);

            // Storage constraints.
            let expected_compression_percent = self.config.expected_compression_percent as u64;
            let data_blocks = image_pages
                .checked_mul(expected_compression_percent)
                .ok_or_else(|| prep_err_internal!())?
                .div_ceil(100);
            let chain_extents = (header_chain.len() + pageset1_chain.len() + pageset2_chain.len())
                as u64
                + CHAIN_EXTENTS_SLACK;
            let header_bytes =
                header::estimated_bytes(self.module_config_bytes, &maps.pageset1, chain_extents);
            let header_blocks = header_bytes
                .round_up_pow2(PAGE_BYTES_LOG2)
                .ok_or_else(|| prep_err_internal!())?
                >> PAGE_BYTES_LOG2;
            let needed_blocks = data_blocks
                .checked_add(header_blocks)
                .ok_or_else(|| prep_err_internal!())?;

            let allocated_blocks = header_chain.total_blocks()
                + pageset1_chain.total_blocks()
                + pageset2_chain.total_blocks();
            let storage_budget = allocated_blocks + self.store.available_blocks();
            let mut excess_blocks = needed_blocks.saturating_sub(storage_budget);
            if let ImageSizeLimit::MaxBlocks(limit) = self.config.image_size_limit {
                excess_blocks = excess_blocks.max(needed_blocks.saturating_sub(limit));
            }
            // Converting the block excess back to a page target inverts the
            // compression estimate.
            let storage_pages_needed = excess_blocks
                .checked_mul(100)
                .ok_or_else(|| prep_err_internal!())?
                .div_ceil(expected_compression_percent);

            let pages_still_needed = highpages_needed
                .max(lowpages_needed)
                .max(storage_pages_needed);

            if pages_still_needed == 0 {
                let header_grown = grow_chain(self.store, &mut header_chain, header_blocks)?;
                let pageset1_blocks = pageset1
                    .pages
                    .checked_mul(expected_compression_percent)
                    .ok_or_else(|| prep_err_internal!())?
                    .div_ceil(100);
                let pageset1_grown = grow_chain(self.store, &mut pageset1_chain, pageset1_blocks)?;
                let pageset2_grown =
                    grow_chain(self.store, &mut pageset2_chain, data_blocks - pageset1_blocks)?;
                if header_grown && pageset1_grown && pageset2_grown {
                    let storage_blocks_allocated = header_chain.total_blocks()
                        + pageset1_chain.total_blocks()
                        + pageset2_chain.total_blocks();
                    log::info!(
                        "image negotiated after {} tries: {} pages, {} blocks",
                        try_number,
                        image_pages,
                        storage_blocks_allocated
                    );
                    return Ok(PreparedImage {
                        pageset1,
                        pageset2,
                        header_chain,
                        pageset1_chain,
                        pageset2_chain,
                        storage_blocks_allocated,
                        tries_used: try_number,
                    });
                }
                // The store granted less than it advertised. Re-evaluate,
                // the next pass will see the shortfall as a storage excess.
                log::debug!("try {}: storage grants fell short, retrying", try_number);
                continue;
            }

            if self.config.image_size_limit == ImageSizeLimit::NoEating {
                log::warn!(
                    "image {} pages over target, not allowed to eat memory",
                    pages_still_needed
                );
                return Err(PrepError::ImageInfeasible(
                    InfeasibleReason::WouldNeedToEatMemory,
                ));
            }

            log::info!(
                "try {}: {} pages over target (high {}, low {}, storage {}), reclaiming",
                try_number,
                pages_still_needed,
                highpages_needed,
                lowpages_needed,
                storage_pages_needed
            );
            self.mm.drop_page_cache();
            let freed = self.mm.shrink_memory(pages_still_needed);
            if freed == 0 && storage_pages_needed == pages_still_needed {
                // Reclaim can't shrink the image any further and the store
                // can't cover it as it stands.
                return Err(PrepError::ImageInfeasible(
                    InfeasibleReason::InsufficientStorage,
                ));
            }
        }

        Err(PrepError::ImageInfeasible(InfeasibleReason::TriesExhausted))
    }
}

/// Grow a chain's storage reservation up to `target_blocks` total.
///
/// Returns false if the store ran out of space before the target was
/// reached; blocks granted up to that point stay in the chain.
fn grow_chain(
    store: &mut dyn HibernateStore,
    chain: &mut ExtentChain,
    target_blocks: u64,
) -> Result<bool, PrepError> {
    while chain.total_blocks() < target_blocks {
        let granted = match store.allocate(target_blocks - chain.total_blocks()) {
            Ok(granted) => granted,
            Err(StoreIoError::NoSpace) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if granted.is_empty() {
            return Ok(false);
        }
        for range in granted {
            chain.insert(layout::DeviceBlockRange::from(range))?;
        }
    }
    Ok(true)
}

#[cfg(test)]
use alloc::{collections::BTreeSet, rc::Rc};
#[cfg(test)]
use core::cell::RefCell;

/// Shared state of the memory management doubles.
///
/// Memory is modeled as one flat range of `total_pages` frames, the first
/// `reserved_pages` of them unsaveable and the ones at or above
/// `highmem_boundary` highmem. Reclaim frees pages from the top down, so
/// classification passes observe the shrinking image the way they would on a
/// live system.
#[cfg(test)]
struct TestMmState {
    total_pages: u64,
    highmem_boundary: u64,
    reserved_pages: u64,
    free: BTreeSet<u64>,
    /// Upper bound on pages freed per [`shrink_memory()`](MemoryCollaborator::shrink_memory) call.
    shrink_step: u64,
    shrink_calls: u32,
}

#[cfg(test)]
impl TestMmState {
    fn new(total_pages: u64, highmem_boundary: u64, reserved_pages: u64, shrink_step: u64) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            total_pages,
            highmem_boundary,
            reserved_pages,
            free: BTreeSet::new(),
            shrink_step,
            shrink_calls: 0,
        }))
    }

    fn memory_map(&self) -> [layout::PageFrameRange; 1] {
        [layout::PageFrameRange::new(
            layout::PageFrameIndex::from(0),
            layout::PageFrameIndex::from(self.total_pages),
        )]
    }
}

#[cfg(test)]
struct TestOracle {
    state: Rc<RefCell<TestMmState>>,
}

#[cfg(test)]
impl PageOracle for TestOracle {
    fn is_reserved_or_unsaveable(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) < self.state.borrow().reserved_pages
    }

    fn is_free(&self, pfn: layout::PageFrameIndex) -> bool {
        self.state.borrow().free.contains(&u64::from(pfn))
    }

    fn is_highmem(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) >= self.state.borrow().highmem_boundary
    }
}

#[cfg(test)]
struct TestMm {
    state: Rc<RefCell<TestMmState>>,
}

#[cfg(test)]
impl MemoryCollaborator for TestMm {
    fn free_lowmem_pages(&self) -> u64 {
        let state = self.state.borrow();
        state.free.iter().filter(|&&pfn| pfn < state.highmem_boundary).count() as u64
    }

    fn free_highmem_pages(&self) -> u64 {
        let state = self.state.borrow();
        state.free.iter().filter(|&&pfn| pfn >= state.highmem_boundary).count() as u64
    }

    fn shrink_memory(&mut self, target_pages: u64) -> u64 {
        let mut state = self.state.borrow_mut();
        state.shrink_calls += 1;
        let quota = target_pages.min(state.shrink_step);
        let mut freed = 0;
        let mut pfn = state.total_pages;
        while freed < quota && pfn > state.reserved_pages {
            pfn -= 1;
            if state.free.insert(pfn) {
                freed += 1;
            }
        }
        freed
    }

    fn drop_page_cache(&mut self) {}
}

#[cfg(test)]
#[derive(Default)]
struct TestFreezer {
    frozen: bool,
    fail_freeze: bool,
    thaw_calls: u32,
}

#[cfg(test)]
impl Freezer for TestFreezer {
    fn freeze_processes(&mut self) -> Result<(), PrepError> {
        if self.fail_freeze {
            return Err(PrepError::FreezeFailure);
        }
        self.frozen = true;
        Ok(())
    }

    fn thaw_processes(&mut self) {
        self.frozen = false;
        self.thaw_calls += 1;
    }
}

#[cfg(test)]
fn test_config(
    max_tries: u32,
    min_free_lowmem_pages: u64,
    image_size_limit: ImageSizeLimit,
) -> PrepConfig {
    PrepConfig::new(max_tries, min_free_lowmem_pages, 0, 100, image_size_limit, true).unwrap()
}

#[test]
fn converges_first_try() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 4, 0);
    for pfn in 90..100 {
        state.borrow_mut().free.insert(pfn);
    }
    let memory_map = state.borrow().memory_map();
    let config = test_config(3, 0, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(200, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let prepared = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps)
    .unwrap();

    assert_eq!(prepared.tries_used, 1);
    assert_eq!(prepared.pageset1.pages, 0);
    assert_eq!(prepared.pageset2.pages, 86);
    assert_eq!(prepared.header_chain.total_blocks(), 1);
    assert!(prepared.pageset1_chain.is_empty());
    assert_eq!(prepared.pageset2_chain.total_blocks(), 86);
    assert_eq!(prepared.storage_blocks_allocated, 87);
    // Userspace stays frozen on success, the reservations stay live.
    assert!(freezer.frozen);
    assert_eq!(freezer.thaw_calls, 0);
    assert_eq!(store.available_blocks(), 200 - 87);
    assert!(maps.pageset2.is_allocated());
}

#[test]
fn reclaims_memory_until_constraints_met() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 15);
    let memory_map = state.borrow().memory_map();
    let config = test_config(5, 20, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let prepared = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps)
    .unwrap();

    assert_eq!(prepared.tries_used, 3);
    assert_eq!(prepared.pageset2.pages, 80);
    assert_eq!(state.borrow().shrink_calls, 2);
}

#[test]
fn size_limit_forces_shrinking() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 60);
    let memory_map = state.borrow().memory_map();
    let config = test_config(5, 0, ImageSizeLimit::MaxBlocks(60));
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let prepared = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps)
    .unwrap();

    assert_eq!(prepared.tries_used, 2);
    assert!(prepared.storage_blocks_allocated <= 60);
}

#[test]
fn no_eating_fails_without_reclaiming() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 15);
    let memory_map = state.borrow().memory_map();
    let config = test_config(5, 20, ImageSizeLimit::NoEating);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let result = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps);

    assert_eq!(
        result.err(),
        Some(PrepError::ImageInfeasible(InfeasibleReason::WouldNeedToEatMemory))
    );
    // No reclaim attempt may precede the verdict, and the attempt must be
    // fully unwound.
    assert_eq!(state.borrow().shrink_calls, 0);
    assert!(!freezer.frozen);
    assert_eq!(freezer.thaw_calls, 1);
    assert_eq!(store.available_blocks(), 300);
    assert!(!maps.pageset1.is_allocated());
}

#[test]
fn insufficient_storage() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 0);
    let memory_map = state.borrow().memory_map();
    let config = test_config(5, 0, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(50, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let result = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps);

    assert_eq!(
        result.err(),
        Some(PrepError::ImageInfeasible(InfeasibleReason::InsufficientStorage))
    );
    assert_eq!(store.available_blocks(), 50);
    assert_eq!(freezer.thaw_calls, 1);
}

#[test]
fn tries_exhausted() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 1);
    let memory_map = state.borrow().memory_map();
    let config = test_config(3, 50, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let result = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps);

    assert_eq!(
        result.err(),
        Some(PrepError::ImageInfeasible(InfeasibleReason::TriesExhausted))
    );
    assert_eq!(state.borrow().shrink_calls, 3);
}

#[test]
fn freeze_failure_unwinds() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 0);
    let memory_map = state.borrow().memory_map();
    let config = test_config(3, 0, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer {
        fail_freeze: true,
        ..TestFreezer::default()
    };
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let result = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps);

    assert_eq!(result.err(), Some(PrepError::FreezeFailure));
    assert_eq!(freezer.thaw_calls, 1);
}

#[test]
fn abort_unwinds() {
    use crate::store::test::TestStore;

    let state = TestMmState::new(100, 100, 0, 0);
    let memory_map = state.borrow().memory_map();
    let config = test_config(3, 0, ImageSizeLimit::Unlimited);
    let oracle = TestOracle { state: state.clone() };
    let mut mm = TestMm { state: state.clone() };
    let mut freezer = TestFreezer::default();
    let mut store = TestStore::new(300, 0);
    let abort = AbortFlag::new();
    abort.set();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();

    let result = Negotiator::new(
        &config, &memory_map, &oracle, None, 0, &mut mm, &mut freezer, &mut store, &abort,
    )
    .negotiate(&mut maps);

    assert_eq!(result.err(), Some(PrepError::Aborted));
    assert!(!freezer.frozen);
    assert_eq!(freezer.thaw_calls, 1);
    assert!(!maps.pageset1.is_allocated());
}
