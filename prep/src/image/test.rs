// SPDX-License-Identifier: Apache-2.0

//! Whole-cycle tests: negotiate an image, persist its metadata, then
//! reconstruct everything from the header alone as the resume side would.

extern crate alloc;
use alloc::{vec, vec::Vec};

use super::{
    cursor::ExtentStreamCursor,
    header::{ImageHeader, ModuleConfigBlock},
    layout,
    mm::{AbortFlag, Freezer, MemoryCollaborator, PageOracle},
    negotiate::Negotiator,
    pfn_bitmap::{PageMaps, PfnBitmap},
};
use crate::store::test::TestStore;

/// Fixed memory picture: 200 pages, the first 8 reserved, the last 20 free,
/// no highmem.
struct FixedOracle;

impl PageOracle for FixedOracle {
    fn is_reserved_or_unsaveable(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) < 8
    }

    fn is_free(&self, pfn: layout::PageFrameIndex) -> bool {
        u64::from(pfn) >= 180
    }

    fn is_highmem(&self, _pfn: layout::PageFrameIndex) -> bool {
        false
    }
}

struct FixedMm;

impl MemoryCollaborator for FixedMm {
    fn free_lowmem_pages(&self) -> u64 {
        20
    }

    fn free_highmem_pages(&self) -> u64 {
        0
    }

    fn shrink_memory(&mut self, _target_pages: u64) -> u64 {
        0
    }

    fn drop_page_cache(&mut self) {}
}

struct NopFreezer;

impl Freezer for NopFreezer {
    fn freeze_processes(&mut self) -> Result<(), super::PrepError> {
        Ok(())
    }

    fn thaw_processes(&mut self) {}
}

fn memory_map() -> [layout::PageFrameRange; 1] {
    [layout::PageFrameRange::new(
        layout::PageFrameIndex::from(0),
        layout::PageFrameIndex::from(200),
    )]
}

#[test]
fn full_cycle_write_reboot_resume() {
    let memory_map = memory_map();
    let config =
        layout::PrepConfig::new(3, 0, 0, 100, layout::ImageSizeLimit::Unlimited, true).unwrap();
    let oracle = FixedOracle;
    let mut mm = FixedMm;
    let mut freezer = NopFreezer;
    let mut store = TestStore::new(400, 0);
    let abort = AbortFlag::new();

    let mut attention = PfnBitmap::allocate(&memory_map, true).unwrap();
    attention.set(layout::PageFrameIndex::from(50)).unwrap();
    attention.set(layout::PageFrameIndex::from(51)).unwrap();

    let module_config = ModuleConfigBlock {
        id: 3,
        data: vec![10, 20, 30, 40, 50],
    };
    let module_config_bytes = 8 + module_config.data.len() as u64;

    let mut maps = PageMaps::allocate(&memory_map).unwrap();
    let prepared = Negotiator::new(
        &config,
        &memory_map,
        &oracle,
        Some(&attention),
        module_config_bytes,
        &mut mm,
        &mut freezer,
        &mut store,
        &abort,
    )
    .negotiate(&mut maps)
    .unwrap();

    // 200 pages minus 8 reserved and 20 free; the two attention pages form
    // pageset 1.
    assert_eq!(prepared.pageset1.pages, 2);
    assert_eq!(prepared.pageset2.pages, 170);
    assert_eq!(
        prepared.storage_blocks_allocated,
        prepared.header_chain.total_blocks() + 172
    );

    // Write half the image, then persist the header with the mid-walk
    // position, as if hibernation stopped to sync its metadata.
    let data_chains = [&prepared.pageset1_chain, &prepared.pageset2_chain];
    let mut write_cursor = ExtentStreamCursor::new(&data_chains);
    for _ in 0..100 {
        write_cursor.advance().unwrap();
    }
    let header = ImageHeader {
        config: config.clone(),
        pageset1: prepared.pageset1,
        pageset2: prepared.pageset2,
        cursor_pos: write_cursor.save(),
        module_configs: vec![module_config],
    };
    header
        .write_to(
            &mut store,
            &maps.pageset1,
            &prepared.header_chain,
            &prepared.pageset1_chain,
            &prepared.pageset2_chain,
        )
        .unwrap();
    assert!(header.bytes_needed(&maps.pageset1, 16) >= store.header_len() as u64);

    let remaining_writer: Vec<u64> = core::iter::from_fn(|| write_cursor.advance().map(u64::from)).collect();
    assert_eq!(remaining_writer.len(), 72);

    // "Reboot": all volatile state is gone, only the store's content
    // survives.
    let mut store = store.snapshot();
    drop(prepared);
    maps.free_all();

    let restored = ImageHeader::read_from(&mut store, &memory_map).unwrap();
    assert_eq!(restored.header.config, config);
    assert_eq!(restored.header.pageset1.pages, 2);
    assert_eq!(restored.header.pageset2.pages, 170);
    assert_eq!(restored.header.module_configs.len(), 1);
    assert_eq!(restored.header.module_configs[0].id, 3);
    assert_eq!(restored.header.module_configs[0].data, [10, 20, 30, 40, 50]);

    // The pageset 1 bitmap round-trips exactly.
    for pfn in 0..200u64 {
        assert_eq!(
            restored.pageset1_map.test(layout::PageFrameIndex::from(pfn)),
            pfn == 50 || pfn == 51,
        );
    }

    // Restoring the saved position against the rebuilt chains resumes the
    // walk with the exact block sequence the writer saw.
    let data_chains = [&restored.pageset1_chain, &restored.pageset2_chain];
    let mut read_cursor = ExtentStreamCursor::new(&data_chains);
    read_cursor.restore(&restored.header.cursor_pos).unwrap();
    let remaining_reader: Vec<u64> = core::iter::from_fn(|| read_cursor.advance().map(u64::from)).collect();
    assert_eq!(remaining_reader, remaining_writer);
}

#[test]
fn cycle_lock_serializes_cycles() {
    let lock = super::CycleLock::new();
    let guard = lock.try_begin().unwrap();
    assert!(lock.try_begin().is_none());
    drop(guard);

    // A fresh cycle can reuse the engine's structures from scratch.
    let _guard = lock.try_begin().unwrap();
    let memory_map = memory_map();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();
    maps.free_all();
    let mut maps = PageMaps::allocate(&memory_map).unwrap();
    assert!(maps.pageset1.is_allocated());
    maps.free_all();
}
