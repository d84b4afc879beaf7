// SPDX-License-Identifier: Apache-2.0

//! Image header serialization.
//!
//! The header is a byte stream layered on the backing store's header chunk
//! interface. Its layout, in stream order:
//!
//! 1. Magic and format version.
//! 2. The [`PrepConfig`] the image was prepared with.
//! 3. The pageset 1 and pageset 2 size tallies.
//! 4. The saved extent stream cursor position.
//! 5. Per-module configuration blocks, terminated by a zero-id sentinel.
//! 6. The pageset 1 bitmap, as runs of set bits.
//! 7. The header, pageset 1 and pageset 2 extent chains.

extern crate alloc;
use alloc::vec::Vec;

use crate::image::{
    ImageFormatError, PrepError,
    cursor::SavedCursorPos,
    extents::ExtentChain,
    layout::{self, PrepConfig},
    pageset::Pageset,
    pfn_bitmap::PfnBitmap,
};
use crate::store::HibernateStore;
use core::mem;

/// Magic identifying an image header.
pub const HEADER_MAGIC: [u8; 8] = *b"SNAPIMG\0";

/// Current header format version.
pub const HEADER_FORMAT_VERSION: u8 = 1;

/// Upper bound on a single module configuration block's payload.
const MODULE_CONFIG_MAX_LEN: u32 = 1u32 << 24;

/// Opaque per-module configuration carried through the image.
///
/// Modules outside the preparation core, compressors or encryption layers
/// for instance, get their settings stored alongside the image so the resume
/// side can reinstate them before touching any image data. The payload is
/// entirely the owning module's business.
pub struct ModuleConfigBlock {
    /// Module identifier, nonzero.
    pub id: u32,
    pub data: Vec<u8>,
}

/// The image header's non-structural payload.
///
/// The extent chains and the pageset 1 bitmap travel with the header on
/// storage, but are kept out of this struct; they get large and their
/// lifecycle is the negotiation's business, not the header's.
pub struct ImageHeader {
    pub config: PrepConfig,
    pub pageset1: Pageset,
    pub pageset2: Pageset,
    pub cursor_pos: SavedCursorPos,
    pub module_configs: Vec<ModuleConfigBlock>,
}

/// Everything [`ImageHeader::read_from()`] reconstructs from storage.
pub struct RestoredImage {
    pub header: ImageHeader,
    pub pageset1_map: PfnBitmap,
    pub header_chain: ExtentChain,
    pub pageset1_chain: ExtentChain,
    pub pageset2_chain: ExtentChain,
}

impl ImageHeader {
    const fn fixed_len() -> usize {
        HEADER_MAGIC.len()
            + mem::size_of::<u8>()
            + PrepConfig::encoded_len()
            + 2 * Pageset::encoded_len()
            + SavedCursorPos::encoded_len()
    }

    /// Upper bound on the header's size on storage, in bytes.
    ///
    /// Used for sizing the header extent chain before the header actually
    /// gets written. The chains themselves are part of the header, so their
    /// final extent counts aren't known yet at that point; `chain_extents`
    /// supplies the caller's estimate, padded with whatever slack it deems
    /// appropriate.
    ///
    /// # Arguments:
    ///
    /// * `pageset1_map` - The pageset 1 bitmap as of the current
    ///   classification pass.
    /// * `chain_extents` - Estimated total extent count across all three
    ///   chains.
    pub fn bytes_needed(&self, pageset1_map: &PfnBitmap, chain_extents: u64) -> u64 {
        let module_config_bytes: u64 = self
            .module_configs
            .iter()
            .map(|block| 2 * mem::size_of::<u32>() as u64 + block.data.len() as u64)
            .sum();
        estimated_bytes(module_config_bytes, pageset1_map, chain_extents)
    }

    /// Stream the complete header out to the backing store.
    pub fn write_to(
        &self,
        store: &mut dyn HibernateStore,
        pageset1_map: &PfnBitmap,
        header_chain: &ExtentChain,
        pageset1_chain: &ExtentChain,
        pageset2_chain: &ExtentChain,
    ) -> Result<(), PrepError> {
        store.write_header_chunk(&HEADER_MAGIC)?;
        store.write_header_chunk(&[HEADER_FORMAT_VERSION])?;
        store.write_header_chunk(&self.config.encode())?;
        store.write_header_chunk(&self.pageset1.encode())?;
        store.write_header_chunk(&self.pageset2.encode())?;
        store.write_header_chunk(&self.cursor_pos.encode())?;

        for block in self.module_configs.iter() {
            if block.id == 0 || block.data.len() > MODULE_CONFIG_MAX_LEN as usize {
                return Err(PrepError::from(ImageFormatError::InvalidModuleConfigBlock));
            }
            store.write_header_chunk(&block.id.to_le_bytes())?;
            store.write_header_chunk(&(block.data.len() as u32).to_le_bytes())?;
            store.write_header_chunk(&block.data)?;
        }
        store.write_header_chunk(&0u32.to_le_bytes())?;
        store.write_header_chunk(&0u32.to_le_bytes())?;

        write_bitmap_runs(store, pageset1_map)?;

        header_chain.write_to(store)?;
        pageset1_chain.write_to(store)?;
        pageset2_chain.write_to(store)?;
        Ok(())
    }

    /// Read a complete header back from the backing store.
    ///
    /// # Arguments:
    ///
    /// * `store` - The backing store; the header stream gets rewound first.
    /// * `memory_map` - The system memory map, for reallocating the pageset
    ///   1 bitmap. Must match the map the image was prepared under.
    pub fn read_from(
        store: &mut dyn HibernateStore,
        memory_map: &[layout::PageFrameRange],
    ) -> Result<RestoredImage, PrepError> {
        store.rewind_header();

        let mut magic = [0u8; HEADER_MAGIC.len()];
        store.read_header_chunk(&mut magic)?;
        if magic != HEADER_MAGIC {
            return Err(PrepError::from(ImageFormatError::InvalidHeaderMagic));
        }
        let mut version = [0u8; 1];
        store.read_header_chunk(&mut version)?;
        if version[0] != HEADER_FORMAT_VERSION {
            return Err(PrepError::from(ImageFormatError::UnsupportedFormatVersion));
        }

        let mut config = [0u8; PrepConfig::encoded_len()];
        store.read_header_chunk(&mut config)?;
        let config = PrepConfig::decode(&config)?;
        let mut pageset = [0u8; Pageset::encoded_len()];
        store.read_header_chunk(&mut pageset)?;
        let pageset1 = Pageset::decode(&pageset);
        store.read_header_chunk(&mut pageset)?;
        let pageset2 = Pageset::decode(&pageset);
        let mut cursor_pos = [0u8; SavedCursorPos::encoded_len()];
        store.read_header_chunk(&mut cursor_pos)?;
        let cursor_pos = SavedCursorPos::decode(&cursor_pos)?;

        let mut module_configs = Vec::new();
        loop {
            let mut word = [0u8; mem::size_of::<u32>()];
            store.read_header_chunk(&mut word)?;
            let id = u32::from_le_bytes(word);
            store.read_header_chunk(&mut word)?;
            let len = u32::from_le_bytes(word);
            if id == 0 {
                if len != 0 {
                    return Err(PrepError::from(ImageFormatError::InvalidModuleConfigBlock));
                }
                break;
            }
            if len > MODULE_CONFIG_MAX_LEN {
                return Err(PrepError::from(ImageFormatError::InvalidModuleConfigBlock));
            }
            let mut data = Vec::new();
            data.try_reserve_exact(len as usize)?;
            data.resize(len as usize, 0u8);
            store.read_header_chunk(&mut data)?;
            module_configs.try_reserve(1)?;
            module_configs.push(ModuleConfigBlock { id, data });
        }

        let pageset1_map = read_bitmap_runs(store, memory_map)?;

        let header_chain = ExtentChain::read_from(store)?;
        let pageset1_chain = ExtentChain::read_from(store)?;
        let pageset2_chain = ExtentChain::read_from(store)?;

        Ok(RestoredImage {
            header: ImageHeader {
                config,
                pageset1,
                pageset2,
                cursor_pos,
                module_configs,
            },
            pageset1_map,
            header_chain,
            pageset1_chain,
            pageset2_chain,
        })
    }
}

/// Upper bound on a header's size on storage, in bytes.
///
/// See [`ImageHeader::bytes_needed()`]; this variant serves callers that
/// only know the module configuration blocks' total encoded size yet.
pub fn estimated_bytes(module_config_bytes: u64, pageset1_map: &PfnBitmap, chain_extents: u64) -> u64 {
    let sentinel = 2 * mem::size_of::<u32>() as u64;
    let bitmap = mem::size_of::<u64>() as u64 + 16 * pageset1_map.run_count();
    let chains = 3 * 16 + 16 * chain_extents;
    ImageHeader::fixed_len() as u64 + module_config_bytes + sentinel + bitmap + chains
}

/// Stream a bitmap out as its runs of set bits.
///
/// The record is the run count followed by one inclusive `(first, last)`
/// page frame pair per run.
fn write_bitmap_runs(store: &mut dyn HibernateStore, bitmap: &PfnBitmap) -> Result<(), PrepError> {
    store.write_header_chunk(&bitmap.run_count().to_le_bytes())?;
    let mut pos = layout::PageFrameIndex::from(0);
    while let Some((first, last)) = bitmap.next_run(pos) {
        let mut record = [0u8; 2 * mem::size_of::<u64>()];
        record[..mem::size_of::<u64>()].copy_from_slice(&u64::from(first).to_le_bytes());
        record[mem::size_of::<u64>()..].copy_from_slice(&u64::from(last).to_le_bytes());
        store.write_header_chunk(&record)?;
        pos = match u64::from(last).checked_add(1) {
            Some(next) => layout::PageFrameIndex::from(next),
            None => break,
        };
    }
    Ok(())
}

/// Read a bitmap record back into a freshly allocated sparse bitmap.
fn read_bitmap_runs(
    store: &mut dyn HibernateStore,
    memory_map: &[layout::PageFrameRange],
) -> Result<PfnBitmap, PrepError> {
    let mut bitmap = PfnBitmap::allocate(memory_map, true)?;

    let mut count = [0u8; mem::size_of::<u64>()];
    store.read_header_chunk(&mut count)?;
    let count = u64::from_le_bytes(count);

    let mut prev_last: Option<u64> = None;
    for _ in 0..count {
        let mut record = [0u8; 2 * mem::size_of::<u64>()];
        store.read_header_chunk(&mut record)?;
        let first = u64::from_le_bytes([
            record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
        ]);
        let last = u64::from_le_bytes([
            record[8], record[9], record[10], record[11], record[12], record[13], record[14],
            record[15],
        ]);
        // Runs must be ascending with at least one clear bit in between, and
        // must fall within a single memory map range.
        if first > last || prev_last.map(|p| p.checked_add(1).map(|p| p >= first).unwrap_or(true)).unwrap_or(false) {
            return Err(PrepError::from(ImageFormatError::InvalidBitmapRecord));
        }
        let range_index = memory_map.partition_point(|range| {
            u64::from(range.end()) <= first
        });
        let within_map = memory_map
            .get(range_index)
            .map(|range| range.contains_pfn(layout::PageFrameIndex::from(first)) && last < u64::from(range.end()))
            .unwrap_or(false);
        if !within_map {
            return Err(PrepError::from(ImageFormatError::InvalidBitmapRecord));
        }

        for pfn in first..=last {
            bitmap.set(layout::PageFrameIndex::from(pfn))?;
        }
        prev_last = Some(last);
    }
    Ok(bitmap)
}

#[cfg(test)]
fn test_memory_map() -> [layout::PageFrameRange; 1] {
    [layout::PageFrameRange::new(
        layout::PageFrameIndex::from(0),
        layout::PageFrameIndex::from(4096),
    )]
}

#[cfg(test)]
fn test_header() -> ImageHeader {
    use alloc::vec;

    ImageHeader {
        config: PrepConfig::new(6, 128, 500, 67, layout::ImageSizeLimit::Unlimited, true).unwrap(),
        pageset1: Pageset {
            pages: 1000,
            highmem_pages: 0,
        },
        pageset2: Pageset {
            pages: 2000,
            highmem_pages: 300,
        },
        cursor_pos: SavedCursorPos::start(),
        module_configs: vec![
            ModuleConfigBlock {
                id: 7,
                data: vec![1, 2, 3, 4, 5],
            },
            ModuleConfigBlock {
                id: 9,
                data: vec![0xaa; 100],
            },
        ],
    }
}

#[test]
fn write_read_roundtrip() {
    use crate::store::test::TestStore;

    let memory_map = test_memory_map();
    let header = test_header();

    let mut pageset1_map = PfnBitmap::allocate(&memory_map, false).unwrap();
    for pfn in (0..1000u64).filter(|pfn| pfn % 3 != 0) {
        pageset1_map.set(layout::PageFrameIndex::from(pfn)).unwrap();
    }
    let mut header_chain = ExtentChain::new();
    header_chain.insert(layout::DeviceBlockRange::from((0, 1))).unwrap();
    let mut pageset1_chain = ExtentChain::new();
    pageset1_chain.insert(layout::DeviceBlockRange::from((2, 600))).unwrap();
    let mut pageset2_chain = ExtentChain::new();
    pageset2_chain.insert(layout::DeviceBlockRange::from((601, 1500))).unwrap();
    pageset2_chain.insert(layout::DeviceBlockRange::from((2000, 3000))).unwrap();

    let mut store = TestStore::new(4096, 0);
    header
        .write_to(&mut store, &pageset1_map, &header_chain, &pageset1_chain, &pageset2_chain)
        .unwrap();
    assert!(
        header.bytes_needed(
            &pageset1_map,
            (header_chain.len() + pageset1_chain.len() + pageset2_chain.len()) as u64
        ) >= store.header_len() as u64
    );

    let mut store = store.snapshot();
    let restored = ImageHeader::read_from(&mut store, &memory_map).unwrap();
    assert_eq!(restored.header.config, header.config);
    assert_eq!(restored.header.pageset1, header.pageset1);
    assert_eq!(restored.header.pageset2, header.pageset2);
    assert_eq!(restored.header.cursor_pos, header.cursor_pos);
    assert_eq!(restored.header.module_configs.len(), 2);
    assert_eq!(restored.header.module_configs[0].id, 7);
    assert_eq!(restored.header.module_configs[0].data, [1, 2, 3, 4, 5]);
    assert_eq!(restored.header.module_configs[1].id, 9);

    for pfn in 0..1100u64 {
        assert_eq!(
            restored.pageset1_map.test(layout::PageFrameIndex::from(pfn)),
            pageset1_map.test(layout::PageFrameIndex::from(pfn)),
        );
    }
    assert_eq!(restored.header_chain.total_blocks(), header_chain.total_blocks());
    assert_eq!(restored.pageset1_chain.total_blocks(), pageset1_chain.total_blocks());
    assert_eq!(restored.pageset2_chain.total_blocks(), pageset2_chain.total_blocks());
    assert_eq!(restored.pageset2_chain.len(), 2);
}

#[test]
fn read_rejects_bad_magic_and_version() {
    use crate::store::test::TestStore;

    let memory_map = test_memory_map();

    let mut store = TestStore::new(16, 0);
    store.write_header_chunk(b"NOTMAGIC").unwrap();
    store.write_header_chunk(&[HEADER_FORMAT_VERSION]).unwrap();
    assert_eq!(
        ImageHeader::read_from(&mut store, &memory_map).err(),
        Some(PrepError::from(ImageFormatError::InvalidHeaderMagic))
    );

    let mut store = TestStore::new(16, 0);
    store.write_header_chunk(&HEADER_MAGIC).unwrap();
    store.write_header_chunk(&[99]).unwrap();
    assert_eq!(
        ImageHeader::read_from(&mut store, &memory_map).err(),
        Some(PrepError::from(ImageFormatError::UnsupportedFormatVersion))
    );
}

#[test]
fn read_rejects_bad_bitmap_record() {
    use crate::store::test::TestStore;

    let memory_map = test_memory_map();
    let header = test_header();
    let pageset1_map = PfnBitmap::allocate(&memory_map, false).unwrap();
    let empty = ExtentChain::new();

    let mut store = TestStore::new(16, 0);
    header
        .write_to(&mut store, &pageset1_map, &empty, &empty, &empty)
        .unwrap();

    // Corrupt the bitmap run count, the first u64 after the module config
    // sentinel, to claim one run where none follows.
    let bitmap_record_offset = ImageHeader::fixed_len()
        + header
            .module_configs
            .iter()
            .map(|block| 2 * mem::size_of::<u32>() + block.data.len())
            .sum::<usize>()
        + 2 * mem::size_of::<u32>();
    let mut store = store.snapshot_with_corruption(bitmap_record_offset, &1u64.to_le_bytes());
    assert!(ImageHeader::read_from(&mut store, &memory_map).is_err());
}
