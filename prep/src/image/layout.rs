// SPDX-License-Identifier: Apache-2.0

//! Implementation of [`PageFrameIndex`] and [`PageFrameRange`],
//! [`DeviceBlockIndex`] and [`DeviceBlockRange`], and [`PrepConfig`].

use crate::image::{ImageFormatError, PrepError};
use crate::prep_err_internal;
use crate::utils_common::bitmanip::BitManip as _;
use core::{convert, mem, ops};

/// Base-2 logarithm of the page size, which is also the image block size.
///
/// One saveable page maps to exactly one image block on the backing store;
/// all storage accounting in the engine is in these units.
pub const PAGE_BYTES_LOG2: u32 = 12;

/// The page size in bytes.
pub const PAGE_BYTES: usize = 1usize << PAGE_BYTES_LOG2;

/// Page frame count.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PageFrameCount {
    count: u64,
}

impl convert::From<u64> for PageFrameCount {
    fn from(value: u64) -> Self {
        Self { count: value }
    }
}

impl convert::From<PageFrameCount> for u64 {
    fn from(value: PageFrameCount) -> Self {
        value.count
    }
}

impl ops::Add<PageFrameCount> for PageFrameCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            count: self.count.checked_add(rhs.count).unwrap(),
        }
    }
}

impl ops::Sub<PageFrameCount> for PageFrameCount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            count: self.count.checked_sub(rhs.count).unwrap(),
        }
    }
}

/// Page frame number, i.e. a physical page's index in the system's memory
/// map.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PageFrameIndex {
    index: u64,
}

impl convert::From<u64> for PageFrameIndex {
    fn from(value: u64) -> Self {
        Self { index: value }
    }
}

impl convert::From<PageFrameIndex> for u64 {
    fn from(value: PageFrameIndex) -> Self {
        value.index
    }
}

impl ops::Add<PageFrameCount> for PageFrameIndex {
    type Output = Self;

    fn add(self, rhs: PageFrameCount) -> Self::Output {
        Self {
            index: self.index.checked_add(u64::from(rhs)).unwrap(),
        }
    }
}

impl ops::AddAssign<PageFrameCount> for PageFrameIndex {
    fn add_assign(&mut self, rhs: PageFrameCount) {
        self.index = self.index.checked_add(u64::from(rhs)).unwrap();
    }
}

impl ops::Sub<Self> for PageFrameIndex {
    type Output = PageFrameCount;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::Output {
            count: self.index.checked_sub(rhs.index).unwrap(),
        }
    }
}

/// Range of page frames, begin inclusive, end exclusive.
///
/// The system memory map is described as an ascending sequence of such
/// ranges, one per contiguous stretch of physical memory; holes between
/// NUMA nodes or hot-pluggable zones simply don't appear in the sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageFrameRange {
    b: PageFrameIndex,
    e: PageFrameIndex,
}

impl PageFrameRange {
    pub fn new(b: PageFrameIndex, e: PageFrameIndex) -> Self {
        debug_assert!(b < e);
        Self { b, e }
    }

    pub fn begin(&self) -> PageFrameIndex {
        self.b
    }

    pub fn end(&self) -> PageFrameIndex {
        self.e
    }

    pub fn page_count(&self) -> PageFrameCount {
        self.e - self.b
    }

    pub fn contains_pfn(&self, pfn: PageFrameIndex) -> bool {
        self.b <= pfn && pfn < self.e
    }

    pub fn overlaps_with(&self, other: &Self) -> bool {
        self.e > other.b && self.b < other.e
    }
}

/// Image block count on the backing store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DeviceBlockCount {
    count: u64,
}

impl convert::From<u64> for DeviceBlockCount {
    fn from(value: u64) -> Self {
        Self { count: value }
    }
}

impl convert::From<DeviceBlockCount> for u64 {
    fn from(value: DeviceBlockCount) -> Self {
        value.count
    }
}

/// Image block index on the backing store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DeviceBlockIndex {
    index: u64,
}

impl convert::From<u64> for DeviceBlockIndex {
    fn from(value: u64) -> Self {
        Self { index: value }
    }
}

impl convert::From<DeviceBlockIndex> for u64 {
    fn from(value: DeviceBlockIndex) -> Self {
        value.index
    }
}

/// Range of image blocks, both ends inclusive.
///
/// Extent chains speak inclusive ranges, matching the two-machine-word
/// `(start, end)` on-disk extent record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceBlockRange {
    first: DeviceBlockIndex,
    last: DeviceBlockIndex,
}

impl DeviceBlockRange {
    pub fn new(first: DeviceBlockIndex, last: DeviceBlockIndex) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    pub fn first(&self) -> DeviceBlockIndex {
        self.first
    }

    pub fn last(&self) -> DeviceBlockIndex {
        self.last
    }

    pub fn block_count(&self) -> DeviceBlockCount {
        DeviceBlockCount::from(u64::from(self.last) - u64::from(self.first) + 1)
    }
}

impl convert::From<(u64, u64)> for DeviceBlockRange {
    fn from(value: (u64, u64)) -> Self {
        Self::new(DeviceBlockIndex::from(value.0), DeviceBlockIndex::from(value.1))
    }
}

/// Soft image size constraint applied during size negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageSizeLimit {
    /// No constraint beyond the backing store's capacity.
    Unlimited,
    /// Don't free ("eat") any memory to make the image fit; if it doesn't
    /// fit as-is, the attempt is infeasible.
    NoEating,
    /// Cap the image at the given number of blocks.
    MaxBlocks(u64),
}

impl ImageSizeLimit {
    /// Encode as a signed machine word for the image header.
    ///
    /// `-1` is the historical "no eating" value, `0` means unlimited,
    /// positive values carry the cap.
    fn encode(&self) -> i64 {
        match self {
            Self::Unlimited => 0,
            Self::NoEating => -1,
            Self::MaxBlocks(n) => *n as i64,
        }
    }

    fn decode(value: i64) -> Result<Self, PrepError> {
        match value {
            0 => Ok(Self::Unlimited),
            -1 => Ok(Self::NoEating),
            n if n > 0 => Ok(Self::MaxBlocks(n as u64)),
            _ => Err(PrepError::from(ImageFormatError::InvalidPrepConfig)),
        }
    }
}

/// Core image preparation configuration parameters.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PrepConfig {
    /// Maximum number of size negotiation iterations before the attempt is
    /// declared infeasible.
    pub max_tries: u32,

    /// Minimum number of low-memory pages that must remain free after the
    /// atomic copy's destination pages have been reserved.
    pub min_free_lowmem_pages: u64,

    /// Additional low-memory pages kept free for device drivers to consume
    /// while quiescing.
    ///
    /// Measured once per boot by a calibration pass that suspends and
    /// resumes devices and diffs the free-page counts; the engine only
    /// consumes the resulting figure.
    pub extra_pages_allowance: u64,

    /// Expected compressed image size as a percentage of the raw size,
    /// `1..=100`.
    ///
    /// Purely a storage pre-allocation heuristic. Under-allocation surfaces
    /// as another negotiation round or infeasibility; over-allocation as an
    /// expected early end-of-data when walking the extents.
    pub expected_compression_percent: u8,

    /// Soft image size constraint.
    pub image_size_limit: ImageSizeLimit,

    /// Whether ordinary pages default to pageset 2.
    ///
    /// When off, every saveable page goes into pageset 1 and is restored
    /// atomically.
    pub full_pageset2: bool,
}

impl PrepConfig {
    pub fn new(
        max_tries: u32,
        min_free_lowmem_pages: u64,
        extra_pages_allowance: u64,
        expected_compression_percent: u8,
        image_size_limit: ImageSizeLimit,
        full_pageset2: bool,
    ) -> Result<Self, PrepError> {
        if max_tries == 0 {
            return Err(PrepError::from(ImageFormatError::InvalidPrepConfig));
        }
        if expected_compression_percent == 0 || expected_compression_percent > 100 {
            return Err(PrepError::from(ImageFormatError::InvalidPrepConfig));
        }
        if let ImageSizeLimit::MaxBlocks(n) = image_size_limit {
            // The cap, converted to bytes, must still be representable.
            if n == 0 || n.significant_bits() > u64::BITS - PAGE_BYTES_LOG2 {
                return Err(PrepError::from(ImageFormatError::InvalidPrepConfig));
            }
        }

        Ok(Self {
            max_tries,
            min_free_lowmem_pages,
            extra_pages_allowance,
            expected_compression_percent,
            image_size_limit,
            full_pageset2,
        })
    }

    pub const fn encoded_len() -> usize {
        mem::size_of::<u32>()       // max_tries
            + mem::size_of::<u64>() // min_free_lowmem_pages
            + mem::size_of::<u64>() // extra_pages_allowance
            + mem::size_of::<u8>()  // expected_compression_percent
            + mem::size_of::<i64>() // image_size_limit
            + mem::size_of::<u8>() // full_pageset2
    }

    pub fn encode(&self) -> [u8; Self::encoded_len()] {
        let mut result = [0u8; Self::encoded_len()];
        let buf = &mut result[..];
        let (field, buf) = buf.split_at_mut(mem::size_of::<u32>());
        field.copy_from_slice(&self.max_tries.to_le_bytes());
        let (field, buf) = buf.split_at_mut(mem::size_of::<u64>());
        field.copy_from_slice(&self.min_free_lowmem_pages.to_le_bytes());
        let (field, buf) = buf.split_at_mut(mem::size_of::<u64>());
        field.copy_from_slice(&self.extra_pages_allowance.to_le_bytes());
        let (field, buf) = buf.split_at_mut(mem::size_of::<u8>());
        field[0] = self.expected_compression_percent;
        let (field, buf) = buf.split_at_mut(mem::size_of::<i64>());
        field.copy_from_slice(&self.image_size_limit.encode().to_le_bytes());
        buf[0] = self.full_pageset2 as u8;
        result
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PrepError> {
        if buf.len() != Self::encoded_len() {
            return Err(prep_err_internal!());
        }

        let (max_tries, buf) = buf.split_at(mem::size_of::<u32>());
        let max_tries = u32::from_le_bytes(
            *<&[u8; mem::size_of::<u32>()]>::try_from(max_tries).map_err(|_| prep_err_internal!())?,
        );
        let (min_free_lowmem_pages, buf) = buf.split_at(mem::size_of::<u64>());
        let min_free_lowmem_pages = u64::from_le_bytes(
            *<&[u8; mem::size_of::<u64>()]>::try_from(min_free_lowmem_pages).map_err(|_| prep_err_internal!())?,
        );
        let (extra_pages_allowance, buf) = buf.split_at(mem::size_of::<u64>());
        let extra_pages_allowance = u64::from_le_bytes(
            *<&[u8; mem::size_of::<u64>()]>::try_from(extra_pages_allowance).map_err(|_| prep_err_internal!())?,
        );
        let (expected_compression_percent, buf) = buf.split_at(mem::size_of::<u8>());
        let expected_compression_percent = expected_compression_percent[0];
        let (image_size_limit, buf) = buf.split_at(mem::size_of::<i64>());
        let image_size_limit = i64::from_le_bytes(
            *<&[u8; mem::size_of::<i64>()]>::try_from(image_size_limit).map_err(|_| prep_err_internal!())?,
        );
        let image_size_limit = ImageSizeLimit::decode(image_size_limit)?;
        let full_pageset2 = match buf[0] {
            0 => false,
            1 => true,
            _ => return Err(PrepError::from(ImageFormatError::InvalidPrepConfig)),
        };

        Self::new(
            max_tries,
            min_free_lowmem_pages,
            extra_pages_allowance,
            expected_compression_percent,
            image_size_limit,
            full_pageset2,
        )
    }
}

#[test]
fn prep_config_validation() {
    assert!(PrepConfig::new(0, 0, 0, 100, ImageSizeLimit::Unlimited, true).is_err());
    assert!(PrepConfig::new(5, 0, 0, 0, ImageSizeLimit::Unlimited, true).is_err());
    assert!(PrepConfig::new(5, 0, 0, 101, ImageSizeLimit::Unlimited, true).is_err());
    assert!(PrepConfig::new(5, 0, 0, 100, ImageSizeLimit::MaxBlocks(0), true).is_err());
    assert!(PrepConfig::new(5, 0, 0, 100, ImageSizeLimit::MaxBlocks(1 << 53), true).is_err());
    assert!(PrepConfig::new(5, 128, 500, 67, ImageSizeLimit::MaxBlocks(1 << 20), true).is_ok());
}

#[test]
fn prep_config_encode_decode() {
    let config = PrepConfig::new(7, 1024, 333, 50, ImageSizeLimit::MaxBlocks(99), false).unwrap();
    assert_eq!(PrepConfig::decode(&config.encode()).unwrap(), config);

    let config = PrepConfig::new(3, 0, 0, 100, ImageSizeLimit::NoEating, true).unwrap();
    assert_eq!(PrepConfig::decode(&config.encode()).unwrap(), config);

    let config = PrepConfig::new(1, 0, 0, 100, ImageSizeLimit::Unlimited, true).unwrap();
    assert_eq!(PrepConfig::decode(&config.encode()).unwrap(), config);
}
