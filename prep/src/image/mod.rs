// SPDX-License-Identifier: Apache-2.0

//! Hibernation image preparation: page-set partitioning, extent-based
//! storage allocation and the deterministic lockstep iteration over both.

extern crate alloc;

use crate::store::StoreIoError;
use crate::utils_common;
use core::{convert, sync::atomic};

pub mod cursor;
pub mod extents;
pub mod header;
pub mod layout;
pub mod mm;
pub mod negotiate;
pub mod pageset;
pub mod pfn_bitmap;

#[cfg(test)]
mod test;

/// Reason reported with [`PrepError::ImageInfeasible`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfeasibleReason {
    /// The backing store cannot grow to cover the image.
    InsufficientStorage,
    /// Converging would require freeing memory, but the configured image
    /// size limit forbids eating memory.
    WouldNeedToEatMemory,
    /// The negotiation retry budget was exhausted before the constraints
    /// settled.
    TriesExhausted,
}

/// Image format errors, reported via [`PrepError::HeaderFormatError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageFormatError {
    InvalidHeaderMagic = 1,
    UnsupportedFormatVersion = 2,
    InvalidPrepConfig = 3,
    InvalidChainRecord = 4,
    InvalidBitmapRecord = 5,
    InvalidCursorRecord = 6,
    InvalidModuleConfigBlock = 7,
}

/// Error type returned by the image preparation primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrepError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    ///
    /// Recoverable by aborting the current hibernation attempt only; the
    /// host itself is unaffected.
    MemoryAllocationFailure,

    /// The process-wide abort flag was found set.
    Aborted,

    /// The external freezer collaborator failed to quiesce all tasks.
    FreezeFailure,

    /// A requested extent allocation exceeded the backing store's available
    /// blocks.
    StorageExhausted,

    /// On-disk or in-memory structural metadata failed a consistency check.
    ///
    /// Indicates a logic bug; continuing would risk writing a corrupt,
    /// unrestorable image, so the attempt is aborted with a diagnostic dump
    /// instead.
    StructuralInconsistency,

    /// The size negotiation concluded the image cannot be made to fit.
    ImageInfeasible(InfeasibleReason),

    /// IO error reported by the storage backend.
    IoError(StoreIoError),

    /// Image header format error.
    HeaderFormatError(isize),
}

impl convert::From<convert::Infallible> for PrepError {
    fn from(value: convert::Infallible) -> Self {
        match value {}
    }
}

impl convert::From<alloc::collections::TryReserveError> for PrepError {
    fn from(_value: alloc::collections::TryReserveError) -> Self {
        Self::MemoryAllocationFailure
    }
}

impl convert::From<utils_common::alloc::TryNewError> for PrepError {
    fn from(value: utils_common::alloc::TryNewError) -> Self {
        match value {
            utils_common::alloc::TryNewError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
        }
    }
}

impl convert::From<StoreIoError> for PrepError {
    fn from(value: StoreIoError) -> Self {
        match value {
            StoreIoError::Internal => Self::Internal,
            StoreIoError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            StoreIoError::NoSpace => Self::StorageExhausted,
            StoreIoError::HeaderStreamOverrun => Self::IoError(StoreIoError::HeaderStreamOverrun),
            StoreIoError::IoFailure => Self::IoError(StoreIoError::IoFailure),
        }
    }
}

impl convert::From<ImageFormatError> for PrepError {
    fn from(value: ImageFormatError) -> Self {
        Self::HeaderFormatError(value as isize)
    }
}

/// Debugging friendly helper for instantiating [`PrepError::Internal`].
///
/// Panics if `cfg!(debug_assertions)` is on, to allow for debugger
/// examination at the point the logic error has happened. Otherwise a
/// [`PrepError::Internal`] is returned.
#[macro_export]
macro_rules! prep_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("PrepError::Internal");
        } else {
            $crate::image::PrepError::Internal
        }
    }};
}

/// Mutual exclusion for hibernate/resume cycles.
///
/// Only one hibernation or resume cycle may be in flight at any time. A
/// cycle [begins](Self::try_begin) by acquiring the lock and finishes when
/// the returned [`CycleGuard`] is dropped. The engine's data structures are
/// only ever touched with the guard held, which is what substitutes for any
/// finer-grained locking within the preparation core.
pub struct CycleLock {
    busy: atomic::AtomicBool,
}

impl CycleLock {
    pub const fn new() -> Self {
        Self {
            busy: atomic::AtomicBool::new(false),
        }
    }

    /// Attempt to begin a hibernate/resume cycle.
    ///
    /// Returns `None` if another cycle is already in flight.
    pub fn try_begin(&self) -> Option<CycleGuard<'_>> {
        self.busy
            .compare_exchange(
                false,
                true,
                atomic::Ordering::Acquire,
                atomic::Ordering::Relaxed,
            )
            .ok()
            .map(|_| CycleGuard { lock: self })
    }
}

impl Default for CycleLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one hibernate/resume cycle, obtained from
/// [`CycleLock::try_begin()`].
pub struct CycleGuard<'a> {
    lock: &'a CycleLock,
}

impl<'a> Drop for CycleGuard<'a> {
    fn drop(&mut self) {
        self.lock.busy.store(false, atomic::Ordering::Release);
    }
}

#[test]
fn cycle_lock_exclusion() {
    let lock = CycleLock::new();
    let guard = lock.try_begin().unwrap();
    assert!(lock.try_begin().is_none());
    drop(guard);
    assert!(lock.try_begin().is_some());
}
