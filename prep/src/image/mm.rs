// SPDX-License-Identifier: Apache-2.0

//! Boundary traits towards the host's memory management, plus the
//! cross-thread [`AbortFlag`].
//!
//! The preparation engine never inspects page tables or allocator state
//! itself. Everything it needs to know about a page, and every way it can
//! influence the host's memory pressure, goes through the traits defined
//! here, which is also what makes the engine testable without a live kernel
//! underneath.

use crate::image::{PrepError, layout};
use core::sync::atomic;

/// Read-only per-page queries against the host's memory management.
pub trait PageOracle {
    /// Whether the page must not be included in the image at all.
    ///
    /// Covers reserved ranges, device mappings and pages an explicit nosave
    /// annotation applies to.
    fn is_reserved_or_unsaveable(&self, pfn: layout::PageFrameIndex) -> bool;

    /// Whether the page is on the allocator's free lists.
    fn is_free(&self, pfn: layout::PageFrameIndex) -> bool;

    /// Whether the page belongs to the high memory zone.
    ///
    /// Always false on architectures without a highmem split; the size
    /// negotiation's highmem arithmetic then degenerates to zero on its own.
    fn is_highmem(&self, pfn: layout::PageFrameIndex) -> bool;
}

/// Interface for applying memory pressure on the engine's behalf.
pub trait MemoryCollaborator {
    /// Current number of free low-memory pages.
    fn free_lowmem_pages(&self) -> u64;

    /// Current number of free high-memory pages.
    fn free_highmem_pages(&self) -> u64;

    /// Try to free at least `target_pages` pages by reclaim.
    ///
    /// Returns the number of pages actually freed, which may fall short;
    /// the caller re-evaluates its constraints afterwards rather than
    /// trusting the request was met.
    ///
    /// # Arguments:
    ///
    /// * `target_pages` - Number of pages to try to reclaim.
    fn shrink_memory(&mut self, target_pages: u64) -> u64;

    /// Drop clean page cache ahead of a reclaim pass.
    fn drop_page_cache(&mut self);
}

/// Interface to the host's process freezer.
///
/// All userspace tasks get frozen before the first classification pass and
/// stay frozen for the rest of the cycle, successful or not. Thawing is the
/// unwind path's job and must always be safe to call.
pub trait Freezer {
    /// Freeze all freezable tasks.
    fn freeze_processes(&mut self) -> Result<(), PrepError>;

    /// Thaw everything [`freeze_processes()`](Self::freeze_processes) froze.
    ///
    /// Must be idempotent.
    fn thaw_processes(&mut self);
}

/// Cancellation flag for an in-flight preparation attempt.
///
/// Set from outside the control thread, e.g. by a user interrupt. The engine
/// polls it at its loop boundaries and unwinds with [`PrepError::Aborted`]
/// once it observes the flag.
pub struct AbortFlag {
    aborted: atomic::AtomicBool,
}

impl AbortFlag {
    pub const fn new() -> Self {
        Self {
            aborted: atomic::AtomicBool::new(false),
        }
    }

    pub fn set(&self) {
        self.aborted.store(true, atomic::Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.aborted.load(atomic::Ordering::Relaxed)
    }

    /// Fail with [`PrepError::Aborted`] if the flag has been set.
    pub fn check(&self) -> Result<(), PrepError> {
        if self.is_set() {
            Err(PrepError::Aborted)
        } else {
            Ok(())
        }
    }
}

impl Default for AbortFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn abort_flag() {
    let flag = AbortFlag::new();
    assert!(flag.check().is_ok());
    flag.set();
    assert!(flag.is_set());
    assert_eq!(flag.check(), Err(PrepError::Aborted));
}
