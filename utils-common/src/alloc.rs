// SPDX-License-Identifier: Apache-2.0

//! Fallible heap allocation helpers.

extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

/// Error type returned by the fallible allocation primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryNewError {
    /// A memory allocation has failed.
    MemoryAllocationFailure,
}

impl From<alloc::collections::TryReserveError> for TryNewError {
    fn from(_value: alloc::collections::TryReserveError) -> Self {
        Self::MemoryAllocationFailure
    }
}

/// Allocate a [`Vec`] of specified length with default-initialized elements.
///
/// Unlike `vec![T::default(); len]`, an allocation failure is reported as a
/// [`TryNewError`] rather than aborting.
///
/// # Arguments:
///
/// * `len` - The number of elements the allocated [`Vec`] shall contain.
pub fn try_alloc_vec<T: Default + Clone>(len: usize) -> Result<Vec<T>, TryNewError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v)
}

/// Allocate a boxed slice of specified length with default-initialized
/// elements.
///
/// # Arguments:
///
/// * `len` - The number of elements the allocated slice shall contain.
pub fn try_alloc_boxed_slice<T: Default + Clone>(len: usize) -> Result<Box<[T]>, TryNewError> {
    Ok(try_alloc_vec(len)?.into_boxed_slice())
}

#[test]
fn alloc_vec() {
    let v = try_alloc_vec::<u64>(7).unwrap();
    assert_eq!(v.len(), 7);
    assert!(v.iter().all(|w| *w == 0));

    let v = try_alloc_vec::<u64>(0).unwrap();
    assert!(v.is_empty());
}

#[test]
fn alloc_boxed_slice() {
    let s = try_alloc_boxed_slice::<u8>(33).unwrap();
    assert_eq!(s.len(), 33);
    assert!(s.iter().all(|b| *b == 0));
}
