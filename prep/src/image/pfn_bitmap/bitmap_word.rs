// SPDX-License-Identifier: Apache-2.0

//! Defininitions related to a [`PfnBitmap`](super::PfnBitmap)'s
//! [`BitmapWord`].

/// [`PfnBitmap`](super::PfnBitmap) word.
pub type BitmapWord = u64;

/// Base-2 logarithm of [`BitmapWord::BITS`].
pub const BITMAP_WORD_BITS_LOG2: u32 = BitmapWord::BITS.ilog2();

/// Base-2 logarithm of the number of [`BitmapWord`]s in one bitmap leaf.
///
/// Chosen so that one leaf occupies exactly one page.
pub const LEAF_WORDS_LOG2: u32 = 9;

/// Number of [`BitmapWord`]s in one bitmap leaf.
pub const LEAF_WORDS: usize = 1usize << LEAF_WORDS_LOG2;

/// Base-2 logarithm of the number of page frames tracked by one bitmap leaf.
pub const LEAF_PFNS_LOG2: u32 = LEAF_WORDS_LOG2 + BITMAP_WORD_BITS_LOG2;

/// Number of page frames tracked by one bitmap leaf.
pub const LEAF_PFNS: u64 = 1u64 << LEAF_PFNS_LOG2;
