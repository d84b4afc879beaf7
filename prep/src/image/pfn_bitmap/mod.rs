// SPDX-License-Identifier: Apache-2.0

//! Page frame bitmaps tracking per-page membership in the image's various
//! page sets.

mod bitmap;
mod bitmap_word;

pub use bitmap::{PageMaps, PfnBitmap};
pub use bitmap_word::{BITMAP_WORD_BITS_LOG2, BitmapWord, LEAF_PFNS, LEAF_PFNS_LOG2};
