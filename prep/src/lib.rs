// SPDX-License-Identifier: Apache-2.0

#![no_std]

// Lifetimes are not always obvious at first sight, allow for making them explicit even if
// redundant.
#![allow(clippy::needless_lifetimes)]

use snapimage_utils_common as utils_common;

pub mod image;
pub mod store;
