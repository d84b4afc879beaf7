// SPDX-License-Identifier: Apache-2.0

//! Bit manipulation helpers on the primitive unsigned integer types.

/// Bit manipulation helpers common to all unsigned integer types.
pub trait BitManip: Sized + Copy {
    /// Number of bits up to and including the most significant set one.
    fn significant_bits(&self) -> u32;
}

/// Additional helpers for unsigned integers interpreted as quantities aligned
/// to powers of two.
pub trait UBitManip: Sized + Copy {
    /// Round down to the next multiple of 2<sup>`pow2_log2`</sup>.
    fn round_down_pow2(&self, pow2_log2: u32) -> Self;

    /// Round up to the next multiple of 2<sup>`pow2_log2`</sup>.
    ///
    /// Returns `None` on overflow.
    fn round_up_pow2(&self, pow2_log2: u32) -> Option<Self>;
}

macro_rules! impl_bitmanip {
    ($t:ty) => {
        impl BitManip for $t {
            fn significant_bits(&self) -> u32 {
                <$t>::BITS - self.leading_zeros()
            }
        }

        impl UBitManip for $t {
            fn round_down_pow2(&self, pow2_log2: u32) -> Self {
                (*self >> pow2_log2) << pow2_log2
            }

            fn round_up_pow2(&self, pow2_log2: u32) -> Option<Self> {
                let mask = ((1 as $t) << pow2_log2) - 1;
                Some(self.checked_add(mask)? & !mask)
            }
        }
    };
}

impl_bitmanip!(u32);
impl_bitmanip!(u64);
impl_bitmanip!(usize);

#[test]
fn significant_bits() {
    assert_eq!(0u64.significant_bits(), 0);
    assert_eq!(1u64.significant_bits(), 1);
    assert_eq!(0x80u64.significant_bits(), 8);
    assert_eq!(u64::MAX.significant_bits(), 64);
}

#[test]
fn round_pow2() {
    assert_eq!(0u64.round_down_pow2(12), 0);
    assert_eq!(4097u64.round_down_pow2(12), 4096);
    assert_eq!(4096u64.round_up_pow2(12), Some(4096));
    assert_eq!(4097u64.round_up_pow2(12), Some(8192));
    assert_eq!(u64::MAX.round_up_pow2(1), None);
}
