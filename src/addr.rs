//! Address types a shadow map can be keyed by.

use std::fmt::{Debug, LowerHex};
use std::hash::Hash;

/// An unsigned machine address.
///
/// All routing arithmetic happens on the widened `u64` form; `from_u64`
/// truncates to the native width.
pub trait Address: Copy + Eq + Ord + Hash + Debug + LowerHex + 'static {
    /// Width of the address type in bits.
    const BITS: u32;

    fn to_u64(self) -> u64;

    fn from_u64(raw: u64) -> Self;
}

macro_rules! address {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Address for $ty {
                const BITS: u32 = <$ty>::BITS;

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_u64(raw: u64) -> Self {
                    raw as $ty
                }
            }
        )*
    };
}

address!(u8, u16, u32, u64, usize);

/// `(1 << bits) - 1`, saturating at 64 bits.
#[inline]
pub(crate) const fn low_mask(bits: u32) -> u64 {
    if bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Logical right shift that yields 0 once `bits` reaches the word width.
#[inline]
pub(crate) const fn shr(value: u64, bits: u32) -> u64 {
    if bits >= u64::BITS {
        0
    } else {
        value >> bits
    }
}

#[inline]
pub(crate) const fn shl(value: u64, bits: u32) -> u64 {
    if bits >= u64::BITS {
        0
    } else {
        value << bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_and_shift_saturate() {
        assert_eq!(low_mask(0), 0);
        assert_eq!(low_mask(4), 0xF);
        assert_eq!(low_mask(64), u64::MAX);
        assert_eq!(shr(0x13, 4), 0x1);
        assert_eq!(shr(u64::MAX, 64), 0);
        assert_eq!(shl(0x1, 4), 0x10);
        assert_eq!(shl(0x1, 64), 0);
    }

    #[test]
    fn test_from_u64_truncates() {
        assert_eq!(u8::from_u64(0x1ff), 0xff);
        assert_eq!(u16::from_u64(0x1_0002), 2);
        assert_eq!(<u8 as Address>::BITS, 8);
        assert_eq!(0xabu8.to_u64(), 0xab);
    }
}
