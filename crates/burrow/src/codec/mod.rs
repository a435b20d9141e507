//! Integer sequence codecs for columnar pages.
//!
//! - [`rle`]: literal 4-byte values
//! - [`bitpack`]: fixed-width packing of values bounded by a declared maximum
//! - [`pfor`]: patched frame-of-reference for data with rare large outliers
//! - [`page`]: self-describing column pages built from the codecs above

pub mod bitpack;
pub mod page;
pub mod pfor;
pub mod rle;

pub use bitpack::{BitPackDecoder, BitPackEncoder};
pub use page::{ColumnPage, PageEncoding};
pub use pfor::{PforDecoder, PforEncoder};
pub use rle::{RunLengthDecoder, RunLengthEncoder};

use bitvec::prelude::*;

/// Number of bits needed to represent `max_val`.
pub(crate) fn bits_for(max_val: u64) -> u32 {
    u64::BITS - max_val.leading_zeros()
}

/// Appends the low `width` bits of `value`.
pub(crate) fn push_bits(bits: &mut BitVec<u8, Lsb0>, value: u64, width: u32) {
    if width == 0 {
        return;
    }
    let start = bits.len();
    bits.resize(start + width as usize, false);
    bits[start..].store_le::<u64>(value);
}

/// Reads `width` bits starting at bit `pos`.
pub(crate) fn read_bits(bits: &BitSlice<u8, Lsb0>, pos: usize, width: u32) -> u64 {
    if width == 0 {
        return 0;
    }
    bits[pos..pos + width as usize].load_le::<u64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_for() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 1);
        assert_eq!(bits_for(255), 8);
        assert_eq!(bits_for(256), 9);
        assert_eq!(bits_for(u64::MAX), 64);
    }

    #[test]
    fn test_push_and_read_bits() {
        let mut bits: BitVec<u8, Lsb0> = BitVec::new();
        push_bits(&mut bits, 0b101, 3);
        push_bits(&mut bits, u64::MAX, 64);
        push_bits(&mut bits, 0xff, 4);
        assert_eq!(bits.len(), 71);
        assert_eq!(read_bits(&bits, 0, 3), 0b101);
        assert_eq!(read_bits(&bits, 3, 64), u64::MAX);
        assert_eq!(read_bits(&bits, 67, 4), 0xf);
        assert_eq!(read_bits(&bits, 0, 0), 0);
    }
}
