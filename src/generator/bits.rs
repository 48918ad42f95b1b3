//! Bit transforms used by the mixed generator.

/// Gray code of `v`.
#[inline(always)]
pub const fn gray(v: u64) -> u64 {
    v ^ (v >> 1)
}

/// Low 32 bits complemented, high 32 bits untouched.
#[inline(always)]
pub const fn invert_low32(v: u64) -> u64 {
    v ^ 0xffff_ffff
}

/// Reverse the bit order inside every byte, keeping byte positions.
///
/// This is the nibble/pair/bit swap ladder; it does not move bytes.
#[inline(always)]
pub const fn reverse_bits_in_bytes(mut x: u64) -> u64 {
    x = ((x & 0xf0f0_f0f0_f0f0_f0f0) >> 4) | ((x & 0x0f0f_0f0f_0f0f_0f0f) << 4);
    x = ((x & 0xcccc_cccc_cccc_cccc) >> 2) | ((x & 0x3333_3333_3333_3333) << 2);
    x = ((x & 0xaaaa_aaaa_aaaa_aaaa) >> 1) | ((x & 0x5555_5555_5555_5555) << 1);
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_code_neighbours_differ_by_one_bit() {
        for v in 0u64..1024 {
            assert_eq!((gray(v) ^ gray(v + 1)).count_ones(), 1);
        }
    }

    #[test]
    fn reverse_matches_per_byte_reverse() {
        let v = 0x0123_4567_89ab_cdefu64;
        let expected = u64::from_ne_bytes(v.to_ne_bytes().map(u8::reverse_bits));
        assert_eq!(reverse_bits_in_bytes(v), expected);
        assert_eq!(reverse_bits_in_bytes(0x01), 0x80);
        assert_eq!(reverse_bits_in_bytes(reverse_bits_in_bytes(v)), v);
    }

    #[test]
    fn invert_only_touches_low_half() {
        assert_eq!(invert_low32(0), 0xffff_ffff);
        assert_eq!(invert_low32(0xdead_beef_0000_0000), 0xdead_beef_ffff_ffff);
    }
}
