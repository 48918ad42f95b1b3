//! Deterministic and random shapes interleaved in 8-word cycles.

use super::bits::{gray, invert_low32, reverse_bits_in_bytes};
use rand::RngCore;

pub const WORDS_PER_CYCLE: usize = 8;
pub const CYCLE_BYTES: usize = WORDS_PER_CYCLE * 8;

#[inline(always)]
fn transforms(v: u64) -> [u64; 4] {
    [v, invert_low32(v), gray(v), reverse_bits_in_bytes(v)]
}

/// Each 64-byte cycle holds the four transforms of `seed`, then the same four
/// transforms of a freshly drawn random value.
pub fn fill<R: RngCore + ?Sized>(window: &mut [u8], seed: u64, rng: &mut R) {
    let counter_words = transforms(seed);

    let mut cycles = window.chunks_exact_mut(CYCLE_BYTES);
    for cycle in &mut cycles {
        let random_words = transforms(rng.next_u64());
        let words = counter_words.iter().chain(random_words.iter());
        for (slot, word) in cycle.chunks_exact_mut(8).zip(words) {
            slot.copy_from_slice(&word.to_ne_bytes());
        }
    }
    cycles.into_remainder().fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn words(cycle: &[u8]) -> Vec<u64> {
        cycle
            .chunks_exact(8)
            .map(|w| u64::from_ne_bytes(w.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn cycle_relations_hold() {
        let mut buf = vec![0u8; 4096];
        fill(&mut buf, 0x0123_4567_89ab_cdef, &mut StdRng::seed_from_u64(9));

        for cycle in buf.chunks_exact(CYCLE_BYTES) {
            let w = words(cycle);
            assert_eq!(w[0], 0x0123_4567_89ab_cdef);
            assert_eq!(w[1], w[0] ^ 0xffff_ffff);
            assert_eq!(w[2], w[0] ^ (w[0] >> 1));
            assert_eq!(w[3], reverse_bits_in_bytes(w[0]));
            assert_eq!(w[5], w[4] ^ 0xffff_ffff);
            assert_eq!(w[6], w[4] ^ (w[4] >> 1));
            assert_eq!(w[7], reverse_bits_in_bytes(w[4]));
        }
    }

    #[test]
    fn random_half_is_redrawn_per_cycle() {
        let mut buf = vec![0u8; CYCLE_BYTES * 4];
        fill(&mut buf, 0, &mut StdRng::seed_from_u64(11));
        let seeds: Vec<u64> = buf.chunks_exact(CYCLE_BYTES).map(|c| words(c)[4]).collect();
        assert!(seeds.windows(2).all(|p| p[0] != p[1]));
    }

    #[test]
    fn partial_cycle_is_zeroed() {
        let mut buf = vec![0xaau8; CYCLE_BYTES + 12];
        fill(&mut buf, 5, &mut StdRng::seed_from_u64(1));
        assert!(buf[CYCLE_BYTES..].iter().all(|&b| b == 0));
    }
}
