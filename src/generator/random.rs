//! Uniform random words.

use rand::RngCore;

pub const STRIDE: usize = 4;

/// Replace every 32-bit word of `window` by a fresh random value.
pub fn fill<R: RngCore + ?Sized>(window: &mut [u8], rng: &mut R) {
    let mut words = window.chunks_exact_mut(STRIDE);
    for word in &mut words {
        word.copy_from_slice(&rng.next_u32().to_ne_bytes());
    }
    words.into_remainder().fill(0);
}
