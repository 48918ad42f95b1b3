//! Live program code with sparse single-bit corruption.

use super::random;
use rand::RngCore;

/// Bytes at the tail of the text segment that are never copied.
const TEXT_TAIL_SLACK: usize = 8;

/// Flip threshold on a random byte: 32/256 gives the 1-in-8 corruption rate.
const FLIP_THRESHOLD: u8 = 32;

/// Copy a window-sized block of `text` from a random 8-byte aligned offset and
/// flip one random bit in roughly one byte out of eight.
///
/// Falls back to [`random::fill`] when `text` is too small for the window.
pub fn fill<R: RngCore + ?Sized>(window: &mut [u8], text: &[u8], rng: &mut R) {
    let text_len = text.len().saturating_sub(TEXT_TAIL_SLACK);
    let len = window.len();

    if text_len < len {
        random::fill(window, rng);
        return;
    }

    let span = (text_len - len) as u64;
    let offset = if span == 0 {
        0
    } else {
        (rng.next_u64() % span) as usize & !0x7
    };

    window.copy_from_slice(&text[offset..offset + len]);
    mutate(window, rng);
}

fn mutate<R: RngCore + ?Sized>(bytes: &mut [u8], rng: &mut R) {
    for byte in bytes.iter_mut() {
        let rnd = rng.next_u32() as u8;
        if rnd < FLIP_THRESHOLD {
            *byte ^= 1 << (rnd & 7);
        }
    }
}
