//! Counter value replicated across the window.

use super::SlotWidth;

/// Write the `width`-bit view of `seed` into every slot of `window`.
///
/// A trailing partial slot is zero-filled.
pub fn fill(window: &mut [u8], width: SlotWidth, seed: u64) {
    let (image, len) = width.encode(seed & width.mask());
    let image = &image[..len];

    if len == 1 {
        window.fill(image[0]);
        return;
    }

    let mut slots = window.chunks_exact_mut(len);
    for slot in &mut slots {
        slot.copy_from_slice(image);
    }
    slots.into_remainder().fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_value(slot: &[u8], width: SlotWidth) -> u64 {
        match width {
            SlotWidth::W8 => slot[0] as u64,
            SlotWidth::W16 => u16::from_ne_bytes([slot[0], slot[1]]) as u64,
            SlotWidth::W32 => u32::from_ne_bytes(slot.try_into().unwrap()) as u64,
            SlotWidth::W48 => {
                let mut b = [0u8; 8];
                b[..6].copy_from_slice(slot);
                u64::from_le_bytes(b)
            }
            SlotWidth::W64 => u64::from_ne_bytes(slot.try_into().unwrap()),
        }
    }

    #[test]
    fn every_slot_holds_the_counter() {
        for width in [
            SlotWidth::W8,
            SlotWidth::W16,
            SlotWidth::W32,
            SlotWidth::W48,
            SlotWidth::W64,
        ] {
            let seed = 0xfedc_ba98_7654_3210 & width.mask();
            let mut buf = vec![0u8; 4096];
            fill(&mut buf, width, seed);

            let mut slots = buf.chunks_exact(width.bytes());
            for slot in &mut slots {
                assert_eq!(slot_value(slot, width), seed, "width {:?}", width);
            }
            assert!(slots.remainder().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn forty_eight_bit_slack_is_zero_padded() {
        let mut buf = vec![0xffu8; 4096];
        fill(&mut buf, SlotWidth::W48, 0x0000_0102_0304_0506);
        // 4096 = 682 * 6 + 4
        assert_eq!(&buf[4092..], &[0, 0, 0, 0]);
        assert_eq!(&buf[..6], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn seed_is_masked_to_width() {
        let mut buf = vec![0u8; 8];
        fill(&mut buf, SlotWidth::W16, 0x1_2345);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 0x2345);
    }

    #[test]
    fn next_counter_changes_every_slot() {
        let width = SlotWidth::W32;
        let mut first = vec![0u8; 4096];
        let mut second = vec![0u8; 4096];
        fill(&mut first, width, 41);
        fill(&mut second, width, 42);

        for (a, b) in first.chunks_exact(4).zip(second.chunks_exact(4)) {
            assert_ne!(a, b);
        }
    }
}
