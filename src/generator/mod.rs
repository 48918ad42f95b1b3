//! Instruction stream generators.
//!
//! Every generator is a pure function of the target window, the slot width,
//! the execution counter value and a pseudo-random stream. None of them
//! allocate, so they are safe to run inside a freshly forked child.

pub mod bits;
pub mod incrementing;
pub mod mixed;
pub mod random;
pub mod text;

use crate::config::types::Method;
use rand::RngCore;

/// Width of one instruction slot, fixed per target architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotWidth {
    W8,
    W16,
    W32,
    W48,
    W64,
}

impl SlotWidth {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub const NATIVE: SlotWidth = SlotWidth::W8;

    #[cfg(target_arch = "s390x")]
    pub const NATIVE: SlotWidth = SlotWidth::W48;

    #[cfg(any(
        target_arch = "aarch64",
        target_arch = "arm",
        target_arch = "riscv64",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "loongarch64"
    ))]
    pub const NATIVE: SlotWidth = SlotWidth::W32;

    #[cfg(not(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "s390x",
        target_arch = "aarch64",
        target_arch = "arm",
        target_arch = "riscv64",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "loongarch64"
    )))]
    pub const NATIVE: SlotWidth = SlotWidth::W64;

    pub const fn bits(self) -> u32 {
        match self {
            SlotWidth::W8 => 8,
            SlotWidth::W16 => 16,
            SlotWidth::W32 => 32,
            SlotWidth::W48 => 48,
            SlotWidth::W64 => 64,
        }
    }

    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Mask selecting the low `bits()` bits of a counter value.
    pub const fn mask(self) -> u64 {
        match self {
            SlotWidth::W64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }

    /// Number of hex digits needed to print a counter value of this width.
    pub const fn hex_digits(self) -> usize {
        (self.bits() / 4) as usize
    }

    /// Byte image of one slot holding `value`, in the order it is laid out in memory.
    ///
    /// Power-of-two widths use native byte order; 48-bit slots are always
    /// packed low byte first.
    pub fn encode(self, value: u64) -> ([u8; 8], usize) {
        let mut out = [0u8; 8];
        let len = self.bytes();
        match self {
            SlotWidth::W8 => out[0] = value as u8,
            SlotWidth::W16 => out[..2].copy_from_slice(&(value as u16).to_ne_bytes()),
            SlotWidth::W32 => out[..4].copy_from_slice(&(value as u32).to_ne_bytes()),
            SlotWidth::W48 => out[..6].copy_from_slice(&value.to_le_bytes()[..6]),
            SlotWidth::W64 => out = value.to_ne_bytes(),
        }
        (out, len)
    }
}

/// Inputs shared by all generators for one generation.
#[derive(Clone, Copy, Debug)]
pub struct GenerationContext<'a> {
    pub width: SlotWidth,
    /// Execution counter value seeding the deterministic generators
    pub seed: u64,
    /// Live executable segment of this program, empty when unavailable
    pub text: &'a [u8],
}

impl<'a> GenerationContext<'a> {
    pub fn new(width: SlotWidth, seed: u64) -> Self {
        Self {
            width,
            seed,
            text: &[],
        }
    }

    pub fn with_text(mut self, text: &'a [u8]) -> Self {
        self.text = text;
        self
    }
}

impl Method {
    /// Fill `window` with a candidate instruction stream.
    ///
    /// The whole window is written; bytes past the last full stride are zeroed.
    pub fn fill<R: RngCore + ?Sized>(self, window: &mut [u8], ctx: &GenerationContext<'_>, rng: &mut R) {
        match self {
            Method::Random => random::fill(window, rng),
            Method::Incrementing => incrementing::fill(window, ctx.width, ctx.seed),
            Method::Mixed => mixed::fill(window, ctx.seed, rng),
            Method::MutatedText => text::fill(window, ctx.text, rng),
        }
    }

    /// Natural write stride of the method, in bytes.
    pub fn stride(self, width: SlotWidth) -> usize {
        match self {
            Method::Random => random::STRIDE,
            Method::Incrementing => width.bytes(),
            Method::Mixed => mixed::CYCLE_BYTES,
            Method::MutatedText => 1,
        }
    }
}
