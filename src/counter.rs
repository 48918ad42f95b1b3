//! Execution counter: generator seed and postmortem context.
//!
//! The counter is an explicit value. The worker owns one, advances it once per
//! generation and hands a copy to each child, which advances its own copy once
//! per executed slot. Nothing is shared across the fork after that point.

use crate::generator::SlotWidth;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionCounter {
    value: u64,
    width: SlotWidth,
}

impl ExecutionCounter {
    pub fn new(width: SlotWidth, value: u64) -> Self {
        Self {
            value: value & width.mask(),
            width,
        }
    }

    /// Counter starting at this instance's share of the `2^width` space.
    pub fn partitioned(width: SlotWidth, instance: u32, instances: u32) -> Self {
        Self::new(width, partition_start(width, instance, instances))
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn width(&self) -> SlotWidth {
        self.width
    }

    /// Step to the next value, wrapping at `2^width`. Returns the new value.
    #[inline(always)]
    pub fn advance(&mut self) -> u64 {
        self.value = self.value.wrapping_add(1) & self.width.mask();
        self.value
    }
}

/// `2^width * instance / instances`, computed without overflow.
pub fn partition_start(width: SlotWidth, instance: u32, instances: u32) -> u64 {
    let instances = instances.max(1) as u128;
    let space = 1u128 << width.bits();
    ((space * instance as u128) / instances) as u64
}

/// Counter values this instance owns before it runs into its neighbour.
pub fn partition(width: SlotWidth, instance: u32, instances: u32) -> Range<u128> {
    let start = partition_start(width, instance, instances) as u128;
    let end = if instance + 1 >= instances {
        1u128 << width.bits()
    } else {
        partition_start(width, instance + 1, instances) as u128
    };
    start..end
}
