//! The worker's view of its host harness.
//!
//! The harness decides when to stop, counts operations and owns any memory it
//! shares with other workers. `BudgetHarness` is the standalone
//! implementation used by the command-line driver and the tests.

use crate::config::types::{OpcodeConfig, OpcodeError, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// A mapping a sandboxed child must unmap before running generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedRegion {
    pub addr: usize,
    pub len: usize,
}

pub trait StressHarness {
    fn name(&self) -> &str {
        "opcode"
    }

    /// False once the budget is spent or shutdown was requested.
    fn keep_running(&self) -> bool;

    /// One generation reaped, whatever its outcome.
    fn op_completed(&mut self);

    fn ops(&self) -> u64;

    /// Harness memory the child must detach from.
    fn shared_regions(&self) -> Vec<SharedRegion> {
        Vec::new()
    }
}

/// Per-instance operation counters in one MAP_SHARED mapping, readable by the
/// process that created it while forked workers update their own slot.
pub struct OpsBoard {
    base: NonNull<AtomicU64>,
    slots: usize,
    len: usize,
}

impl OpsBoard {
    pub fn map(slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(OpcodeError::Config("ops board needs at least one slot".to_string()));
        }
        let len = slots * std::mem::size_of::<AtomicU64>();
        // SAFETY: anonymous shared mapping, kernel picks the address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(OpcodeError::Memory(format!(
                "mmap of {} bytes for the ops board failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        let base = NonNull::new(addr as *mut AtomicU64)
            .ok_or_else(|| OpcodeError::Memory("mmap returned null".to_string()))?;
        Ok(Self { base, slots, len })
    }

    fn counters(&self) -> &[AtomicU64] {
        // SAFETY: zero-filled shared memory holding `slots` AtomicU64s, alive as long as self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.slots) }
    }

    pub fn slot(&self, index: usize) -> Option<BoardSlot<'_>> {
        self.counters().get(index).map(|counter| BoardSlot {
            counter,
            region: self.region(),
        })
    }

    pub fn region(&self) -> SharedRegion {
        SharedRegion {
            addr: self.base.as_ptr() as usize,
            len: self.len,
        }
    }

    pub fn counts(&self) -> Vec<u64> {
        self.counters().iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn total(&self) -> u64 {
        self.counters().iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

impl Drop for OpsBoard {
    fn drop(&mut self) {
        // SAFETY: exactly the mapping created in map().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// One worker's counter on an [`OpsBoard`].
#[derive(Clone, Copy, Debug)]
pub struct BoardSlot<'a> {
    counter: &'a AtomicU64,
    region: SharedRegion,
}

/// Stops after `max_ops` operations (0 = no limit), after the timeout, or
/// when the shutdown flag goes up, whichever comes first.
pub struct BudgetHarness<'a> {
    name: String,
    max_ops: u64,
    deadline: Option<Instant>,
    ops: u64,
    shutdown: Option<&'static AtomicBool>,
    board: Option<BoardSlot<'a>>,
}

impl<'a> BudgetHarness<'a> {
    pub fn new(max_ops: u64) -> Self {
        Self {
            name: "opcode".to_string(),
            max_ops,
            deadline: None,
            ops: 0,
            shutdown: None,
            board: None,
        }
    }

    pub fn from_config(config: &OpcodeConfig) -> Self {
        let mut harness = Self::new(config.max_ops);
        harness.deadline = config.timeout().map(|t| Instant::now() + t);
        harness.name = format!("opcode-{}", config.instance);
        harness
    }

    pub fn with_shutdown_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn with_board(mut self, slot: BoardSlot<'a>) -> Self {
        self.board = Some(slot);
        self
    }
}

impl StressHarness for BudgetHarness<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn keep_running(&self) -> bool {
        if self.shutdown.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return false;
        }
        if self.max_ops > 0 && self.ops >= self.max_ops {
            return false;
        }
        match self.deadline {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }

    fn op_completed(&mut self) {
        self.ops += 1;
        if let Some(slot) = self.board {
            slot.counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ops(&self) -> u64 {
        self.ops
    }

    fn shared_regions(&self) -> Vec<SharedRegion> {
        self.board.iter().map(|slot| slot.region).collect()
    }
}
