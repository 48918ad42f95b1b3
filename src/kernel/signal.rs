//! Async-safe signal handling.
//!
//! Two unrelated concerns live here:
//! - the worker's shutdown flag, raised by SIGINT/SIGTERM/SIGHUP and polled
//!   from the main loop;
//! - the child's fault handlers, which turn any trap raised by generated code
//!   into an immediate `_exit`, optionally bumping a shared per-signal tally
//!   first.
use log::info;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Shared tally the fault handler writes to, null when tracking is off.
static FAULT_TALLY: AtomicPtr<AtomicU64> = AtomicPtr::new(ptr::null_mut());

/// Exit status of a child whose generated code trapped.
pub const FAULT_EXIT_STATUS: i32 = 1;

/// Signals generated code is expected to raise. SIGINT and SIGHUP are here so
/// a terminal interrupt ends the child the same way a fault does. SIGALRM and
/// SIGTERM are absent: both get their default disposition back in the child.
pub const FAULT_SIGNALS: [Signal; 9] = [
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGSYS,
];

/// Signals that must terminate the child without running any handler.
pub const DEFAULT_SIGNALS: [Signal; 2] = [Signal::SIGALRM, Signal::SIGTERM];

/// Slots in a [`SignalTally`]; covers realtime signals too.
pub const TALLY_SLOTS: usize = 65;

/// Worker-side shutdown handling.
pub struct SignalHandler;

impl SignalHandler {
    /// Install the shutdown handlers.
    /// Must be called early in main() before any threads are spawned.
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;

            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;

            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Shutdown handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// Flag raised once shutdown was requested.
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN_REQUESTED
}

/// Per-signal counters in a MAP_SHARED page, visible to the worker after the
/// child that bumped them is gone.
pub struct SignalTally {
    slots: ptr::NonNull<AtomicU64>,
}

impl SignalTally {
    pub fn map() -> Result<Self, Errno> {
        let len = Self::byte_len();
        // SAFETY: anonymous shared mapping, kernel picks the address.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        let slots = ptr::NonNull::new(addr as *mut AtomicU64).ok_or(Errno::ENOMEM)?;
        // Zero-filled anonymous memory is a valid array of AtomicU64::new(0).
        Ok(Self { slots })
    }

    fn byte_len() -> usize {
        TALLY_SLOTS * std::mem::size_of::<AtomicU64>()
    }

    fn slots(&self) -> &[AtomicU64] {
        // SAFETY: mapping holds TALLY_SLOTS zero-initialised u64s and lives as long as self.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), TALLY_SLOTS) }
    }

    /// Route fault handler bumps in this process (and its future children) here.
    pub fn arm(&self) {
        FAULT_TALLY.store(self.slots.as_ptr(), Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        let _ = FAULT_TALLY.compare_exchange(
            self.slots.as_ptr(),
            ptr::null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn count(&self, signal: Signal) -> u64 {
        self.slots()
            .get(signal as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Signals seen at least once, with their counts.
    pub fn nonzero(&self) -> Vec<(Signal, u64)> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(signum, slot)| {
                let n = slot.load(Ordering::Relaxed);
                let sig = Signal::try_from(signum as i32).ok()?;
                (n > 0).then_some((sig, n))
            })
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.slots().iter().map(|slot| slot.load(Ordering::Relaxed)).sum()
    }
}

impl Drop for SignalTally {
    fn drop(&mut self) {
        self.disarm();
        // SAFETY: exactly the mapping created in map().
        unsafe {
            libc::munmap(self.slots.as_ptr() as *mut libc::c_void, Self::byte_len());
        }
    }
}

extern "C" fn fault_handler(signum: libc::c_int) {
    let tally = FAULT_TALLY.load(Ordering::Relaxed);
    if !tally.is_null() && (signum as usize) < TALLY_SLOTS {
        // SAFETY: non-null tally points at TALLY_SLOTS atomics in a live shared mapping.
        unsafe { (*tally.add(signum as usize)).fetch_add(1, Ordering::Relaxed) };
    }
    // SAFETY: _exit is async-signal-safe and skips atexit handlers.
    unsafe { libc::_exit(FAULT_EXIT_STATUS) }
}

const ALT_STACK_SIZE: usize = 64 * 1024;

/// Give fault handlers their own stack so a clobbered stack pointer can still
/// be reported.
fn install_alt_stack() -> Result<(), Errno> {
    // SAFETY: anonymous private mapping; intentionally never unmapped.
    let stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    let ss = libc::stack_t {
        ss_sp: stack,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: ss describes a mapped RW region of ALT_STACK_SIZE bytes.
    if unsafe { libc::sigaltstack(&ss, ptr::null_mut()) } != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Install the child's fault handlers. Raw syscalls only; no allocation.
///
/// The watchdog signal and SIGTERM, which the worker may have hooked for
/// shutdown, are reset to their default disposition and every fault
/// signal is unblocked, whatever the parent thread's mask was.
pub fn install_fault_handlers() -> Result<(), Errno> {
    install_alt_stack()?;

    let action = SigAction::new(
        SigHandler::Handler(fault_handler),
        SaFlags::SA_ONSTACK | SaFlags::SA_RESETHAND,
        SigSet::all(),
    );
    let mut unblock = SigSet::empty();
    for sig in FAULT_SIGNALS {
        // SAFETY: fault_handler only touches atomics and calls _exit.
        unsafe { signal::sigaction(sig, &action)? };
        unblock.add(sig);
    }

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in DEFAULT_SIGNALS {
        // SAFETY: restoring the default disposition.
        unsafe { signal::sigaction(sig, &default)? };
        unblock.add(sig);
    }

    signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;
    Ok(())
}
