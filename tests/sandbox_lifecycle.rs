//! End-to-end tests of the fork / sandbox / reap cycle.
//!
//! Every test that forks holds FORK_LOCK so "no child left behind" can be
//! checked with a wildcard waitpid.

#![cfg(target_os = "linux")]

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use opcodebox::exec::child::{Fill, SetupStage};
use opcodebox::exec::harness::{BudgetHarness, SharedRegion, StressHarness};
use opcodebox::exec::worker::{ChildOutcome, Worker};
use opcodebox::kernel::probe;
use opcodebox::{Method, OpcodeConfig, StressExit};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Mutex, MutexGuard};

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod patterns {
    /// `push es`: invalid in 64-bit mode, #UD on x86_64.
    #[cfg(target_arch = "x86_64")]
    pub const ILLEGAL: &[u8] = &[0x06];
    /// `ud2`
    #[cfg(target_arch = "x86")]
    pub const ILLEGAL: &[u8] = &[0x0f, 0x0b];
    /// `jmp $`
    pub const SPIN: &[u8] = &[0xeb, 0xfe];
    /// `ret`
    pub const RETURN: &[u8] = &[0xc3];
}

#[cfg(target_arch = "aarch64")]
mod patterns {
    /// `udf #0`
    pub const ILLEGAL: &[u8] = &[0x00, 0x00, 0x00, 0x00];
    /// `b .`
    pub const SPIN: &[u8] = &[0x00, 0x00, 0x00, 0x14];
    /// `ret`
    pub const RETURN: &[u8] = &[0xc0, 0x03, 0x5f, 0xd6];
}

macro_rules! require_sandbox {
    () => {
        let support = probe::probe();
        if !support.is_supported() {
            eprintln!("skipping: host lacks {}", support.missing().join(", "));
            return;
        }
    };
}

fn worker(config: &OpcodeConfig) -> Worker {
    Worker::with_rng(config, StdRng::seed_from_u64(0x5eed)).unwrap()
}

fn assert_no_children() {
    assert_eq!(
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)).err(),
        Some(Errno::ECHILD),
        "a child outlived its generation"
    );
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn illegal_instruction_child_faults_and_counts_once() {
    require_sandbox!();
    let _guard = fork_lock();

    let mut worker = worker(&OpcodeConfig::default());
    let mut harness = BudgetHarness::new(0);

    let record = worker
        .run_with_fill(&mut harness, Fill::Repeat(patterns::ILLEGAL))
        .unwrap()
        .unwrap();

    assert_eq!(record.outcome, ChildOutcome::Faulted);
    assert_eq!(harness.ops(), 1);
    assert_no_children();
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn thousand_faulting_children_leave_worker_stable() {
    require_sandbox!();
    let _guard = fork_lock();

    let mut worker = worker(&OpcodeConfig::default());
    let mut harness = BudgetHarness::new(0);

    for i in 0..1000u64 {
        let record = worker
            .run_with_fill(&mut harness, Fill::Repeat(patterns::ILLEGAL))
            .unwrap()
            .unwrap();
        assert_eq!(record.outcome, ChildOutcome::Faulted, "generation {}", i);
        assert_eq!(harness.ops(), i + 1);
        assert_no_children();
    }

    assert_eq!(worker.outcomes().faulted, 1000);

    // Still able to spawn. Random code may fault too, so only the total moves predictably.
    let record = worker.run_generation(&mut harness).unwrap().unwrap();
    assert_eq!(harness.ops(), 1001);
    assert_ne!(record.outcome, ChildOutcome::Lost);
    assert_eq!(worker.outcomes().total(), 1001);
    assert!(worker.outcomes().faulted >= 1000);
    assert_no_children();
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn spinning_child_is_stopped_by_watchdog() {
    require_sandbox!();
    let _guard = fork_lock();

    let mut worker = worker(&OpcodeConfig::default());
    let mut harness = BudgetHarness::new(0);

    let record = worker
        .run_with_fill(&mut harness, Fill::Repeat(patterns::SPIN))
        .unwrap()
        .unwrap();

    assert_eq!(record.outcome, ChildOutcome::Watchdog);
    assert_eq!(harness.ops(), 1);
    assert_no_children();
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn returning_slots_complete_the_window() {
    require_sandbox!();
    let _guard = fork_lock();

    // Re-arming the filter for every slot gets slower as copies stack up.
    let config = OpcodeConfig {
        watchdog_interval_ms: 900,
        ..OpcodeConfig::default()
    };
    let mut worker = worker(&config);
    let mut harness = BudgetHarness::new(0);

    let record = worker
        .run_with_fill(&mut harness, Fill::Repeat(patterns::RETURN))
        .unwrap()
        .unwrap();

    assert_eq!(record.outcome, ChildOutcome::Completed);
    assert_no_children();
}

#[test]
fn incrementing_passes_use_strictly_increasing_seeds() {
    require_sandbox!();
    let _guard = fork_lock();

    let config = OpcodeConfig {
        method: Method::Incrementing,
        ..OpcodeConfig::default()
    };
    let mut worker = worker(&config);
    let mut harness = BudgetHarness::new(0);
    let mut seeds = Vec::new();

    for _pass in 0..2 {
        for _ in 0..8 {
            let record = worker.run_generation(&mut harness).unwrap().unwrap();
            seeds.push(record.seed);
        }
    }

    assert_eq!(seeds.len(), 16);
    assert!(seeds.windows(2).all(|w| w[1] > w[0]), "seeds {:?}", seeds);
    assert_eq!(harness.ops(), 16);
    assert_eq!(worker.counter().value(), seeds[15] + 1);
    assert_no_children();
}

#[test]
fn every_method_runs_and_each_generation_counts_once() {
    require_sandbox!();
    let _guard = fork_lock();

    for method in Method::ALL {
        let config = OpcodeConfig {
            method,
            ..OpcodeConfig::default()
        };
        let mut worker = worker(&config);
        let mut harness = BudgetHarness::new(0);

        for _ in 0..20 {
            let record = worker.run_generation(&mut harness).unwrap().unwrap();
            assert!(
                !matches!(record.outcome, ChildOutcome::SetupFailed(_) | ChildOutcome::Lost),
                "{}: {}",
                method,
                record.outcome
            );
        }
        assert_eq!(harness.ops(), 20);
        assert_eq!(worker.outcomes().total(), 20);
        assert_no_children();
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn signal_tally_counts_handled_faults() {
    require_sandbox!();
    let _guard = fork_lock();

    let config = OpcodeConfig {
        track_signals: true,
        ..OpcodeConfig::default()
    };
    let mut worker = worker(&config);
    let mut harness = BudgetHarness::new(0);

    for _ in 0..5 {
        worker
            .run_with_fill(&mut harness, Fill::Repeat(patterns::ILLEGAL))
            .unwrap()
            .unwrap();
    }

    let tally = worker.signal_tally().unwrap();
    assert_eq!(tally.count(Signal::SIGILL), 5);
    assert_eq!(tally.total(), 5);
}

/// Harness that asks children to unmap a region.
struct DetachHarness {
    inner: BudgetHarness<'static>,
    region: SharedRegion,
}

impl StressHarness for DetachHarness {
    fn keep_running(&self) -> bool {
        self.inner.keep_running()
    }

    fn op_completed(&mut self) {
        self.inner.op_completed()
    }

    fn ops(&self) -> u64 {
        self.inner.ops()
    }

    fn shared_regions(&self) -> Vec<SharedRegion> {
        vec![self.region]
    }
}

#[test]
fn bad_detach_region_is_a_setup_failure() {
    require_sandbox!();
    let _guard = fork_lock();

    let mut worker = worker(&OpcodeConfig::default());
    let mut harness = DetachHarness {
        inner: BudgetHarness::new(0),
        // Unaligned: munmap rejects it.
        region: SharedRegion { addr: 1, len: 4096 },
    };

    let record = worker.run_generation(&mut harness).unwrap().unwrap();
    assert_eq!(record.outcome, ChildOutcome::SetupFailed(SetupStage::Detach));
    assert_eq!(harness.ops(), 1);
    assert_no_children();
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn detached_region_stays_mapped_in_parent() {
    require_sandbox!();
    let _guard = fork_lock();

    let page = opcodebox::arena::page_size();
    // SAFETY: anonymous shared mapping owned by this test.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED);

    let mut worker = worker(&OpcodeConfig::default());
    let mut harness = DetachHarness {
        inner: BudgetHarness::new(0),
        region: SharedRegion {
            addr: addr as usize,
            len: page,
        },
    };
    let record = worker
        .run_with_fill(&mut harness, Fill::Repeat(patterns::ILLEGAL))
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, ChildOutcome::Faulted);

    // SAFETY: still our mapping.
    unsafe {
        *(addr as *mut u8) = 0x42;
        assert_eq!(*(addr as *const u8), 0x42);
        libc::munmap(addr, page);
    }
}

#[test]
fn stress_opcode_honours_op_budget() {
    let _guard = fork_lock();

    let config = OpcodeConfig {
        max_ops: 25,
        ..OpcodeConfig::default()
    };
    let mut harness = BudgetHarness::from_config(&config);
    let exit = opcodebox::stress_opcode(&config, &mut harness);

    if probe::probe().is_supported() {
        assert_eq!(exit, StressExit::Success);
        assert_eq!(harness.ops(), 25);
    } else {
        assert_eq!(exit, StressExit::NotImplemented);
        assert_eq!(harness.ops(), 0);
    }
    assert_no_children();
}

#[test]
fn stress_opcode_rejects_bad_instance_index() {
    require_sandbox!();
    let config = OpcodeConfig {
        instance: 4,
        instances: 4,
        ..OpcodeConfig::default()
    };
    let mut harness = BudgetHarness::new(1);
    assert_eq!(opcodebox::stress_opcode(&config, &mut harness), StressExit::Failure);
    assert_eq!(harness.ops(), 0);
}
