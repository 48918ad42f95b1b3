//! Generation/execution loop.
//!
//! IDLE -> SPAWN_CHILD -> (child runs to completion) -> REAP -> count -> IDLE
//!
//! Generations are strictly sequential: the next child is not forked until the
//! previous one has been reaped.

use super::child::{self, ChildPlan, Fill, SetupStage, COMPLETED_STATUS, FAULTED_STATUS};
use super::harness::StressHarness;
use crate::arena::page_size;
use crate::config::types::{Method, OpcodeConfig, OpcodeError, Result, StressExit};
use crate::counter::ExecutionCounter;
use crate::generator::SlotWidth;
use crate::kernel::signal::SignalTally;
use crate::kernel::{probe, text};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fmt;
use std::time::Duration;

const FORK_BACKOFF: Duration = Duration::from_millis(1);

/// How a reaped child ended. Every variant counts as one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Control returned from every slot in the window
    Completed,
    /// A fault handler ended the child
    Faulted,
    /// The watchdog fired
    Watchdog,
    /// Terminated by a signal with no handler in place
    Killed(Signal),
    SetupFailed(SetupStage),
    /// Exit status outside the known set
    Unknown(i32),
    /// Gone before it could be reaped normally
    Lost,
}

impl ChildOutcome {
    pub fn from_exit_status(status: i32) -> Self {
        match status {
            COMPLETED_STATUS => ChildOutcome::Completed,
            FAULTED_STATUS => ChildOutcome::Faulted,
            other => SetupStage::from_exit_status(other)
                .map(ChildOutcome::SetupFailed)
                .unwrap_or(ChildOutcome::Unknown(other)),
        }
    }

    pub fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::SIGALRM => ChildOutcome::Watchdog,
            other => ChildOutcome::Killed(other),
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::from_exit_status(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::from_signal(signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ChildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildOutcome::Completed => write!(f, "completed"),
            ChildOutcome::Faulted => write!(f, "faulted"),
            ChildOutcome::Watchdog => write!(f, "watchdog"),
            ChildOutcome::Killed(sig) => write!(f, "killed by {}", sig),
            ChildOutcome::SetupFailed(stage) => write!(f, "setup failed at {}", stage),
            ChildOutcome::Unknown(code) => write!(f, "exit status {}", code),
            ChildOutcome::Lost => write!(f, "lost"),
        }
    }
}

/// Outcome counts over a worker's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub completed: u64,
    pub faulted: u64,
    pub watchdog: u64,
    pub killed: u64,
    pub setup_failed: u64,
    pub other: u64,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: ChildOutcome) {
        match outcome {
            ChildOutcome::Completed => self.completed += 1,
            ChildOutcome::Faulted => self.faulted += 1,
            ChildOutcome::Watchdog => self.watchdog += 1,
            ChildOutcome::Killed(_) => self.killed += 1,
            ChildOutcome::SetupFailed(_) => self.setup_failed += 1,
            ChildOutcome::Unknown(_) | ChildOutcome::Lost => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.faulted + self.watchdog + self.killed + self.setup_failed + self.other
    }
}

impl fmt::Display for OutcomeTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completed={} faulted={} watchdog={} killed={} setup_failed={} other={}",
            self.completed, self.faulted, self.watchdog, self.killed, self.setup_failed, self.other
        )
    }
}

/// One reaped generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationRecord {
    /// Counter value the child was seeded with
    pub seed: u64,
    pub outcome: ChildOutcome,
}

fn is_transient(errno: Errno) -> bool {
    matches!(errno, Errno::EAGAIN | Errno::EINTR | Errno::ENOMEM)
}

pub struct Worker {
    config: OpcodeConfig,
    counter: ExecutionCounter,
    rng: StdRng,
    page_size: usize,
    text: &'static [u8],
    tally: Option<SignalTally>,
    outcomes: OutcomeTally,
    /// Bit per `SetupStage` already reported at warn level
    warned_stages: u32,
}

impl Worker {
    pub fn new(config: &OpcodeConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Worker drawing child seeds from `rng`.
    pub fn with_rng(config: &OpcodeConfig, rng: StdRng) -> Result<Self> {
        config.validate()?;

        let counter =
            ExecutionCounter::partitioned(SlotWidth::NATIVE, config.instance, config.instances);

        let text: &'static [u8] = if config.method == Method::MutatedText {
            match text::resolve_text_region() {
                // SAFETY: the executable's own text segment stays mapped for the process lifetime.
                Some(region) => unsafe { region.as_bytes() },
                None => {
                    warn!("Text segment not found; mutated text falls back to random");
                    &[]
                }
            }
        } else {
            &[]
        };

        let tally = if config.track_signals {
            let tally = SignalTally::map().map_err(|e| {
                OpcodeError::Memory(format!("mmap of the signal tally failed: {}", e))
            })?;
            tally.arm();
            Some(tally)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            counter,
            rng,
            page_size: page_size(),
            text,
            tally,
            outcomes: OutcomeTally::default(),
            warned_stages: 0,
        })
    }

    pub fn counter(&self) -> ExecutionCounter {
        self.counter
    }

    pub fn outcomes(&self) -> &OutcomeTally {
        &self.outcomes
    }

    pub fn signal_tally(&self) -> Option<&SignalTally> {
        self.tally.as_ref()
    }

    /// One generation with the configured method. `Ok(None)` means the harness
    /// stopped while fork was being retried; nothing was counted.
    pub fn run_generation<H: StressHarness + ?Sized>(
        &mut self,
        harness: &mut H,
    ) -> Result<Option<GenerationRecord>> {
        let fill = Fill::Generate(self.config.method);
        self.run_with_fill(harness, fill)
    }

    pub fn run_with_fill<H: StressHarness + ?Sized>(
        &mut self,
        harness: &mut H,
        fill: Fill,
    ) -> Result<Option<GenerationRecord>> {
        let seed = self.counter.value();
        let detach = harness.shared_regions();
        let plan = ChildPlan {
            fill,
            counter: self.counter,
            rng_seed: self.rng.next_u64(),
            text: self.text,
            page_size: self.page_size,
            watchdog: self.config.watchdog_interval(),
            parent: getpid(),
            detach: &detach,
        };

        let Some(child) = self.spawn(&*harness, &plan)? else {
            return Ok(None);
        };
        let outcome = reap(child);

        harness.op_completed();
        self.outcomes.record(outcome);
        self.counter.advance();
        if let ChildOutcome::SetupFailed(stage) = outcome {
            if self.first_failure_at(stage) {
                warn!(
                    "{}: child {} setup failed at {}; later failures at this stage log at debug",
                    harness.name(),
                    child,
                    stage
                );
            } else {
                debug!("{}: child {} setup failed at {}", harness.name(), child, stage);
            }
        }
        Ok(Some(GenerationRecord { seed, outcome }))
    }

    /// True the first time `stage` is seen failing in this worker.
    fn first_failure_at(&mut self, stage: SetupStage) -> bool {
        let bit = 1u32 << (stage as u32);
        let first = self.warned_stages & bit == 0;
        self.warned_stages |= bit;
        first
    }

    fn spawn<H: StressHarness + ?Sized>(
        &self,
        harness: &H,
        plan: &ChildPlan<'_>,
    ) -> Result<Option<Pid>> {
        let mut attempts = 0u32;
        loop {
            // SAFETY: the child branch runs only the allocation-free executor
            // and leaves through _exit.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => return Ok(Some(child)),
                Ok(ForkResult::Child) => child::run_child(plan),
                Err(errno)
                    if is_transient(errno)
                        && attempts < self.config.fork_retries
                        && harness.keep_running() =>
                {
                    attempts += 1;
                    std::thread::sleep(FORK_BACKOFF);
                }
                Err(_) if !harness.keep_running() => return Ok(None),
                Err(errno) => {
                    return Err(OpcodeError::Process(format!(
                        "fork failed after {} retries: {}",
                        attempts, errno
                    )))
                }
            }
        }
    }

    fn log_summary(&self, name: &str, ops: u64) {
        info!("{}: {} operations ({})", name, ops, self.outcomes);
        if let Some(tally) = &self.tally {
            for (signal, count) in tally.nonzero() {
                debug!("{}: {:<10} {}", name, signal.as_str(), count);
            }
        }
    }
}

/// Wait for `child`, retrying interrupted waits. Any other wait failure gets
/// the child terminated and reaped again.
pub fn reap(child: Pid) -> ChildOutcome {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(outcome) = ChildOutcome::from_wait_status(status) {
                    return outcome;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                debug!("waitpid({}) failed: {}", child, errno);
                return force_reap(child);
            }
        }
    }
}

fn force_reap(child: Pid) -> ChildOutcome {
    let _ = kill(child, Signal::SIGTERM);
    let _ = kill(child, Signal::SIGKILL);
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(outcome) = ChildOutcome::from_wait_status(status) {
                    return outcome;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                warn!("Child {} could not be reaped: {}", child, errno);
                return ChildOutcome::Lost;
            }
        }
    }
}

/// Run one worker to completion against `harness`.
pub fn stress_opcode<H: StressHarness + ?Sized>(config: &OpcodeConfig, harness: &mut H) -> StressExit {
    let support = probe::probe();
    if !support.is_supported() {
        info!(
            "{}: not implemented on this host, missing {}",
            harness.name(),
            support.missing().join(", ")
        );
        return StressExit::NotImplemented;
    }

    let mut worker = match Worker::new(config) {
        Ok(worker) => worker,
        Err(e @ OpcodeError::Config(_)) => {
            error!("{}: {}", harness.name(), e);
            return StressExit::Failure;
        }
        Err(e) => {
            info!("{}: skipping stressor: {}", harness.name(), e);
            return StressExit::NoResource;
        }
    };

    info!(
        "{}: method {}, instance {} of {}, {}-bit slots, counter starts at {:#x}",
        harness.name(),
        config.method,
        config.instance,
        config.instances,
        SlotWidth::NATIVE.bits(),
        worker.counter().value()
    );

    let mut exit = StressExit::Success;
    while harness.keep_running() {
        match worker.run_generation(harness) {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                error!("{}: {}", harness.name(), e);
                exit = StressExit::NoResource;
                break;
            }
        }
    }

    worker.log_summary(harness.name(), harness.ops());
    exit
}
