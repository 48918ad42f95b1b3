//! Sandboxed child executor.
//!
//! Runs between `fork()` and `_exit()` in a copy of a parent that may have had
//! other threads, so nothing here allocates, takes a lock or logs. Diagnostics
//! leave the process only through its exit status.
//!
//! The setup sequence is a type-state chain; each step consumes the previous
//! state, so code can only be executed once every protection is in place:
//!
//! FreshChild -> Detached -> Hardened -> Contained -> Loaded -> Executable ->
//! Armed -> Silenced -> execute()

use crate::arena::{ExecutableWindow, GuardedArena};
use crate::config::types::Method;
use crate::counter::ExecutionCounter;
use crate::exec::harness::SharedRegion;
use crate::generator::{GenerationContext, SlotWidth};
use crate::kernel::{capabilities, seccomp, signal, timer};
use crate::utils::fd_closure;
use nix::errno::Errno;
use nix::unistd::Pid;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::time::Duration;

/// Exit status when control came back from every slot.
pub const COMPLETED_STATUS: i32 = 0;

/// Exit status of a child whose generated code trapped.
pub const FAULTED_STATUS: i32 = signal::FAULT_EXIT_STATUS;

const STAGE_STATUS_BASE: i32 = 10;

/// Setup step that failed, each with its own exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetupStage {
    Detach,
    CoreDumps,
    Privileges,
    FaultHandlers,
    Arena,
    Protection,
    ParentDeath,
    Watchdog,
    Streams,
    SyscallFilter,
}

impl SetupStage {
    pub const ALL: [SetupStage; 10] = [
        SetupStage::Detach,
        SetupStage::CoreDumps,
        SetupStage::Privileges,
        SetupStage::FaultHandlers,
        SetupStage::Arena,
        SetupStage::Protection,
        SetupStage::ParentDeath,
        SetupStage::Watchdog,
        SetupStage::Streams,
        SetupStage::SyscallFilter,
    ];

    pub fn exit_status(self) -> i32 {
        STAGE_STATUS_BASE + self as i32
    }

    pub fn from_exit_status(status: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.exit_status() == status)
    }

    pub fn name(self) -> &'static str {
        match self {
            SetupStage::Detach => "detach",
            SetupStage::CoreDumps => "core-dumps",
            SetupStage::Privileges => "privileges",
            SetupStage::FaultHandlers => "fault-handlers",
            SetupStage::Arena => "arena",
            SetupStage::Protection => "protection",
            SetupStage::ParentDeath => "parent-death",
            SetupStage::Watchdog => "watchdog",
            SetupStage::Streams => "streams",
            SetupStage::SyscallFilter => "syscall-filter",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupError {
    pub stage: SetupStage,
    pub errno: Errno,
}

impl SetupError {
    pub fn exit_status(&self) -> i32 {
        self.stage.exit_status()
    }
}

fn at(stage: SetupStage) -> impl FnOnce(Errno) -> SetupError {
    move |errno| SetupError { stage, errno }
}

/// What goes into the fill region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    Generate(Method),
    /// A fixed byte pattern tiled over the region; plants known instructions.
    Repeat(&'static [u8]),
}

/// Everything the child needs, prepared by the parent before fork().
#[derive(Debug)]
pub struct ChildPlan<'a> {
    pub fill: Fill,
    pub counter: ExecutionCounter,
    /// Seed for the child's own random stream
    pub rng_seed: u64,
    pub text: &'a [u8],
    pub page_size: usize,
    pub watchdog: Duration,
    pub parent: Pid,
    /// Parent mappings the child must drop before running anything
    pub detach: &'a [SharedRegion],
}

/// Type-state marker: just forked.
pub struct FreshChild;
/// Type-state marker: harness memory unmapped.
pub struct Detached;
/// Type-state marker: undumpable, unprivileged.
pub struct Hardened;
/// Type-state marker: fault handlers installed.
pub struct Contained;
/// Arena filled, still writable.
pub struct Loaded {
    arena: GuardedArena,
}
/// Window flipped to read+execute.
pub struct Executable {
    window: ExecutableWindow,
}
/// Parent-death and watchdog armed.
pub struct Armed {
    window: ExecutableWindow,
}
/// Standard streams closed; ready to run.
pub struct Silenced {
    window: ExecutableWindow,
}

pub struct Sandbox<'a, S> {
    plan: &'a ChildPlan<'a>,
    counter: ExecutionCounter,
    state: S,
}

impl<'a, S> Sandbox<'a, S> {
    fn next<T>(self, state: T) -> Sandbox<'a, T> {
        Sandbox {
            plan: self.plan,
            counter: self.counter,
            state,
        }
    }

    pub fn counter(&self) -> ExecutionCounter {
        self.counter
    }
}

impl<'a> Sandbox<'a, FreshChild> {
    pub fn new(plan: &'a ChildPlan<'a>) -> Self {
        Self {
            plan,
            counter: plan.counter,
            state: FreshChild,
        }
    }

    /// Step 1: unmap harness-shared memory so stray stores cannot reach it.
    pub fn detach(self) -> Result<Sandbox<'a, Detached>, SetupError> {
        for region in self.plan.detach {
            // SAFETY: the region was mapped by the parent and is inherited;
            // unmapping it only affects this process.
            let rc = unsafe { libc::munmap(region.addr as *mut libc::c_void, region.len) };
            if rc != 0 {
                return Err(at(SetupStage::Detach)(Errno::last()));
            }
        }
        Ok(self.next(Detached))
    }
}

impl<'a> Sandbox<'a, Detached> {
    /// Steps 2-3: no core dumps, no capabilities, no regaining them.
    pub fn harden(self) -> Result<Sandbox<'a, Hardened>, SetupError> {
        capabilities::disable_core_dumps().map_err(at(SetupStage::CoreDumps))?;
        capabilities::drop_privileges().map_err(at(SetupStage::Privileges))?;
        Ok(self.next(Hardened))
    }
}

impl<'a> Sandbox<'a, Hardened> {
    /// Step 4.
    pub fn contain_faults(self) -> Result<Sandbox<'a, Contained>, SetupError> {
        signal::install_fault_handlers().map_err(at(SetupStage::FaultHandlers))?;
        Ok(self.next(Contained))
    }
}

impl<'a> Sandbox<'a, Contained> {
    /// Step 5: map a private arena and run the generator over its fill region.
    pub fn load(self) -> Result<Sandbox<'a, Loaded>, SetupError> {
        let plan = self.plan;
        let mut arena = GuardedArena::acquire(plan.page_size).map_err(at(SetupStage::Arena))?;

        match plan.fill {
            Fill::Generate(method) => {
                if method == Method::Incrementing {
                    set_process_name(self.counter);
                }
                let ctx = GenerationContext::new(self.counter.width(), self.counter.value())
                    .with_text(plan.text);
                let mut rng = StdRng::seed_from_u64(plan.rng_seed);
                method.fill(arena.fill_region_mut(), &ctx, &mut rng);
            }
            Fill::Repeat(pattern) => tile(arena.fill_region_mut(), pattern),
        }

        Ok(self.next(Loaded { arena }))
    }
}

impl<'a> Sandbox<'a, Loaded> {
    /// Step 6.
    pub fn make_executable(self) -> Result<Sandbox<'a, Executable>, SetupError> {
        let Sandbox { plan, counter, state } = self;
        let window = state.arena.into_executable().map_err(at(SetupStage::Protection))?;
        Ok(Sandbox {
            plan,
            counter,
            state: Executable { window },
        })
    }
}

impl<'a> Sandbox<'a, Executable> {
    /// Steps 7-8: die with the parent, and die on the first watchdog expiry.
    pub fn arm(self) -> Result<Sandbox<'a, Armed>, SetupError> {
        timer::arm_parent_death(self.plan.parent).map_err(at(SetupStage::ParentDeath))?;
        timer::arm_watchdog(self.plan.watchdog).map_err(at(SetupStage::Watchdog))?;
        let Sandbox { plan, counter, state } = self;
        Ok(Sandbox {
            plan,
            counter,
            state: Armed { window: state.window },
        })
    }
}

impl<'a> Sandbox<'a, Armed> {
    /// Step 9: close every descriptor, standard streams included.
    pub fn silence(self) -> Result<Sandbox<'a, Silenced>, SetupError> {
        fd_closure::close_all_fds().map_err(at(SetupStage::Streams))?;
        let Sandbox { plan, counter, state } = self;
        Ok(Sandbox {
            plan,
            counter,
            state: Silenced { window: state.window },
        })
    }
}

impl<'a> Sandbox<'a, Silenced> {
    /// Step 10: call every slot of the window in order, re-arming the syscall
    /// filter before each call. Exits with [`COMPLETED_STATUS`] if control
    /// keeps coming back.
    pub fn execute(self) -> ! {
        let Sandbox {
            mut counter, state, ..
        } = self;
        let window = state.window;
        let width = counter.width();

        for index in 0..window.slot_count(width) {
            // Filters stack. Once the kernel's instruction budget is spent the
            // install fails and the copies already in place keep applying.
            if let Err(errno) = seccomp::install_allow_list() {
                if index == 0 {
                    exit_now(at(SetupStage::SyscallFilter)(errno).exit_status());
                }
            }
            std::hint::black_box(counter.advance());

            // SAFETY: the slot lies in a mapped read+execute page. Its bytes
            // are arbitrary; any fault ends this process, never the parent.
            unsafe {
                let code: extern "C" fn() = std::mem::transmute(window.slot(width, index));
                code();
            }
        }
        exit_now(COMPLETED_STATUS)
    }
}

/// Immediate exit: no destructors, no atexit handlers, no stdio flush.
pub fn exit_now(status: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(status) }
}

fn prepare<'a>(plan: &'a ChildPlan<'a>) -> Result<Sandbox<'a, Silenced>, SetupError> {
    Sandbox::new(plan)
        .detach()?
        .harden()?
        .contain_faults()?
        .load()?
        .make_executable()?
        .arm()?
        .silence()
}

/// Entry point for the forked child. Never returns.
pub fn run_child(plan: &ChildPlan<'_>) -> ! {
    match prepare(plan) {
        Ok(sandbox) => sandbox.execute(),
        Err(err) => exit_now(err.exit_status()),
    }
}

fn tile(region: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() {
        region.fill(0);
        return;
    }
    for chunk in region.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}

const NAME_PREFIX: &[u8] = b"opcode-0x";

/// `opcode-0x<zero-padded hex>` plus NUL into `buf`, returning the used part.
pub fn format_process_name(buf: &mut [u8; 32], value: u64, width: SlotWidth) -> &[u8] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digits = width.hex_digits();
    let mut pos = NAME_PREFIX.len();
    buf[..pos].copy_from_slice(NAME_PREFIX);
    for i in (0..digits).rev() {
        buf[pos] = HEX[((value >> (i * 4)) & 0xf) as usize];
        pos += 1;
    }
    buf[pos] = 0;
    &buf[..=pos]
}

fn set_process_name(counter: ExecutionCounter) {
    let mut buf = [0u8; 32];
    let name = format_process_name(&mut buf, counter.value(), counter.width());
    // SAFETY: name is NUL terminated; the kernel copies at most 16 bytes.
    unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_statuses_are_distinct_and_round_trip() {
        for stage in SetupStage::ALL {
            let status = stage.exit_status();
            assert_ne!(status, COMPLETED_STATUS);
            assert_ne!(status, FAULTED_STATUS);
            assert_eq!(SetupStage::from_exit_status(status), Some(stage));
        }
        assert_eq!(SetupStage::from_exit_status(COMPLETED_STATUS), None);
        assert_eq!(SetupStage::from_exit_status(FAULTED_STATUS), None);
    }

    #[test]
    fn setup_error_carries_stage_status() {
        let err = at(SetupStage::Watchdog)(Errno::EINVAL);
        assert_eq!(err.exit_status(), SetupStage::Watchdog.exit_status());
        assert_eq!(err.errno, Errno::EINVAL);
    }

    #[test]
    fn process_name_is_zero_padded_hex() {
        let mut buf = [0u8; 32];
        assert_eq!(format_process_name(&mut buf, 0x6, SlotWidth::W8), b"opcode-0x06\0");
        assert_eq!(
            format_process_name(&mut buf, 0xbeef, SlotWidth::W32),
            b"opcode-0x0000beef\0"
        );
        assert_eq!(
            format_process_name(&mut buf, u64::MAX, SlotWidth::W64),
            b"opcode-0xffffffffffffffff\0"
        );
    }

    #[test]
    fn tile_repeats_and_truncates_pattern() {
        let mut region = [0u8; 5];
        tile(&mut region, &[0xeb, 0xfe]);
        assert_eq!(region, [0xeb, 0xfe, 0xeb, 0xfe, 0xeb]);

        let mut region = [0xffu8; 3];
        tile(&mut region, &[]);
        assert_eq!(region, [0, 0, 0]);
    }

    #[test]
    fn stage_display_uses_kebab_names() {
        assert_eq!(SetupStage::SyscallFilter.to_string(), "syscall-filter");
    }
}
