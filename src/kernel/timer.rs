//! Child lifetime limits: the interval watchdog and parent-death delivery.
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{getppid, Pid};
use std::time::Duration;

fn to_timeval(interval: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    }
}

/// Arm ITIMER_REAL so SIGALRM arrives every `interval`, the first after one
/// `interval`. With SIGALRM at its default disposition the first expiry ends
/// the process.
pub fn arm_watchdog(interval: Duration) -> Result<(), Errno> {
    if interval.is_zero() {
        return Err(Errno::EINVAL);
    }
    let timer = libc::itimerval {
        it_interval: to_timeval(interval),
        it_value: to_timeval(interval),
    };
    // SAFETY: valid itimerval; old value not requested.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Stop the watchdog.
pub fn disarm_watchdog() -> Result<(), Errno> {
    arm_zero()
}

fn arm_zero() -> Result<(), Errno> {
    let zero = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let timer = libc::itimerval {
        it_interval: zero,
        it_value: zero,
    };
    // SAFETY: valid itimerval.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Time left before the next watchdog expiry, None when disarmed.
pub fn watchdog_remaining() -> Result<Option<Duration>, Errno> {
    let mut current = std::mem::MaybeUninit::<libc::itimerval>::uninit();
    // SAFETY: getitimer fills the struct on success.
    let rc = unsafe { libc::getitimer(libc::ITIMER_REAL, current.as_mut_ptr()) };
    if rc != 0 {
        return Err(Errno::last());
    }
    // SAFETY: initialised by the successful call above.
    let value = unsafe { current.assume_init() }.it_value;
    let remaining = Duration::new(value.tv_sec as u64, (value.tv_usec as u32) * 1000);
    Ok((!remaining.is_zero()).then_some(remaining))
}

/// Have the kernel SIGKILL us when the parent exits.
///
/// Closes the race where the parent died between fork() and prctl() by
/// checking that `expected_parent` is still our parent afterwards.
pub fn arm_parent_death(expected_parent: Pid) -> Result<(), Errno> {
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
    if getppid() != expected_parent {
        return Err(Errno::ESRCH);
    }
    Ok(())
}
