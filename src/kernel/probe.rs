//! Host capability probe.
//!
//! Run once in the worker before anything is forked. Every check is a cheap
//! syscall that leaves no lasting state behind.
use super::seccomp;
use crate::arena::page_size;
use serde::Serialize;

pub(crate) const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformSupport {
    /// seccomp filter mode is available and the audit arch is known
    pub seccomp_filter: bool,
    /// an anonymous page may be turned read+execute
    pub executable_pages: bool,
    /// PR_SET_NO_NEW_PRIVS is understood
    pub no_new_privs: bool,
    /// ITIMER_REAL is usable
    pub interval_timer: bool,
}

impl PlatformSupport {
    pub fn is_supported(&self) -> bool {
        self.missing().is_empty()
    }

    /// Names of the facilities this host lacks.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.seccomp_filter {
            missing.push("seccomp-filter");
        }
        if !self.executable_pages {
            missing.push("executable-pages");
        }
        if !self.no_new_privs {
            missing.push("no-new-privs");
        }
        if !self.interval_timer {
            missing.push("interval-timer");
        }
        missing
    }
}

pub fn probe() -> PlatformSupport {
    let support = PlatformSupport {
        seccomp_filter: seccomp::is_seccomp_supported(),
        executable_pages: can_map_executable(),
        no_new_privs: no_new_privs_known(),
        interval_timer: interval_timer_usable(),
    };
    log::debug!("Platform support: {:?}", support);
    support
}

fn can_map_executable() -> bool {
    let len = page_size();
    // SAFETY: anonymous private mapping, unmapped below.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return false;
    }
    // SAFETY: addr..addr+len is the mapping we just created.
    let ok = unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_EXEC) } == 0;
    // SAFETY: same mapping.
    unsafe { libc::munmap(addr, len) };
    ok
}

fn no_new_privs_known() -> bool {
    // SAFETY: read-only prctl.
    unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) >= 0 }
}

fn interval_timer_usable() -> bool {
    let mut current = std::mem::MaybeUninit::<libc::itimerval>::uninit();
    // SAFETY: getitimer only writes into current.
    unsafe { libc::getitimer(libc::ITIMER_REAL, current.as_mut_ptr()) == 0 }
}
