//! All operations are idempotent and async-signal-safe.
use super::{
    LAST_CAP, LINUX_CAPABILITY_VERSION_3, PR_CAPBSET_DROP, PR_CAP_AMBIENT,
    PR_CAP_AMBIENT_CLEAR_ALL, PR_SET_DUMPABLE, PR_SET_NO_NEW_PRIVS,
};
use nix::errno::Errno;

/// Drop every capability and lock out regaining them through execve.
pub fn drop_privileges() -> Result<(), Errno> {
    drop_all_capabilities()?;
    set_no_new_privs()
}

/// Drop all capabilities from all sets (bounding, ambient, effective, permitted, inheritable).
///
/// Bounding and ambient drops are best-effort (they need CAP_SETPCAP or a
/// recent kernel); zeroing the process sets must succeed.
pub fn drop_all_capabilities() -> Result<(), Errno> {
    drop_bounding_capabilities();
    drop_ambient_capabilities();
    drop_process_capabilities()
}

fn drop_bounding_capabilities() {
    for cap in 0..=LAST_CAP {
        // SAFETY: prctl(PR_CAPBSET_DROP) with any cap number is safe; invalid caps are ignored.
        let _ = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
    }
}

fn drop_ambient_capabilities() {
    // SAFETY: returns EINVAL on kernels without ambient capabilities, which is fine.
    let _ = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong, 0, 0, 0) };
}

/// Zero all capability sets via raw capset(2) syscall.
fn drop_process_capabilities() -> Result<(), Errno> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };

    // Version 3 requires two data entries: caps 0-31 and caps 32-63.
    let data = [
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
    ];

    // SAFETY: capset(2) with valid header (version 3, pid 0 = current) and
    // two zeroed data entries. Properly initialized structs, valid pointers.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
/// Also the precondition for installing a seccomp filter without CAP_SYS_ADMIN.
pub fn set_no_new_privs() -> Result<(), Errno> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// No core files: clear the dumpable flag and cap RLIMIT_CORE at zero.
pub fn disable_core_dumps() -> Result<(), Errno> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: lowering a soft/hard limit is always permitted.
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) } != 0 {
        return Err(Errno::last());
    }
    // SAFETY: prctl(PR_SET_DUMPABLE, 0) has no memory effects.
    if unsafe { libc::prctl(PR_SET_DUMPABLE, 0 as libc::c_ulong, 0, 0, 0) } != 0 {
        return Err(Errno::last());
    }
    Ok(())
}
