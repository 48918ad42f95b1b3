//! File descriptor closure for sandboxed children.
//!
//! Prefers close_range(2) and falls back to closing descriptors one by one up
//! to the soft RLIMIT_NOFILE. Neither path allocates, so both are usable
//! between fork() and the child's exit.
use nix::errno::Errno;

/// Upper bound for the fallback loop when the fd limit is huge or unlimited.
const FALLBACK_FD_CEILING: libc::c_int = 1 << 16;

/// Close every descriptor from `first` upwards, standard streams included when `first` is 0.
pub fn close_fds_from(first: libc::c_int) -> Result<(), Errno> {
    if try_close_range(first) {
        return Ok(());
    }
    close_fds_by_loop(first)
}

/// Close every descriptor, stdin/stdout/stderr included.
pub fn close_all_fds() -> Result<(), Errno> {
    close_fds_from(0)
}

fn try_close_range(first: libc::c_int) -> bool {
    // SAFETY: close_range has no memory effects; ENOSYS on kernels before 5.9.
    let result = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        )
    };
    result == 0
}

fn close_fds_by_loop(first: libc::c_int) -> Result<(), Errno> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct.
    let ceiling = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        (limit.rlim_cur.min(FALLBACK_FD_CEILING as libc::rlim_t)) as libc::c_int
    } else {
        FALLBACK_FD_CEILING
    };

    for fd in first..ceiling {
        // SAFETY: closing a descriptor we may or may not own; EBADF is expected.
        if unsafe { libc::close(fd) } != 0 {
            let err = Errno::last();
            if err != Errno::EBADF && err != Errno::EINTR {
                return Err(err);
            }
        }
    }
    Ok(())
}
