//! Linux capability management for privilege minimization.
//!
//! The drop path is called from a freshly forked child, so it performs raw
//! syscalls only: no allocation, no logging. Query helpers are for the parent
//! and for tests.

mod drop;
mod query;

pub use drop::{disable_core_dumps, drop_all_capabilities, drop_privileges, set_no_new_privs};
pub use query::{check_dumpable, check_no_new_privs, get_capability_status, nonzero_capability_sets};

/// Highest capability number any supported kernel knows about.
pub(crate) const LAST_CAP: u32 = 40;

pub(crate) const PR_SET_DUMPABLE: libc::c_int = 4;
pub(crate) const PR_GET_DUMPABLE: libc::c_int = 3;
pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
