//! Read-only capability and process-flag queries.
use super::{PR_GET_DUMPABLE, PR_GET_NO_NEW_PRIVS};
use crate::config::types::{OpcodeError, Result};
use std::fs;

/// Whether PR_SET_NO_NEW_PRIVS is set for the calling thread.
pub fn check_no_new_privs() -> Result<bool> {
    // SAFETY: read-only prctl.
    let rc = unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if rc < 0 {
        return Err(OpcodeError::Privilege(format!(
            "PR_GET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(rc == 1)
}

/// Whether the process may produce core dumps.
pub fn check_dumpable() -> Result<bool> {
    // SAFETY: read-only prctl.
    let rc = unsafe { libc::prctl(PR_GET_DUMPABLE, 0, 0, 0, 0) };
    if rc < 0 {
        return Err(OpcodeError::Privilege(format!(
            "PR_GET_DUMPABLE failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(rc != 0)
}

/// Cap* lines from /proc/self/status.
pub fn get_capability_status() -> Result<String> {
    let status = fs::read_to_string("/proc/self/status")?;
    Ok(status
        .lines()
        .filter(|line| line.starts_with("Cap"))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Names of the process capability sets that still hold any capability.
pub fn nonzero_capability_sets() -> Result<Vec<String>> {
    let status = get_capability_status()?;
    Ok(status
        .lines()
        .filter(|line| {
            line.starts_with("CapInh:") || line.starts_with("CapPrm:") || line.starts_with("CapEff:")
        })
        .filter(|line| line.split_whitespace().nth(1).unwrap_or("") != "0000000000000000")
        .map(|line| line.split(':').next().unwrap_or("").to_string())
        .collect())
}
