//! Syscall allow-list for code under test.
//!
//! A fixed classic-BPF program: `exit`, `exit_group`, `write` and `seccomp`
//! are allowed, every other syscall (and any syscall made through a foreign
//! ABI) raises SIGSYS. The program is a `static`, so installing it needs no
//! allocation and can happen in a forked child as often as required.

use nix::errno::Errno;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

pub(crate) const BPF_LD: u16 = 0x00;
pub(crate) const BPF_W: u16 = 0x00;
pub(crate) const BPF_ABS: u16 = 0x20;
pub(crate) const BPF_JMP: u16 = 0x05;
pub(crate) const BPF_JEQ: u16 = 0x10;
pub(crate) const BPF_K: u16 = 0x00;
pub(crate) const BPF_RET: u16 = 0x06;

pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;

pub(crate) const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
pub(crate) const PR_GET_SECCOMP: libc::c_int = 21;

/// Offsets into `struct seccomp_data`.
const DATA_NR: u32 = 0;
const DATA_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH: Option<u32> = Some(0xc000_003e);
#[cfg(target_arch = "x86")]
pub const AUDIT_ARCH: Option<u32> = Some(0x4000_0003);
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH: Option<u32> = Some(0xc000_00b7);
#[cfg(target_arch = "arm")]
pub const AUDIT_ARCH: Option<u32> = Some(0x4000_0028);
#[cfg(target_arch = "riscv64")]
pub const AUDIT_ARCH: Option<u32> = Some(0xc000_00f3);
#[cfg(target_arch = "s390x")]
pub const AUDIT_ARCH: Option<u32> = Some(0x8000_0016);
#[cfg(target_arch = "loongarch64")]
pub const AUDIT_ARCH: Option<u32> = Some(0xc000_0102);
#[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
pub const AUDIT_ARCH: Option<u32> = Some(0xc000_0015);
#[cfg(all(target_arch = "powerpc64", target_endian = "big"))]
pub const AUDIT_ARCH: Option<u32> = Some(0x8000_0015);
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64",
    target_arch = "s390x",
    target_arch = "loongarch64",
    target_arch = "powerpc64"
)))]
pub const AUDIT_ARCH: Option<u32> = None;

/// Syscalls generated code may make.
pub const ALLOWED_SYSCALLS: [libc::c_long; 4] = [
    libc::SYS_exit_group,
    libc::SYS_exit,
    libc::SYS_write,
    libc::SYS_seccomp,
];

const fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

const FILTER_LEN: usize = 4 + 2 * ALLOWED_SYSCALLS.len() + 1;

const fn build_filter() -> [SockFilter; FILTER_LEN] {
    let arch = match AUDIT_ARCH {
        Some(arch) => arch,
        None => 0,
    };
    let mut prog = [stmt(BPF_RET | BPF_K, SECCOMP_RET_TRAP); FILTER_LEN];

    prog[0] = stmt(BPF_LD | BPF_W | BPF_ABS, DATA_ARCH);
    prog[1] = jump(BPF_JMP | BPF_JEQ | BPF_K, arch, 1, 0);
    prog[2] = stmt(BPF_RET | BPF_K, SECCOMP_RET_TRAP);
    prog[3] = stmt(BPF_LD | BPF_W | BPF_ABS, DATA_NR);

    let mut i = 0;
    while i < ALLOWED_SYSCALLS.len() {
        prog[4 + 2 * i] = jump(BPF_JMP | BPF_JEQ | BPF_K, ALLOWED_SYSCALLS[i] as u32, 0, 1);
        prog[5 + 2 * i] = stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
        i += 1;
    }
    // Last slot keeps the default trap.
    prog
}

static FILTER: [SockFilter; FILTER_LEN] = build_filter();

/// The compiled allow-list program.
pub fn allow_list_program() -> &'static [SockFilter] {
    &FILTER
}

/// Install the allow-list on the calling thread.
///
/// Requires no_new_privs (or CAP_SYS_ADMIN). Filters stack: every call adds
/// another copy, and once the kernel's per-process instruction budget is
/// exhausted further calls fail with ENOMEM while the installed copies stay
/// in force.
pub fn install_allow_list() -> Result<(), Errno> {
    if AUDIT_ARCH.is_none() {
        return Err(Errno::ENOSYS);
    }
    let prog = SockFprog {
        len: FILTER_LEN as u16,
        filter: FILTER.as_ptr(),
    };

    // SAFETY: prog points at a static, well-formed BPF program that outlives
    // the call; the kernel copies it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_ulong,
            &prog as *const SockFprog,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Whether the kernel has seccomp and we know this architecture's audit tag.
pub fn is_seccomp_supported() -> bool {
    // SAFETY: read-only prctl.
    let rc = unsafe { libc::prctl(PR_GET_SECCOMP, 0, 0, 0, 0) };
    rc >= 0 && AUDIT_ARCH.is_some()
}

/// Current seccomp mode from /proc/self/status (0 none, 1 strict, 2 filter).
pub fn get_seccomp_status() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("Seccomp:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|mode| mode.parse().ok())
}
