//! Guarded arena: landing zone for generated code.
//!
//! Layout, fixed for the arena's lifetime (P = [`ARENA_PAGES`]):
//!
//! ```text
//! | guard | fill region (P-2 pages, RW) ................ | guard |
//!         | exec window (1 page) |
//! ```
//!
//! Generators may write the whole fill region; only the leading page is ever
//! made executable. All calls here are raw syscalls with no allocation, so the
//! arena can be built inside a forked child.

use crate::generator::SlotWidth;
use nix::errno::Errno;
use std::ptr::NonNull;

/// Pages in one arena, guard pages included.
pub const ARENA_PAGES: usize = 16;

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub struct GuardedArena {
    base: NonNull<u8>,
    page_size: usize,
}

impl GuardedArena {
    /// Map, zero and guard a fresh arena.
    pub fn acquire(page_size: usize) -> Result<Self, Errno> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Errno::EINVAL);
        }
        let len = page_size * ARENA_PAGES;

        // SAFETY: anonymous private mapping, no fd, kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(Errno::ENOMEM)?;
        let arena = Self { base, page_size };

        // Touch every page so the generation pass never takes a first-use fault.
        // SAFETY: base..base+len is our own fresh RW mapping.
        unsafe { std::ptr::write_bytes(arena.base.as_ptr(), 0, len) };

        arena.protect(0, 1, libc::PROT_NONE)?;
        arena.protect(ARENA_PAGES - 1, 1, libc::PROT_NONE)?;
        Ok(arena)
    }

    fn protect(&self, first_page: usize, pages: usize, prot: libc::c_int) -> Result<(), Errno> {
        // SAFETY: the range lies inside our mapping and is page aligned.
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(first_page * self.page_size) as *mut libc::c_void,
                pages * self.page_size,
                prot,
            )
        };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total mapping length, guard pages included.
    pub fn len(&self) -> usize {
        self.page_size * ARENA_PAGES
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn fill_region_len(&self) -> usize {
        self.page_size * (ARENA_PAGES - 2)
    }

    pub fn fill_region(&self) -> &[u8] {
        // SAFETY: pages 1..P-1 are mapped RW for as long as self lives.
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(self.page_size), self.fill_region_len())
        }
    }

    pub fn fill_region_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.as_ptr().add(self.page_size),
                self.fill_region_len(),
            )
        }
    }

    /// Flip the leading page of the fill region to read+execute and give up
    /// write access to the arena for good.
    ///
    /// The mapping is intentionally never unmapped afterwards: once generated
    /// code has run, further syscalls from this process are not trusted.
    pub fn into_executable(self) -> Result<ExecutableWindow, Errno> {
        self.protect(1, 1, libc::PROT_READ | libc::PROT_EXEC)?;

        // SAFETY: page 1 is inside the mapping.
        let start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.page_size)) };
        let window = ExecutableWindow {
            start,
            len: self.page_size,
        };
        flush_icache(window.start.as_ptr(), window.len)?;

        std::mem::forget(self);
        Ok(window)
    }
}

impl Drop for GuardedArena {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in acquire().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len());
        }
    }
}

/// The one page of the arena that may be executed.
#[derive(Debug)]
pub struct ExecutableWindow {
    start: NonNull<u8>,
    len: usize,
}

impl ExecutableWindow {
    pub fn start(&self) -> *const u8 {
        self.start.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole instruction slots in the window.
    pub fn slot_count(&self, width: SlotWidth) -> usize {
        self.len / width.bytes()
    }

    /// Address of slot `index`.
    pub fn slot(&self, width: SlotWidth, index: usize) -> *const u8 {
        debug_assert!(index < self.slot_count(width));
        self.start.as_ptr().wrapping_add(index * width.bytes()) as *const u8
    }

    /// Read-only view of the window contents.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the window page stays mapped PROT_READ|PROT_EXEC forever.
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.len) }
    }
}

/// Make freshly written code visible to instruction fetch.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) -> Result<(), Errno> {
    use core::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);
    let begin = start as usize;
    let end = begin + len;

    // SAFETY: cache maintenance by VA on a mapped, readable range.
    unsafe {
        let mut addr = begin & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));

        let mut addr = begin & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack));
    }
    Ok(())
}

/// `fence.i` only covers the current hart; the kernel flushes for every hart
/// this process may migrate to.
#[cfg(target_arch = "riscv64")]
fn flush_icache(start: *const u8, len: usize) -> Result<(), Errno> {
    let begin = start as usize;
    // SAFETY: flags 0 asks for a flush on every hart; the range is mapped.
    let rc = unsafe { libc::syscall(libc::SYS_riscv_flush_icache, begin, begin + len, 0usize) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

// x86 and s390x keep instruction fetch coherent with stores. The arm, powerpc
// and mips kernels sync caches when they install an executable pte.
#[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
fn flush_icache(_start: *const u8, _len: usize) -> Result<(), Errno> {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    Ok(())
}
