//! OS facade: anonymous mappings and CPU identification.
//!
//! Everything below the region provider goes through here so the rest of
//! the crate never touches `libc` directly.

use core::ptr::{self, null_mut};

use crate::HUGE_PAGE_SIZE;

/// Map `size` bytes of zeroed anonymous memory. Returns null on failure.
pub fn map_anonymous(size: usize) -> *mut u8 {
    let p = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        null_mut()
    } else {
        p as *mut u8
    }
}

pub fn unmap(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr.cast(), size) };
}

/// Map `size` bytes aligned to the huge-page boundary. Over-maps by one
/// huge page and trims the slack so no address space is wasted.
pub fn map_huge_aligned(size: usize) -> *mut u8 {
    debug_assert!(size % HUGE_PAGE_SIZE == 0);

    let raw = map_anonymous(size + HUGE_PAGE_SIZE);
    if raw.is_null() {
        return null_mut();
    }

    let addr = raw as usize;
    let aligned = align_up(addr, HUGE_PAGE_SIZE);
    let lead = aligned - addr;
    let tail = HUGE_PAGE_SIZE - lead;

    if lead > 0 {
        unmap(raw, lead);
    }
    if tail > 0 {
        unmap((aligned + size) as *mut u8, tail);
    }

    aligned as *mut u8
}

/// Rounds `x` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Rounds `x` down to the previous multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// Current CPU id, used to pick an arena.
#[cfg(target_os = "linux")]
#[inline]
pub fn cpu_id() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/// Fallback for platforms without a cheap CPU-id syscall: spread threads
/// across arenas by a per-thread counter instead.
#[cfg(not(target_os = "linux"))]
#[inline]
pub fn cpu_id() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};
    thread_local! {
        static SLOT: usize = {
            static CTR: AtomicUsize = AtomicUsize::new(0);
            CTR.fetch_add(1, Ordering::Relaxed)
        };
    }
    SLOT.with(|&s| s)
}

/// Zero `len` bytes at `ptr`.
///
/// # Safety
/// `ptr` must be valid for `len` writable bytes.
#[inline]
pub unsafe fn zero(ptr: *mut u8, len: usize) {
    unsafe { ptr::write_bytes(ptr, 0, len) };
}
