//! Region provider: contiguous huge-page-aligned regions on demand.
//!
//! Released regions are kept in an address-ordered free list threaded
//! through the regions themselves, coalescing with both neighbors on
//! insert. Acquisition is first-fit with a split of the remainder, so a
//! freed region is handed back at the same address it had before; only
//! when the cache cannot satisfy a request do we go to the OS.

use core::ptr::null_mut;

use crate::platform;
use crate::sync::SpinMutex;
use crate::HUGE_PAGE_SIZE;

/// Cached regions beyond this many huge pages are returned to the OS
/// instead of being kept resident (512 MiB).
const CACHE_LIMIT_HUGE_PAGES: usize = 256;

/// Free-list node written into the first bytes of a cached region.
#[repr(C)]
struct FreeRegion {
    next: *mut FreeRegion,
    huge_pages: usize,
}

struct RegionCache {
    head: *mut FreeRegion,
    cached_huge_pages: usize,
}

unsafe impl Send for RegionCache {}

/// Process-wide provider of huge-page-aligned regions.
pub struct RegionProvider {
    cache: SpinMutex<RegionCache>,
}

pub static REGION_PROVIDER: RegionProvider = RegionProvider::new();

impl RegionProvider {
    pub const fn new() -> Self {
        Self {
            cache: SpinMutex::new(RegionCache {
                head: null_mut(),
                cached_huge_pages: 0,
            }),
        }
    }

    /// Hand out `huge_pages` contiguous huge pages, aligned to the
    /// huge-page boundary. Returns null on OOM.
    pub fn acquire(&self, huge_pages: usize) -> *mut u8 {
        debug_assert!(huge_pages > 0);

        {
            let mut cache = self.cache.lock();
            // First fit over the address-ordered list.
            let mut prev: *mut FreeRegion = null_mut();
            let mut cur = cache.head;
            while !cur.is_null() {
                let len = unsafe { (*cur).huge_pages };
                if len >= huge_pages {
                    let next = unsafe { (*cur).next };
                    let rest = len - huge_pages;
                    let replacement = if rest > 0 {
                        // Keep the tail cached; hand out the head so the
                        // returned base matches the original address.
                        let tail =
                            (cur as usize + huge_pages * HUGE_PAGE_SIZE) as *mut FreeRegion;
                        unsafe {
                            (*tail).next = next;
                            (*tail).huge_pages = rest;
                        }
                        tail
                    } else {
                        next
                    };
                    if prev.is_null() {
                        cache.head = replacement;
                    } else {
                        unsafe { (*prev).next = replacement };
                    }
                    cache.cached_huge_pages -= huge_pages;
                    return cur as *mut u8;
                }
                prev = cur;
                cur = unsafe { (*cur).next };
            }
        }

        platform::map_huge_aligned(huge_pages * HUGE_PAGE_SIZE)
    }

    /// Return a region of `huge_pages` huge pages starting at `base`.
    ///
    /// # Safety
    /// `base` must be a huge-page-aligned address previously acquired from
    /// this provider and no longer referenced by anyone.
    pub unsafe fn release(&self, base: *mut u8, huge_pages: usize) {
        debug_assert!(base as usize % HUGE_PAGE_SIZE == 0);
        debug_assert!(huge_pages > 0);

        let mut cache = self.cache.lock();
        if cache.cached_huge_pages + huge_pages > CACHE_LIMIT_HUGE_PAGES {
            platform::unmap(base, huge_pages * HUGE_PAGE_SIZE);
            return;
        }

        // Insert sorted by address.
        let node = base as *mut FreeRegion;
        unsafe {
            (*node).huge_pages = huge_pages;
        }
        let mut prev: *mut FreeRegion = null_mut();
        let mut cur = cache.head;
        while !cur.is_null() && (cur as usize) < (node as usize) {
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        unsafe {
            (*node).next = cur;
            if prev.is_null() {
                cache.head = node;
            } else {
                (*prev).next = node;
            }

            // Coalesce with the successor.
            if !cur.is_null()
                && node as usize + (*node).huge_pages * HUGE_PAGE_SIZE == cur as usize
            {
                (*node).huge_pages += (*cur).huge_pages;
                (*node).next = (*cur).next;
            }
            // Coalesce with the predecessor.
            if !prev.is_null()
                && prev as usize + (*prev).huge_pages * HUGE_PAGE_SIZE == node as usize
            {
                (*prev).huge_pages += (*node).huge_pages;
                (*prev).next = (*node).next;
            }
        }
        cache.cached_huge_pages += huge_pages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let provider = RegionProvider::new();
        let a = provider.acquire(1);
        assert!(!a.is_null());
        assert_eq!(a as usize % HUGE_PAGE_SIZE, 0);
        unsafe { provider.release(a, 1) };
        let b = provider.acquire(1);
        assert_eq!(a, b);
        unsafe { provider.release(b, 1) };
    }

    #[test]
    fn test_adjacent_releases_coalesce() {
        let provider = RegionProvider::new();
        let base = provider.acquire(4);
        assert!(!base.is_null());
        // Release in two halves; a following acquire of the full span must
        // come back at the original base.
        unsafe {
            provider.release(base.add(2 * HUGE_PAGE_SIZE), 2);
            provider.release(base, 2);
        }
        let again = provider.acquire(4);
        assert_eq!(again, base);
        unsafe { provider.release(again, 4) };
    }

    #[test]
    fn test_first_fit_splits() {
        let provider = RegionProvider::new();
        let base = provider.acquire(3);
        assert!(!base.is_null());
        unsafe { provider.release(base, 3) };
        let one = provider.acquire(1);
        assert_eq!(one, base);
        let two = provider.acquire(2);
        assert_eq!(two as usize, base as usize + HUGE_PAGE_SIZE);
        unsafe {
            provider.release(one, 1);
            provider.release(two, 2);
        }
    }
}
