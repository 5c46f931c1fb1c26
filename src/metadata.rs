//! Appendable and finalizable allocation metadata.
//!
//! An appendable allocation records how many of its bytes are meaningful
//! (the *used capacity*) so a runtime can grow a slice in place; a
//! finalizable one carries a destructor run by `destroy`. Neither costs a
//! per-object header: large extents keep both in the descriptor, slab
//! slots keep a side-data flag in the extent and pack the free byte count
//! (and the finalizer pointer) into the tail of the slot itself.
//!
//! Slot tail layout, from the end: `[.. data | free count | finalizer]`,
//! where the free count is one byte for slots under 256 bytes and two
//! bytes from there up, and the finalizer word is present only when the
//! finalizable flag is set.

use core::mem::size_of;

use crate::arena::Arena;
use crate::extent::Finalizer;
use crate::pagemap::{PageDescriptor, PAGE_MAP};
use crate::platform;
use crate::size_class;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Slots below this carry no free-space side-data, so appendable
/// requests bump at least to the 16-byte class.
pub const MIN_APPENDABLE_SIZE: usize = 16;

const FINALIZER_BYTES: usize = size_of::<usize>();

/// Bytes of free-count encoding at the slot tail.
#[inline]
pub fn length_bytes(slot_size: usize) -> usize {
    if slot_size < 256 {
        1
    } else {
        2
    }
}

/// Smallest class whose slot holds `size` user bytes plus the tail
/// metadata. `None` when even the largest small class cannot (the
/// allocation is served as a large extent instead).
pub fn appendable_class(size: usize, finalizable: bool) -> Option<usize> {
    let fin = if finalizable { FINALIZER_BYTES } else { 0 };
    let need = (size + 1 + fin).max(MIN_APPENDABLE_SIZE);
    let class = size_class::size_to_class(need)?;
    if size_class::class_to_size(class) < 256 {
        return Some(class);
    }
    // Crossing the 256-byte boundary costs a second length byte; re-bump.
    let need = (size + 2 + fin).max(MIN_APPENDABLE_SIZE);
    size_class::size_to_class(need)
}

struct SlotRef {
    extent: *mut crate::extent::Extent,
    slot: usize,
    base: *mut u8,
    size: usize,
}

unsafe fn resolve_slot(pd: PageDescriptor, ptr: *const u8) -> SlotRef {
    debug_assert!(pd.is_slab());
    let extent = pd.extent();
    let class = pd.size_class();
    let info = size_class::class_info(class);
    let offset = (ptr as usize & (PAGE_SIZE - 1)) + (pd.page_index() << PAGE_SHIFT);
    let slot = size_class::slot_index(offset, class);
    SlotRef {
        extent,
        slot,
        base: unsafe { (*extent).base().add(slot * info.size) },
        size: info.size,
    }
}

unsafe fn write_free_count(base: *mut u8, slot_size: usize, used: usize, fin_bytes: usize) {
    let free = slot_size - used;
    let lb = length_bytes(slot_size);
    unsafe {
        let at = base.add(slot_size - fin_bytes - lb);
        if lb == 1 {
            *at = free as u8;
        } else {
            (at as *mut u16).write_unaligned(free as u16);
        }
    }
}

unsafe fn read_used(base: *const u8, slot_size: usize, fin_bytes: usize) -> usize {
    let lb = length_bytes(slot_size);
    let free = unsafe {
        let at = base.add(slot_size - fin_bytes - lb);
        if lb == 1 {
            *at as usize
        } else {
            (at as *const u16).read_unaligned() as usize
        }
    };
    slot_size - free
}

unsafe fn write_finalizer(base: *mut u8, slot_size: usize, finalizer: Finalizer) {
    unsafe {
        let at = base.add(slot_size - FINALIZER_BYTES) as *mut usize;
        at.write_unaligned(finalizer as usize);
    }
}

unsafe fn read_finalizer(base: *const u8, slot_size: usize) -> Finalizer {
    unsafe {
        let at = base.add(slot_size - FINALIZER_BYTES) as *const usize;
        core::mem::transmute::<usize, Finalizer>(at.read_unaligned())
    }
}

/// Allocate `size` bytes with recorded used capacity and an optional
/// finalizer, bumping the size class until the metadata fits.
pub(crate) fn alloc_appendable_in(
    arena: &Arena,
    size: usize,
    zero: bool,
    finalizer: Option<Finalizer>,
) -> *mut u8 {
    debug_assert!(size > 0);
    if let Some(class) = appendable_class(size, finalizer.is_some()) {
        let ptr = arena.alloc_small_class(class);
        if ptr.is_null() {
            return ptr;
        }
        if zero {
            unsafe { platform::zero(ptr, size) };
        }
        let pd = PAGE_MAP.lookup(ptr as usize);
        unsafe {
            let r = resolve_slot(pd, ptr);
            debug_assert_eq!(r.base, ptr);
            (*r.extent).set_slot_appendable(r.slot);
            let fin_bytes = match finalizer {
                Some(f) => {
                    (*r.extent).set_slot_finalizable(r.slot);
                    write_finalizer(r.base, r.size, f);
                    FINALIZER_BYTES
                }
                None => 0,
            };
            write_free_count(r.base, r.size, size, fin_bytes);
        }
        ptr
    } else {
        let ptr = arena.alloc_large(size, zero);
        if ptr.is_null() {
            return ptr;
        }
        let pd = PAGE_MAP.lookup(ptr as usize);
        unsafe {
            let extent = pd.extent();
            (*extent).set_used_capacity(size);
            (*extent).set_finalizer(finalizer);
        }
        ptr
    }
}

/// Used capacity of an appendable slab slot (realloc helper).
pub(crate) unsafe fn slot_used(pd: PageDescriptor, ptr: *const u8) -> usize {
    unsafe {
        let r = resolve_slot(pd, ptr);
        debug_assert!((*r.extent).slot_appendable(r.slot));
        let fin_bytes = if (*r.extent).slot_finalizable(r.slot) {
            FINALIZER_BYTES
        } else {
            0
        };
        read_used(r.base, r.size, fin_bytes)
    }
}

/// Finalizer recorded in a finalizable slab slot (realloc helper).
pub(crate) unsafe fn slot_finalizer(pd: PageDescriptor, ptr: *const u8) -> Finalizer {
    unsafe {
        let r = resolve_slot(pd, ptr);
        debug_assert!((*r.extent).slot_finalizable(r.slot));
        read_finalizer(r.base, r.size)
    }
}

/// Overwrite the used capacity of an appendable slab slot. The caller
/// has verified the new value leaves room for the tail metadata.
pub(crate) unsafe fn rewrite_slot_used(pd: PageDescriptor, ptr: *const u8, used: usize) {
    unsafe {
        let r = resolve_slot(pd, ptr);
        debug_assert!((*r.extent).slot_appendable(r.slot));
        let fin_bytes = if (*r.extent).slot_finalizable(r.slot) {
            FINALIZER_BYTES
        } else {
            0
        };
        debug_assert!(used + length_bytes(r.size) + fin_bytes <= r.size);
        write_free_count(r.base, r.size, used, fin_bytes);
    }
}

/// `(used capacity, slice begin offset, physical size)` of the slot or
/// extent holding `ptr`, or `None` when no capacity was ever recorded.
unsafe fn slice_state(pd: PageDescriptor, ptr: *const u8) -> Option<(usize, usize, usize)> {
    unsafe {
        if pd.is_slab() {
            let r = resolve_slot(pd, ptr);
            if !(*r.extent).slot_appendable(r.slot) {
                return None;
            }
            let fin_bytes = if (*r.extent).slot_finalizable(r.slot) {
                FINALIZER_BYTES
            } else {
                0
            };
            let used = read_used(r.base, r.size, fin_bytes);
            Some((used, ptr as usize - r.base as usize, r.size))
        } else {
            let extent = pd.extent();
            if !(*extent).has_capacity() {
                return None;
            }
            Some((
                (*extent).used_capacity(),
                ptr as usize - (*extent).base() as usize,
                (*extent).size(),
            ))
        }
    }
}

/// Bytes addressable from the slice start to the physical end of the
/// slot, or 0 unless the slice end matches the recorded used capacity
/// (last slice wins).
pub(crate) unsafe fn capacity(pd: PageDescriptor, ptr: *const u8, len: usize) -> usize {
    match unsafe { slice_state(pd, ptr) } {
        Some((used, begin, total)) if used != 0 && begin + len == used => total - begin,
        _ => 0,
    }
}

/// Raise the used capacity by `delta` if the slice passes the capacity
/// predicate and there is room, growing large extents in place when the
/// neighboring pages are free. A failed extend changes nothing.
pub(crate) unsafe fn extend_in(
    arena: &Arena,
    pd: PageDescriptor,
    ptr: *const u8,
    len: usize,
    delta: usize,
) -> bool {
    unsafe {
        if pd.is_slab() {
            let r = resolve_slot(pd, ptr);
            if !(*r.extent).slot_appendable(r.slot) {
                return false;
            }
            let fin_bytes = if (*r.extent).slot_finalizable(r.slot) {
                FINALIZER_BYTES
            } else {
                0
            };
            let used = read_used(r.base, r.size, fin_bytes);
            let begin = ptr as usize - r.base as usize;
            if used == 0 || begin + len != used {
                return false;
            }
            let new_used = used + delta;
            if new_used + length_bytes(r.size) + fin_bytes > r.size {
                return false;
            }
            write_free_count(r.base, r.size, new_used, fin_bytes);
            true
        } else {
            let extent = pd.extent();
            if !(*extent).has_capacity() {
                return false;
            }
            let used = (*extent).used_capacity();
            let begin = ptr as usize - (*extent).base() as usize;
            if used == 0 || begin + len != used {
                return false;
            }
            let new_used = used + delta;
            if new_used > (*extent).size() && !arena.resize_large(extent, new_used) {
                return false;
            }
            (*extent).set_used_capacity(new_used);
            true
        }
    }
}

/// Run the finalizer, if any, then free. `ptr` must be the allocation
/// base.
pub(crate) unsafe fn destroy_in(arena: &Arena, pd: PageDescriptor, ptr: *mut u8) {
    unsafe {
        if pd.is_slab() {
            let r = resolve_slot(pd, ptr);
            debug_assert_eq!(r.base, ptr);
            if (*r.extent).slot_finalizable(r.slot) {
                let finalizer = read_finalizer(r.base, r.size);
                let used = read_used(r.base, r.size, FINALIZER_BYTES);
                finalizer(r.base, used);
            }
        } else {
            let extent = pd.extent();
            if let Some(finalizer) = (*extent).finalizer() {
                finalizer((*extent).base(), (*extent).used_capacity());
            }
        }
        arena.free(pd, ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::class_to_size;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn arena(index: u32) -> &'static Arena {
        Box::leak(Box::new(Arena::new(index)))
    }

    fn pd_of(ptr: *const u8) -> PageDescriptor {
        let pd = PAGE_MAP.lookup(ptr as usize);
        assert!(!pd.is_empty());
        pd
    }

    #[test]
    fn test_appendable_class_bumping() {
        // One length byte below the 256-byte boundary.
        assert_eq!(class_to_size(appendable_class(5, false).unwrap()), 16);
        assert_eq!(class_to_size(appendable_class(15, false).unwrap()), 16);
        assert_eq!(class_to_size(appendable_class(16, false).unwrap()), 24);
        assert_eq!(class_to_size(appendable_class(222, false).unwrap()), 224);
        assert_eq!(class_to_size(appendable_class(223, false).unwrap()), 224);
        // Crossing 256 switches to a two-byte length and re-bumps.
        assert_eq!(class_to_size(appendable_class(224, false).unwrap()), 256);
        assert_eq!(class_to_size(appendable_class(253, false).unwrap()), 256);
        assert_eq!(class_to_size(appendable_class(254, false).unwrap()), 256);
        assert_eq!(class_to_size(appendable_class(255, false).unwrap()), 320);
        // The finalizer word counts toward the bump.
        assert_eq!(class_to_size(appendable_class(45, true).unwrap()), 64);
        assert_eq!(class_to_size(appendable_class(55, true).unwrap()), 64);
        assert_eq!(class_to_size(appendable_class(56, true).unwrap()), 80);
        // Too big for any small class: served large.
        assert_eq!(appendable_class(4096, false), None);
    }

    #[test]
    fn test_small_capacity_numbers() {
        let _serial = crate::test_util::serial();
        let a = arena(21);
        let p = alloc_appendable_in(a, 5, false, None);
        assert!(!p.is_null());
        let pd = pd_of(p);
        assert_eq!(pd.size_class(), 1); // 16-byte slot

        unsafe {
            assert_eq!(capacity(pd, p, 5), 16);
            assert_eq!(capacity(pd, p, 6), 0);
            assert_eq!(capacity(pd, p, 4), 0);
            assert_eq!(capacity(pd, p.add(5), 0), 11);
            assert_eq!(capacity(pd, p.add(2), 3), 14);
        }
        a.free(pd, p);
    }

    #[test]
    fn test_capacity_law() {
        let _serial = crate::test_util::serial();
        let a = arena(22);
        for n in [1usize, 7, 16, 100, 900, 3000] {
            let p = alloc_appendable_in(a, n, false, None);
            assert!(!p.is_null());
            let pd = pd_of(p);
            let slot = class_to_size(pd.size_class());
            unsafe {
                assert!(capacity(pd, p, n) >= n);
                assert_eq!(capacity(pd, p, n), slot);
                assert_eq!(capacity(pd, p, n + 1), 0);
                if n > 1 {
                    assert_eq!(capacity(pd, p, n - 1), 0);
                }
            }
            a.free(pd, p);
        }
    }

    #[test]
    fn test_plain_allocations_report_zero_capacity() {
        let _serial = crate::test_util::serial();
        let a = arena(23);
        let small = a.alloc_small(40);
        let large = a.alloc_large(8 * PAGE_SIZE, false);
        unsafe {
            assert_eq!(capacity(pd_of(small), small, 40), 0);
            assert_eq!(capacity(pd_of(large), large, 8 * PAGE_SIZE), 0);
        }
        a.free(pd_of(small), small);
        a.free(pd_of(large), large);
    }

    #[test]
    fn test_extend_small_monotonic() {
        let _serial = crate::test_util::serial();
        let a = arena(24);
        let p = alloc_appendable_in(a, 5, false, None);
        let pd = pd_of(p);
        unsafe {
            // 16-byte slot, one length byte: room up to used == 15.
            assert!(extend_in(a, pd, p, 5, 8));
            assert_eq!(capacity(pd, p, 13), 16);
            assert_eq!(capacity(pd, p, 5), 0);
            assert!(extend_in(a, pd, p, 13, 2));
            assert_eq!(capacity(pd, p, 15), 16);
            // No room for the length byte beyond 15; nothing changes.
            assert!(!extend_in(a, pd, p, 15, 1));
            assert_eq!(capacity(pd, p, 15), 16);
            // Stale slice fails the predicate.
            assert!(!extend_in(a, pd, p, 5, 1));
        }
        a.free(pd, p);
    }

    #[test]
    fn test_extend_large_grows_into_freed_neighbor() {
        let _serial = crate::test_util::serial();
        let a = arena(25);
        let p = alloc_appendable_in(a, 16384, false, None);
        assert!(!p.is_null());
        let pd = pd_of(p);
        assert!(!pd.is_slab());

        // An adjacent allocation blocks in-place growth.
        let deadzone = a.alloc_large(PAGE_SIZE, false);
        assert_eq!(deadzone, unsafe { p.add(16384) });

        unsafe {
            assert_eq!(capacity(pd, p, 16384), 16384);
            assert!(!extend_in(a, pd, p, 16384, 1));
            assert_eq!(capacity(pd, p, 16384), 16384);

            a.free(pd_of(deadzone), deadzone);

            assert!(extend_in(a, pd, p, 16384, 1));
            assert_eq!(capacity(pd, p, 16385), 16384 + PAGE_SIZE);
        }
        a.free(pd, p);
    }

    static DTOR_PTR: AtomicUsize = AtomicUsize::new(0);
    static DTOR_SIZE: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn record_dtor(ptr: *mut u8, used: usize) {
        DTOR_PTR.store(ptr as usize, Ordering::SeqCst);
        DTOR_SIZE.store(used, Ordering::SeqCst);
    }

    #[test]
    fn test_small_finalizer_runs_on_destroy() {
        let _serial = crate::test_util::serial();
        let a = arena(26);
        let s = alloc_appendable_in(a, 45, false, Some(record_dtor));
        assert!(!s.is_null());
        let pd = pd_of(s);
        assert_eq!(pd.size_class(), 6); // 45 + length byte + finalizer word

        DTOR_PTR.store(0, Ordering::SeqCst);
        unsafe { destroy_in(a, pd, s) };
        assert_eq!(DTOR_PTR.load(Ordering::SeqCst), s as usize);
        assert_eq!(DTOR_SIZE.load(Ordering::SeqCst), 45);
        // The slot was freed: the slab vanished with its last slot.
        assert!(PAGE_MAP.lookup(s as usize).is_empty());
    }

    #[test]
    fn test_large_finalizer_runs_on_destroy() {
        let _serial = crate::test_util::serial();
        let a = arena(27);
        let size = 5 * PAGE_SIZE + 9;
        let s = alloc_appendable_in(a, size, false, Some(record_dtor));
        let pd = pd_of(s);

        DTOR_PTR.store(0, Ordering::SeqCst);
        unsafe { destroy_in(a, pd, s) };
        assert_eq!(DTOR_PTR.load(Ordering::SeqCst), s as usize);
        assert_eq!(DTOR_SIZE.load(Ordering::SeqCst), size);
        assert!(PAGE_MAP.lookup(s as usize).is_empty());
    }

    #[test]
    fn test_destroy_without_finalizer_just_frees() {
        let _serial = crate::test_util::serial();
        let a = arena(28);
        let p = alloc_appendable_in(a, 100, false, None);
        let pd = pd_of(p);
        unsafe { destroy_in(a, pd, p) };
        assert!(PAGE_MAP.lookup(p as usize).is_empty());
    }
}
