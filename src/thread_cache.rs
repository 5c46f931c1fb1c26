//! Front-end: routes each call to an arena and exposes the runtime API.
//!
//! The front-end is stateless: it picks an arena from
//! `(cpu_id << 1) | contains_pointers` for fresh allocations and resolves
//! frees, reallocs, and capacity operations to the owning arena through
//! the page map. Pointer-carrying allocations live in the odd arenas so a
//! tracing collector only scans those.

use core::ptr::{self, null_mut};

use crate::arena::{Arena, ARENA_COUNT};
use crate::extent::Finalizer;
use crate::metadata;
use crate::pagemap::{PageDescriptor, PAGE_MAP};
use crate::platform;
use crate::size_class;
use crate::{MAX_ALLOCATION_SIZE, PAGE_SHIFT, PAGE_SIZE};

const CPU_SLOTS: usize = ARENA_COUNT / 2;

static ARENAS: [Arena; ARENA_COUNT] = [
    Arena::new(0),
    Arena::new(1),
    Arena::new(2),
    Arena::new(3),
    Arena::new(4),
    Arena::new(5),
    Arena::new(6),
    Arena::new(7),
    Arena::new(8),
    Arena::new(9),
    Arena::new(10),
    Arena::new(11),
    Arena::new(12),
    Arena::new(13),
    Arena::new(14),
    Arena::new(15),
    Arena::new(16),
    Arena::new(17),
    Arena::new(18),
    Arena::new(19),
    Arena::new(20),
    Arena::new(21),
    Arena::new(22),
    Arena::new(23),
    Arena::new(24),
    Arena::new(25),
    Arena::new(26),
    Arena::new(27),
    Arena::new(28),
    Arena::new(29),
    Arena::new(30),
    Arena::new(31),
];

/// Arena for fresh allocations on this thread.
#[inline]
fn arena_for(contains_pointers: bool) -> &'static Arena {
    let cpu = platform::cpu_id() & (CPU_SLOTS - 1);
    &ARENAS[cpu << 1 | contains_pointers as usize]
}

/// Owning arena of an already-mapped allocation.
#[inline]
fn owner_of(pd: PageDescriptor) -> &'static Arena {
    &ARENAS[pd.arena_index()]
}

/// Page-descriptor lookup for `addr`; the primitive the collector pass
/// marks reachable extents with.
#[inline]
pub fn lookup(addr: usize) -> PageDescriptor {
    PAGE_MAP.lookup(addr)
}

/// Allocate `size` bytes. Returns null for zero size, for sizes above
/// `MAX_ALLOCATION_SIZE`, and on OOM. The memory is zeroed iff `zero`.
pub fn alloc(size: usize, contains_pointers: bool, zero: bool) -> *mut u8 {
    if size == 0 || size > MAX_ALLOCATION_SIZE {
        return null_mut();
    }
    let arena = arena_for(contains_pointers);
    if size_class::is_small(size) {
        let ptr = arena.alloc_small(size);
        if !ptr.is_null() && zero {
            unsafe { platform::zero(ptr, size) };
        }
        ptr
    } else {
        arena.alloc_large(size, zero)
    }
}

/// Like [`alloc`], but records `used_capacity = size` and the optional
/// finalizer, choosing a size class with room for the metadata.
pub fn alloc_appendable(
    size: usize,
    contains_pointers: bool,
    zero: bool,
    finalizer: Option<Finalizer>,
) -> *mut u8 {
    if size == 0 || size > MAX_ALLOCATION_SIZE {
        return null_mut();
    }
    metadata::alloc_appendable_in(arena_for(contains_pointers), size, zero, finalizer)
}

/// Free an allocation. Null is a no-op; a pointer the allocator does not
/// know is undefined behavior (asserted in debug builds).
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let pd = PAGE_MAP.lookup(ptr as usize);
    debug_assert!(!pd.is_empty(), "free of unknown pointer {:p}", ptr);
    if pd.is_empty() {
        return;
    }
    owner_of(pd).free(pd, ptr);
}

/// Run the finalizer, if any, then free. `ptr` must be the exact base
/// returned by the allocation call.
pub fn destroy(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let pd = PAGE_MAP.lookup(ptr as usize);
    debug_assert!(!pd.is_empty(), "destroy of unknown pointer {:p}", ptr);
    if pd.is_empty() {
        return;
    }
    unsafe { metadata::destroy_in(owner_of(pd), pd, ptr) };
}

/// Bytes addressable from `ptr` to the physical end of its slot, or 0
/// when `[ptr, ptr + len)` is not the last recorded slice or the region
/// is unknown to the allocator.
pub fn get_capacity(ptr: *const u8, len: usize) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let pd = PAGE_MAP.lookup(ptr as usize);
    if pd.is_empty() {
        return 0;
    }
    unsafe { metadata::capacity(pd, ptr, len) }
}

/// Extend the used capacity of the slice `[ptr, ptr + len)` by `delta`
/// bytes. Succeeds only if the slice passes the [`get_capacity`]
/// predicate and there is room, possibly via an in-place large grow.
pub fn extend(ptr: *const u8, len: usize, delta: usize) -> bool {
    if ptr.is_null() {
        return false;
    }
    let pd = PAGE_MAP.lookup(ptr as usize);
    if pd.is_empty() {
        return false;
    }
    unsafe { metadata::extend_in(owner_of(pd), pd, ptr, len, delta) }
}

/// Reallocate to `size` bytes, preserving `min(size, used capacity)`
/// bytes of content. Stays in place when the size class (small) or page
/// count (large) allows, or when the extent can grow into free
/// neighboring pages.
pub fn realloc(ptr: *mut u8, size: usize, contains_pointers: bool) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size, contains_pointers, false);
    }
    if size == 0 {
        free(ptr);
        return null_mut();
    }
    if size > MAX_ALLOCATION_SIZE {
        return null_mut();
    }
    let pd = PAGE_MAP.lookup(ptr as usize);
    debug_assert!(!pd.is_empty(), "realloc of unknown pointer {:p}", ptr);
    if pd.is_empty() {
        return null_mut();
    }

    if pd.is_slab() {
        unsafe { realloc_small(pd, ptr, size, contains_pointers) }
    } else {
        unsafe { realloc_large(pd, ptr, size, contains_pointers) }
    }
}

unsafe fn realloc_small(
    pd: PageDescriptor,
    ptr: *mut u8,
    size: usize,
    contains_pointers: bool,
) -> *mut u8 {
    let extent = pd.extent();
    let class = pd.size_class();
    let slot_size = size_class::class_to_size(class);
    let offset = (ptr as usize & (PAGE_SIZE - 1)) + (pd.page_index() << PAGE_SHIFT);
    let slot = size_class::slot_index(offset, class);

    unsafe {
        let appendable = (*extent).slot_appendable(slot);
        let finalizer = if (*extent).slot_finalizable(slot) {
            Some(metadata::slot_finalizer(pd, ptr))
        } else {
            None
        };
        let old_used = if appendable {
            metadata::slot_used(pd, ptr)
        } else {
            slot_size
        };

        // Same class: the slot is reused in place.
        let target = if appendable {
            metadata::appendable_class(size, finalizer.is_some())
        } else {
            size_class::size_to_class(size)
        };
        if target == Some(class) {
            if appendable {
                metadata::rewrite_slot_used(pd, ptr, size);
            }
            return ptr;
        }

        let new_ptr = if appendable {
            alloc_appendable(size, contains_pointers, false, finalizer)
        } else {
            alloc(size, contains_pointers, false)
        };
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_used.min(size));
            free(ptr);
        }
        new_ptr
    }
}

unsafe fn realloc_large(
    pd: PageDescriptor,
    ptr: *mut u8,
    size: usize,
    contains_pointers: bool,
) -> *mut u8 {
    let extent = pd.extent();
    let arena = owner_of(pd);
    unsafe {
        let has_capacity = (*extent).has_capacity();
        let finalizer = (*extent).finalizer();
        let old_used = if has_capacity {
            (*extent).used_capacity()
        } else {
            (*extent).size()
        };

        // Large to large: in place when the page count already matches
        // (huge extents included), shrinks, or can grow into free
        // neighboring pages.
        let new_pages = (size + PAGE_SIZE - 1) >> PAGE_SHIFT;
        if size > size_class::MAX_SMALL_SIZE
            && (new_pages == (*extent).pages() || arena.resize_large(extent, size))
        {
            if has_capacity {
                (*extent).set_used_capacity(size);
            }
            return ptr;
        }

        let new_ptr = if has_capacity {
            alloc_appendable(size, contains_pointers, false, finalizer)
        } else {
            alloc(size, contains_pointers, false)
        };
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_used.min(size));
            free(ptr);
        }
        new_ptr
    }
}
