//! Bins: per-size-class slab management inside an arena.
//!
//! Each bin owns a `current` slab with at least one free slot and a
//! partial-slab heap ordered by address. The bin mutex is never held
//! across `arena.alloc_slab`: refilling drops the lock, allocates, and
//! re-checks, feeding the fresh slab back to the arena if another thread
//! installed a usable one in the meantime. That keeps OS-facing work out
//! of the bin's critical section and still never hands out a full slab.

use core::ptr::null_mut;

use crate::arena::Arena;
use crate::extent::Extent;
use crate::heap::PairingHeap;
use crate::pagemap::PageDescriptor;
use crate::size_class;
use crate::sync::SpinMutex;
use crate::{PAGE_SHIFT, PAGE_SIZE};

struct BinState {
    /// Slab served first; non-null implies at least one free slot.
    current: *mut Extent,
    /// Other partial slabs, lowest address first. Never holds full or
    /// empty slabs, and never slabs of single-slot classes.
    partial: PairingHeap<Extent>,
}

unsafe impl Send for BinState {}

pub struct Bin {
    state: SpinMutex<BinState>,
}

impl Bin {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(BinState {
                current: null_mut(),
                partial: PairingHeap::new(),
            }),
        }
    }

    /// Allocate one slot of `class`. Returns null on OOM.
    pub fn alloc(&self, arena: &Arena, class: usize) -> *mut u8 {
        let item_size = size_class::class_to_size(class);
        let mut st = self.state.lock();
        loop {
            let cur = st.current;
            if !cur.is_null() {
                unsafe {
                    if let Some(slot) = (*cur).allocate() {
                        if (*cur).free_slots() == 0 {
                            // Full slabs are unattached until a free
                            // brings them back.
                            st.current = null_mut();
                        }
                        return (*cur).base().add(slot * item_size);
                    }
                    debug_assert!(false, "current slab had no free slot");
                    st.current = null_mut();
                }
            }

            let popped = unsafe { st.partial.pop() };
            if !popped.is_null() {
                st.current = popped;
                continue;
            }

            // Refill from the arena with the bin unlocked; slab
            // allocation takes the arena lock and may go to the OS.
            drop(st);
            let fresh = arena.alloc_slab(class);
            st = self.state.lock();

            if fresh.is_null() {
                // Frees may have repopulated the bin while unlocked.
                if st.current.is_null() && st.partial.is_empty() {
                    return null_mut();
                }
                continue;
            }
            let cur = st.current;
            if !cur.is_null() && unsafe { (*cur).free_slots() } > 0 {
                // Lost the refill race; hand the fresh slab back without
                // holding the bin lock.
                drop(st);
                arena.free_slab(fresh);
                st = self.state.lock();
                continue;
            }
            st.current = fresh;
        }
    }

    /// Free the slot holding `ptr` (any address within it). Returns true
    /// when the slab became fully empty, in which case the caller owns
    /// releasing its pages.
    pub fn free(&self, ptr: *mut u8, pd: PageDescriptor) -> bool {
        let extent = pd.extent();
        let class = pd.size_class();
        let offset = (ptr as usize & (PAGE_SIZE - 1)) + (pd.page_index() << PAGE_SHIFT);
        let slot = size_class::slot_index(offset, class);

        let mut st = self.state.lock();
        unsafe {
            let was_full = (*extent).free_slots() == 0;
            (*extent).free(slot);

            if (*extent).free_slots() == (*extent).slots() {
                if st.current == extent {
                    st.current = null_mut();
                } else if (*extent).slots() > 1 && !was_full {
                    st.partial.remove(extent);
                }
                return true;
            }

            if was_full && st.current != extent && (*extent).slots() > 1 {
                st.partial.push(extent);
            }
        }
        false
    }
}
