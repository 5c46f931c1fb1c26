//! Extent descriptors.
//!
//! An extent is a contiguous page run carved out of a huge page (or
//! spanning several, for huge allocations). Slab extents carry a 512-bit
//! occupancy bitmap plus per-slot side-data flags; large extents carry a
//! used capacity and an optional finalizer directly in the descriptor.
//!
//! Descriptors are 128-byte aligned so a pointer to one packs into the
//! 41 high bits of a page descriptor.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{HeapLink, HeapNode};
use crate::huge_page::HugePageDescriptor;
use crate::size_class;
use crate::{HUGE_PAGE_SIZE, PAGE_SIZE};

/// Destructor recorded by `alloc_appendable` and run by `destroy`:
/// `(base_pointer, used_capacity)`.
pub type Finalizer = unsafe extern "C" fn(*mut u8, usize);

/// Slab slot bitmap width; no size class produces more slots than this.
pub const MAX_SLOTS: usize = 512;
const WORDS: usize = MAX_SLOTS / 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtentKind {
    /// Slab of equal slots of the given small size class.
    Slab(u8),
    /// Whole-page allocation (huge when it spans more than one huge page).
    Large,
}

#[repr(C, align(128))]
pub struct Extent {
    base: *mut u8,
    /// Size in bytes, always a page multiple.
    size: usize,
    /// Backing descriptor. For huge extents this is the tail huge page's
    /// descriptor; the leading huge pages have none.
    hpd: *mut HugePageDescriptor,
    arena_index: u32,
    kind: ExtentKind,

    // Slab state. The occupancy bitmap is only touched under the owning
    // bin's mutex; the side-data flags are set by slot owners without it,
    // so they are atomic words.
    bitmap: [u64; WORDS],
    free_slots: u32,
    appendable: [AtomicU64; WORDS],
    finalizable: [AtomicU64; WORDS],

    // Large state.
    used_capacity: usize,
    has_capacity: bool,
    finalizer: Option<Finalizer>,

    pub(crate) link: HeapLink<Extent>,
    /// Unused-pool link.
    pub(crate) next_free: *mut Extent,
}

impl HeapNode for Extent {
    fn heap_link(&mut self) -> &mut HeapLink<Self> {
        &mut self.link
    }
    // Bin partial heaps are ordered by address.
    fn heap_key(&self) -> u64 {
        self.base as u64
    }
}

impl Extent {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            base: null_mut(),
            size: 0,
            hpd: null_mut(),
            arena_index: 0,
            kind: ExtentKind::Large,
            bitmap: [0; WORDS],
            free_slots: 0,
            appendable: [ZERO; WORDS],
            finalizable: [ZERO; WORDS],
            used_capacity: 0,
            has_capacity: false,
            finalizer: None,
            link: HeapLink::new(),
            next_free: null_mut(),
        }
    }

    pub fn init_slab(
        &mut self,
        base: *mut u8,
        hpd: *mut HugePageDescriptor,
        arena_index: u32,
        class: usize,
    ) {
        let info = size_class::class_info(class);
        self.base = base;
        self.size = info.pages * PAGE_SIZE;
        self.hpd = hpd;
        self.arena_index = arena_index;
        self.kind = ExtentKind::Slab(class as u8);
        self.bitmap = [0; WORDS];
        self.free_slots = info.slots as u32;
        for w in 0..WORDS {
            self.appendable[w].store(0, Ordering::Relaxed);
            self.finalizable[w].store(0, Ordering::Relaxed);
        }
        self.next_free = null_mut();
    }

    pub fn init_large(
        &mut self,
        base: *mut u8,
        size: usize,
        hpd: *mut HugePageDescriptor,
        arena_index: u32,
    ) {
        debug_assert!(size % PAGE_SIZE == 0);
        self.base = base;
        self.size = size;
        self.hpd = hpd;
        self.arena_index = arena_index;
        self.kind = ExtentKind::Large;
        self.used_capacity = 0;
        self.has_capacity = false;
        self.finalizer = None;
        self.next_free = null_mut();
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(size % PAGE_SIZE == 0);
        self.size = size;
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    #[inline]
    pub fn hpd(&self) -> *mut HugePageDescriptor {
        self.hpd
    }

    #[inline]
    pub fn arena_index(&self) -> u32 {
        self.arena_index
    }

    #[inline]
    pub fn kind(&self) -> ExtentKind {
        self.kind
    }

    #[inline]
    pub fn is_slab(&self) -> bool {
        matches!(self.kind, ExtentKind::Slab(_))
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.kind == ExtentKind::Large
    }

    /// Huge extents span more than one huge page and cannot be resized.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.size > HUGE_PAGE_SIZE
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        match self.kind {
            ExtentKind::Slab(c) => c as usize,
            ExtentKind::Large => unreachable!("size_class on a large extent"),
        }
    }

    #[inline]
    pub fn slots(&self) -> usize {
        size_class::class_info(self.size_class()).slots
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free_slots as usize
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        let start = self.base as usize;
        p >= start && p < start + self.size
    }

    /// Set the first free bit and return its slot index.
    pub fn allocate(&mut self) -> Option<usize> {
        debug_assert!(self.is_slab());
        if self.free_slots == 0 {
            return None;
        }
        let slots = self.slots();
        let words = (slots + 63) / 64;
        for w in 0..words {
            let mut word = self.bitmap[w];
            if w == words - 1 && slots % 64 != 0 {
                // Mask slots beyond the class as occupied.
                word |= !0u64 << (slots % 64);
            }
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.bitmap[w] |= 1 << bit;
                self.free_slots -= 1;
                return Some(w * 64 + bit);
            }
        }
        debug_assert!(false, "free_slots out of sync with bitmap");
        None
    }

    /// Clear a slot bit; the bit must be set.
    pub fn free(&mut self, slot: usize) {
        debug_assert!(self.is_slab());
        debug_assert!(slot < self.slots());
        let (w, b) = (slot / 64, slot % 64);
        debug_assert!(self.bitmap[w] >> b & 1 != 0, "slot {} double free", slot);
        self.bitmap[w] &= !(1 << b);
        self.free_slots += 1;
        self.appendable[w].fetch_and(!(1 << b), Ordering::Relaxed);
        self.finalizable[w].fetch_and(!(1 << b), Ordering::Relaxed);
    }

    #[inline]
    pub fn slot_is_allocated(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] >> (slot % 64) & 1 != 0
    }

    #[cfg(test)]
    pub fn bitmap_popcount(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    // Per-slot side-data flags.

    #[inline]
    pub fn slot_appendable(&self, slot: usize) -> bool {
        self.appendable[slot / 64].load(Ordering::Relaxed) >> (slot % 64) & 1 != 0
    }

    #[inline]
    pub fn set_slot_appendable(&self, slot: usize) {
        self.appendable[slot / 64].fetch_or(1 << (slot % 64), Ordering::Relaxed);
    }

    #[inline]
    pub fn slot_finalizable(&self, slot: usize) -> bool {
        self.finalizable[slot / 64].load(Ordering::Relaxed) >> (slot % 64) & 1 != 0
    }

    #[inline]
    pub fn set_slot_finalizable(&self, slot: usize) {
        self.finalizable[slot / 64].fetch_or(1 << (slot % 64), Ordering::Relaxed);
    }

    // Large-extent metadata.

    #[inline]
    pub fn used_capacity(&self) -> usize {
        debug_assert!(self.is_large());
        self.used_capacity
    }

    #[inline]
    pub fn set_used_capacity(&mut self, used: usize) {
        debug_assert!(self.is_large());
        debug_assert!(used <= self.size);
        self.used_capacity = used;
        self.has_capacity = true;
    }

    /// Whether `set_used_capacity` was ever called (plain large
    /// allocations answer capacity queries with zero).
    #[inline]
    pub fn has_capacity(&self) -> bool {
        debug_assert!(self.is_large());
        self.has_capacity
    }

    #[inline]
    pub fn finalizer(&self) -> Option<Finalizer> {
        debug_assert!(self.is_large());
        self.finalizer
    }

    #[inline]
    pub fn set_finalizer(&mut self, finalizer: Option<Finalizer>) {
        debug_assert!(self.is_large());
        self.finalizer = finalizer;
    }
}
