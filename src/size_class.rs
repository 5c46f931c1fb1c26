//! Small size-class table and division-free slot index math.
//!
//! Small allocations live in slabs: extents of 1..=7 pages split into
//! equal slots. Page counts are chosen so slots divide the slab exactly
//! (no tail waste), and every class precomputes a magic multiplier so
//! `offset / size` on the free path is a multiply and a shift instead of
//! a hardware division.

use crate::PAGE_SIZE;

/// Information about a single small size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Slot size in bytes; all allocations in this class round up to it.
    pub size: usize,
    /// Pages per slab for this class.
    pub pages: usize,
    /// Slots per slab (`pages * PAGE_SIZE / size`, exact).
    pub slots: usize,
    /// Magic multiplier: `slot = (offset * mul) >> MAGIC_SHIFT`.
    pub magic_mul: u64,
}

/// Shift paired with `magic_mul`. With `mul = 2^42 / size + 1` the formula
/// is exact for every offset below 2^28, far beyond any slab.
pub const MAGIC_SHIFT: u32 = 42;

pub const NUM_SMALL_CLASSES: usize = 31;

/// Largest slab-resident size; anything above is a whole-page extent.
pub const MAX_SMALL_SIZE: usize = 4096;

/// `(size, pages)` seed for the table. Page counts make the slot count
/// exact: 8-byte steps to 48, then four steps per doubling up to 4096.
const SMALL_SEED: [(usize, usize); NUM_SMALL_CLASSES] = [
    (8, 1),
    (16, 1),
    (24, 3),
    (32, 1),
    (40, 5),
    (48, 3),
    (64, 1),
    (80, 5),
    (96, 3),
    (112, 7),
    (128, 1),
    (160, 5),
    (192, 3),
    (224, 7),
    (256, 1),
    (320, 5),
    (384, 3),
    (448, 7),
    (512, 1),
    (640, 5),
    (768, 3),
    (896, 7),
    (1024, 1),
    (1280, 5),
    (1536, 3),
    (1792, 7),
    (2048, 1),
    (2560, 5),
    (3072, 3),
    (3584, 7),
    (4096, 1),
];

pub static SMALL_CLASSES: [SizeClassInfo; NUM_SMALL_CLASSES] = {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        slots: 0,
        magic_mul: 0,
    }; NUM_SMALL_CLASSES];
    let mut i = 0;
    while i < NUM_SMALL_CLASSES {
        let (size, pages) = SMALL_SEED[i];
        table[i] = SizeClassInfo {
            size,
            pages,
            slots: pages * PAGE_SIZE / size,
            magic_mul: (1u64 << MAGIC_SHIFT) / size as u64 + 1,
        };
        i += 1;
    }
    table
};

/// O(1) size -> class lookup in 8-byte buckets, index `(size + 7) / 8`.
const LOOKUP_LEN: usize = MAX_SMALL_SIZE / 8 + 1;

static SMALL_LOOKUP: [u8; LOOKUP_LEN] = {
    let mut table = [0u8; LOOKUP_LEN];
    let mut i = 1;
    while i < LOOKUP_LEN {
        let size = i * 8;
        let mut cls = 0;
        while SMALL_CLASSES[cls].size < size {
            cls += 1;
        }
        table[i] = cls as u8;
        i += 1;
    }
    table
};

/// Whether `size` is served from a slab.
#[inline]
pub fn is_small(size: usize) -> bool {
    size != 0 && size <= MAX_SMALL_SIZE
}

/// Map an allocation size to its class index. `None` for zero or for
/// sizes above [`MAX_SMALL_SIZE`].
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if !is_small(size) {
        return None;
    }
    Some(SMALL_LOOKUP[(size + 7) / 8] as usize)
}

#[inline]
pub fn class_to_size(class: usize) -> usize {
    SMALL_CLASSES[class].size
}

#[inline]
pub fn class_info(class: usize) -> &'static SizeClassInfo {
    &SMALL_CLASSES[class]
}

/// Slot index for a byte offset within a slab of the given class.
/// Exact (floor division) for every legal offset; callers must have
/// established that the offset lies inside the slab.
#[inline(always)]
pub fn slot_index(offset: usize, class: usize) -> usize {
    ((offset as u64 * SMALL_CLASSES[class].magic_mul) >> MAGIC_SHIFT) as usize
}
