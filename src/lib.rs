//! hpmalloc: a huge-page-backed, per-CPU-arena memory allocator.
//!
//! Memory is organized in three tiers:
//! - Huge pages (2 MiB) obtained from a region provider, tracked by
//!   per-huge-page descriptors with best-fit free-range heaps
//! - Extents: page runs carved from huge pages, either size-class slabs
//!   or large (whole-page) objects
//! - Slab slots within an extent, tracked by an occupancy bitmap
//!
//! Every mapped page is registered in a two-level radix trie (the page
//! map), so any user address resolves to its owning extent in O(1) with a
//! lock-free read. Allocations are routed to one of 32 arenas by CPU id,
//! so calls on distinct arenas never contend.
//!
//! Besides the usual malloc surface, allocations can be *appendable*
//! (they record a used capacity so a runtime can grow a slice in place)
//! and *finalizable* (they carry a destructor invoked by `destroy`),
//! with no per-object header: the bookkeeping lives in the extent
//! descriptor or in the tail bytes of the slot.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: hpmalloc::HpMalloc = hpmalloc::HpMalloc;
//! ```

pub mod size_class;
pub mod platform;
pub mod region;
pub mod sync;
pub mod heap;
pub mod huge_page;
pub mod extent;
pub mod pagemap;
pub mod arena;
pub mod bins;
pub mod metadata;
pub mod thread_cache;
pub mod allocator;
#[cfg(feature = "ffi")]
pub mod ffi;

/// Page size used by the allocator (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Pages per huge page; `HUGE_PAGE_SIZE` is the region-provider granule.
pub const PAGES_IN_HUGE_PAGE: usize = 512;
pub const HUGE_PAGE_SIZE: usize = PAGES_IN_HUGE_PAGE * PAGE_SIZE; // 2 MiB

/// Effective user address space covered by the page map.
pub const ADDRESS_BITS: usize = 48;

/// Extent descriptors are aligned so their pointer fits in 41 bits of a
/// packed page descriptor (48-bit address, 7 low bits free).
pub const EXTENT_ALIGN: usize = 128;

/// Largest extent the 12-bit page-index field can describe.
pub const MAX_EXTENT_PAGES: usize = 4096;

/// Requests above this are refused outright.
pub const MAX_ALLOCATION_SIZE: usize = MAX_EXTENT_PAGES * PAGE_SIZE; // 16 MiB


// Re-export the allocator and the runtime API at the crate root.
pub use allocator::HpMalloc;
pub use extent::Finalizer;
pub use thread_cache::{
    alloc, alloc_appendable, destroy, extend, free, get_capacity, lookup, realloc,
};
