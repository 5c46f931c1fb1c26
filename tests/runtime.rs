//! End-to-end tests of the runtime API: alloc/free/realloc, appendable
//! capacity, extend, finalizers, and the zero law.

use core::sync::atomic::{AtomicUsize, Ordering};
use hpmalloc::{
    alloc, alloc_appendable, destroy, extend, free, get_capacity, lookup, realloc,
    MAX_ALLOCATION_SIZE, PAGE_SIZE,
};

#[test]
fn test_degenerate_sizes() {
    assert!(alloc(0, false, false).is_null());
    assert!(alloc(MAX_ALLOCATION_SIZE + 1, false, false).is_null());
    assert!(alloc_appendable(0, false, false, None).is_null());
    free(core::ptr::null_mut()); // no-op
}

#[test]
fn test_alloc_is_known_to_the_map() {
    let p = alloc(200, false, false);
    assert!(!p.is_null());
    let pd = lookup(p as usize);
    assert!(!pd.is_empty());
    assert!(pd.is_slab());
    free(p);
}

#[test]
fn test_pointerness_picks_distinct_arenas() {
    let data = alloc(64, false, false);
    let ptrs = alloc(64, true, false);
    assert_ne!(
        lookup(data as usize).arena_index() & 1,
        lookup(ptrs as usize).arena_index() & 1
    );
    free(data);
    free(ptrs);
}

#[test]
fn test_zero_law() {
    // Dirty a block, free it, then demand zeroed memory of the same
    // class; every user byte must be zero no matter what was recycled.
    for &n in &[24usize, 64, 1000, 4096, 6 * PAGE_SIZE] {
        let p = alloc(n, false, false);
        assert!(!p.is_null());
        unsafe { core::ptr::write_bytes(p, 0xDD, n) };
        free(p);

        let q = alloc(n, false, true);
        assert!(!q.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(q, n) };
        assert!(bytes.iter().all(|&b| b == 0), "dirty byte for size {}", n);
        free(q);
    }
}

#[test]
fn test_capacity_round_trip() {
    let p = alloc_appendable(5, false, false, None);
    assert!(!p.is_null());
    assert_eq!(get_capacity(p, 5), 16);
    assert_eq!(get_capacity(p, 6), 0);
    assert_eq!(get_capacity(unsafe { p.add(5) }, 0), 11);
    free(p);
}

#[test]
fn test_capacity_unknown_region_is_zero() {
    let local = 0u64;
    assert_eq!(get_capacity(&local as *const u64 as *const u8, 8), 0);
    assert_eq!(get_capacity(core::ptr::null(), 0), 0);
}

#[test]
fn test_extend_tracks_used_capacity() {
    let p = alloc_appendable(10, false, false, None);
    let slot = get_capacity(p, 10);
    assert!(slot >= 10);

    assert!(extend(p, 10, 5));
    assert_eq!(get_capacity(p, 15), slot);
    assert_eq!(get_capacity(p, 10), 0);

    // A failing extend leaves the capacity untouched.
    assert!(!extend(p, 15, slot));
    assert_eq!(get_capacity(p, 15), slot);
    free(p);
}

#[test]
fn test_realloc_moves_content() {
    let p = alloc(40, false, false);
    unsafe {
        for i in 0..40 {
            *p.add(i) = i as u8;
        }
    }
    // Same class: realloc within the 40-byte class stays put.
    let q = realloc(p, 33, false);
    assert_eq!(q, p);

    // Different class: content moves along.
    let r = realloc(q, 5000, false);
    assert!(!r.is_null());
    unsafe {
        for i in 0..33 {
            assert_eq!(*r.add(i), i as u8);
        }
    }
    free(r);
}

#[test]
fn test_realloc_null_and_zero() {
    let p = realloc(core::ptr::null_mut(), 100, false);
    assert!(!p.is_null());
    assert!(realloc(p, 0, false).is_null()); // frees
}

#[test]
fn test_realloc_keeps_appendability() {
    let p = alloc_appendable(20, false, false, None);
    unsafe { core::ptr::write_bytes(p, 0x5A, 20) };
    let q = realloc(p, 300, false);
    assert!(!q.is_null());
    // The moved block still answers capacity queries for its new size.
    let cap = get_capacity(q, 300);
    assert!(cap >= 300);
    let bytes = unsafe { core::slice::from_raw_parts(q, 20) };
    assert!(bytes.iter().all(|&b| b == 0x5A));
    free(q);
}

#[test]
fn test_realloc_large_in_place_shrink() {
    let p = alloc(40 * PAGE_SIZE, false, false);
    let q = realloc(p, 12 * PAGE_SIZE, false);
    assert_eq!(q, p);
    free(q);
}

static DTOR_PTR: AtomicUsize = AtomicUsize::new(0);
static DTOR_SIZE: AtomicUsize = AtomicUsize::new(0);
static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn record_dtor(ptr: *mut u8, used: usize) {
    DTOR_PTR.store(ptr as usize, Ordering::SeqCst);
    DTOR_SIZE.store(used, Ordering::SeqCst);
    DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_destroy_runs_finalizer() {
    let s = alloc_appendable(45, false, false, Some(record_dtor));
    assert!(!s.is_null());

    let before = DTOR_CALLS.load(Ordering::SeqCst);
    destroy(s);
    assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), before + 1);
    assert_eq!(DTOR_PTR.load(Ordering::SeqCst), s as usize);
    assert_eq!(DTOR_SIZE.load(Ordering::SeqCst), 45);
}

#[test]
fn test_destroy_without_finalizer() {
    let s = alloc_appendable(45, false, false, None);
    let before = DTOR_CALLS.load(Ordering::SeqCst);
    destroy(s); // nothing to run, just frees
    assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), before);
}

#[test]
fn test_appendable_zeroed() {
    let p = alloc_appendable(600, false, true, None);
    let bytes = unsafe { core::slice::from_raw_parts(p, 600) };
    assert!(bytes.iter().all(|&b| b == 0));
    free(p);
}

#[test]
fn test_cross_thread_handoff() {
    // The no-double-handout property: blocks allocated here and freed on
    // another thread never overlap with blocks handed out afterwards.
    let ptrs: Vec<usize> = (0..256)
        .map(|_| alloc(96, false, false) as usize)
        .collect();
    assert!(ptrs.iter().all(|&p| p != 0));
    let mut sorted = ptrs.clone();
    sorted.sort_unstable();
    for w in sorted.windows(2) {
        assert!(w[0] + 96 <= w[1], "overlapping handouts");
    }

    let handle = std::thread::spawn(move || {
        for &p in &ptrs {
            free(p as *mut u8);
        }
    });
    handle.join().unwrap();
}
