//! C-ABI entry points for a host language runtime.
//!
//! Gated behind `features = ["ffi"]`; built as part of the staticlib so
//! a runtime can call the allocator without going through Rust.

use crate::extent::Finalizer;
use crate::thread_cache;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_alloc(size: usize, contains_pointers: bool, zero: bool) -> *mut u8 {
    thread_cache::alloc(size, contains_pointers, zero)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_alloc_appendable(
    size: usize,
    contains_pointers: bool,
    zero: bool,
    finalizer: Option<Finalizer>,
) -> *mut u8 {
    thread_cache::alloc_appendable(size, contains_pointers, zero, finalizer)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_free(ptr: *mut u8) {
    thread_cache::free(ptr);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_destroy(ptr: *mut u8) {
    thread_cache::destroy(ptr);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_realloc(
    ptr: *mut u8,
    size: usize,
    contains_pointers: bool,
) -> *mut u8 {
    thread_cache::realloc(ptr, size, contains_pointers)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_get_capacity(ptr: *const u8, len: usize) -> usize {
    thread_cache::get_capacity(ptr, len)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn hp_extend(ptr: *const u8, len: usize, delta: usize) -> bool {
    thread_cache::extend(ptr, len, delta)
}
