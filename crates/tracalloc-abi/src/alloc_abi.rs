//! Interposed allocation entry points.
//!
//! The full family: `malloc`, `calloc`, `realloc`, `free`,
//! `posix_memalign`, `aligned_alloc`, `memalign`, `valloc`, `pvalloc`,
//! `cfree`, `malloc_usable_size`. The aligned variants funnel through the
//! `posix_memalign` policy with derived bounds.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use tracalloc_core::arena;
use tracalloc_core::handler::Handler;
use tracalloc_core::passthrough;

use crate::shim;

// ---------------------------------------------------------------------------
// malloc / calloc / posix_memalign
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if !shim::ready() {
        return passthrough::malloc(size);
    }
    shim::with_handler(|handler| handler.malloc(size))
        .unwrap_or_else(|| passthrough::malloc(size))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, unit: usize) -> *mut c_void {
    if !shim::ready() {
        return passthrough::calloc(count, unit);
    }
    shim::with_handler(|handler| handler.calloc(count, unit))
        .unwrap_or_else(|| passthrough::calloc(count, unit))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    pptr: *mut *mut c_void,
    bound: usize,
    size: usize,
) -> c_int {
    if !shim::ready() {
        // SAFETY: forwarded caller contract.
        return unsafe { passthrough::posix_memalign(pptr, bound, size) };
    }
    // SAFETY: forwarded caller contract.
    shim::with_handler(|handler| unsafe { handler.memalign(pptr, bound, size) })
        .unwrap_or_else(|| unsafe { passthrough::posix_memalign(pptr, bound, size) })
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if !shim::ready() {
        return passthrough::realloc(ptr, size);
    }
    let routed = shim::with_handler(|handler| {
        if ptr.is_null() {
            return handler.malloc(size);
        }
        match handler.realloc(ptr, size) {
            Some(new_ptr) => new_ptr,
            None => migrate(handler, ptr, size),
        }
    });
    routed.unwrap_or_else(|| passthrough::realloc(ptr, size))
}

/// Adopt a pointer no handler has seen (allocated before this thread's
/// handler existed, or directly by the underlying allocator): allocate
/// through the handler, copy what the underlying allocator reports as
/// usable, release the original underneath.
fn migrate(handler: &Arc<Handler>, ptr: *mut c_void, size: usize) -> *mut c_void {
    let old_size = passthrough::usable_size(ptr);
    let new_ptr = handler.malloc(size);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: `new_ptr` spans `size` bytes; `ptr` is readable for
    // `old_size` bytes per the underlying allocator's report.
    unsafe {
        ptr::copy_nonoverlapping(ptr.cast::<u8>(), new_ptr.cast::<u8>(), old_size.min(size));
    }
    passthrough::free(ptr);
    new_ptr
}

// ---------------------------------------------------------------------------
// free / cfree / malloc_usable_size
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || arena::contains(ptr) {
        return;
    }
    if !shim::ready() {
        return passthrough::free(ptr);
    }
    match shim::with_installed(|handler| handler.free(ptr)) {
        Some(true) => {}
        // Unknown to every handler, nested, or no handler on this thread.
        _ => passthrough::free(ptr),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    // SAFETY: same contract as `free`.
    unsafe { free(ptr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    if !shim::ready() {
        return passthrough::usable_size(ptr);
    }
    shim::with_installed(|handler| handler.getsize(ptr))
        .flatten()
        .unwrap_or_else(|| passthrough::usable_size(ptr))
}

// ---------------------------------------------------------------------------
// Aligned variants, derived from posix_memalign
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(bound: usize, size: usize) -> *mut c_void {
    let mut ptr = ptr::null_mut();
    // SAFETY: `ptr` is a valid out-pointer.
    if unsafe { posix_memalign(&mut ptr, bound, size) } == 0 {
        ptr
    } else {
        ptr::null_mut()
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(bound: usize, size: usize) -> *mut c_void {
    // SAFETY: same derivation as `memalign`.
    unsafe { memalign(bound, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    // SAFETY: page-bound `memalign`.
    unsafe { memalign(page_size(), size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let bound = page_size();
    // SAFETY: page-bound `memalign` of the page-rounded size.
    unsafe { memalign(bound, arena::align_up(size, bound)) }
}

fn page_size() -> usize {
    // SAFETY: no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
