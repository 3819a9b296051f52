//! Pass-through to the underlying allocator.
//!
//! The ABI crate exports the standard allocation symbols, which shadows the
//! C library's own; reaching the real implementations therefore goes through
//! the runtime linker's next-object lookup. Resolution happens once, on the
//! first call that needs it, under a process-wide recursive mutex: glibc's
//! `dlsym` allocates through `calloc`, so the resolving thread re-enters
//! these very functions mid-resolution. A thread-local flag marks that
//! thread, and its nested requests are served from the fallback arena.
//!
//! Lifecycle is one-way: unresolved, resolving, resolved. Once `RESOLVED`
//! is published every operation tail-calls the real function without
//! touching the mutex again.

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arena;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_USABLE_SIZE: AtomicUsize = AtomicUsize::new(0);
static REAL_DLOPEN: AtomicUsize = AtomicUsize::new(0);
static REAL_DLCLOSE: AtomicUsize = AtomicUsize::new(0);

/// Published (release) after every slot above has been filled.
static RESOLVED: AtomicBool = AtomicBool::new(false);

std::thread_local! {
    /// Set on the thread currently inside `resolve`.
    static RECURSING: Cell<bool> = const { Cell::new(false) };
}

// Bootstrap lock. It must be recursive (the resolving thread re-enters
// through the linker) and must never allocate, which rules out any lock
// whose slow path can touch the global allocator.
static mut RESOLVE_LOCK: libc::pthread_mutex_t = libc::PTHREAD_RECURSIVE_MUTEX_INITIALIZER_NP;

fn lock() {
    // SAFETY: the mutex is statically initialized and never destroyed.
    unsafe {
        libc::pthread_mutex_lock(&raw mut RESOLVE_LOCK);
    }
}

fn unlock() {
    // SAFETY: the calling thread holds the mutex.
    unsafe {
        libc::pthread_mutex_unlock(&raw mut RESOLVE_LOCK);
    }
}

#[inline]
pub fn resolved() -> bool {
    RESOLVED.load(Ordering::Acquire)
}

/// Look up every underlying symbol via the next object in search order.
///
/// Runs with the bootstrap lock held. A failed lookup leaves its slot at
/// zero; the corresponding operation then reports failure. No recovery is
/// attempted.
fn resolve() {
    RECURSING.set(true);
    let symbols: [(&AtomicUsize, *const c_char); 8] = [
        (&REAL_MALLOC, c"malloc".as_ptr()),
        (&REAL_CALLOC, c"calloc".as_ptr()),
        (&REAL_POSIX_MEMALIGN, c"posix_memalign".as_ptr()),
        (&REAL_REALLOC, c"realloc".as_ptr()),
        (&REAL_FREE, c"free".as_ptr()),
        (&REAL_USABLE_SIZE, c"malloc_usable_size".as_ptr()),
        (&REAL_DLOPEN, c"dlopen".as_ptr()),
        (&REAL_DLCLOSE, c"dlclose".as_ptr()),
    ];
    for (slot, name) in symbols {
        // SAFETY: `name` is a NUL-terminated literal; RTLD_NEXT is valid
        // from a shared object (and from a main executable in tests).
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name) };
        slot.store(addr as usize, Ordering::Relaxed);
    }
    RECURSING.set(false);
    RESOLVED.store(true, Ordering::Release);
}

/// Take the slow path: serialize, serve recursive callers from the arena
/// via `nested`, otherwise make sure resolution has happened.
///
/// Returns `Some` when the request was satisfied from the arena path and
/// the caller must not touch the real allocator.
fn bootstrap<R>(nested: impl FnOnce() -> R) -> Option<R> {
    lock();
    if RECURSING.get() {
        let served = nested();
        unlock();
        return Some(served);
    }
    if !resolved() {
        resolve();
    }
    unlock();
    None
}

#[inline]
fn fetch<F>(slot: &AtomicUsize) -> Option<F> {
    let addr = slot.load(Ordering::Relaxed);
    // SAFETY: non-zero slots hold the address `dlsym` returned for this
    // exact signature; `Option<fn>` is pointer-sized with 0 as `None`.
    unsafe { mem::transmute_copy::<usize, Option<F>>(&addr) }
}

/// `malloc` through the underlying allocator (arena during resolution).
pub fn malloc(size: usize) -> *mut c_void {
    if !resolved() {
        if let Some(served) = bootstrap(|| arena::alloc(16, size)) {
            return served;
        }
    }
    match fetch::<MallocFn>(&REAL_MALLOC) {
        // SAFETY: resolved slot, forwarded arguments.
        Some(real) => unsafe { real(size) },
        None => ptr::null_mut(),
    }
}

/// `calloc` through the underlying allocator (arena during resolution; the
/// arena starts zeroed and is never reused).
pub fn calloc(count: usize, unit: usize) -> *mut c_void {
    if !resolved() {
        let served = bootstrap(|| match count.checked_mul(unit) {
            Some(total) => arena::alloc(16, total),
            None => ptr::null_mut(),
        });
        if let Some(served) = served {
            return served;
        }
    }
    match fetch::<CallocFn>(&REAL_CALLOC) {
        // SAFETY: resolved slot, forwarded arguments.
        Some(real) => unsafe { real(count, unit) },
        None => ptr::null_mut(),
    }
}

/// `posix_memalign` through the underlying allocator.
///
/// # Safety
///
/// `pptr` must be valid for a pointer-sized write.
pub unsafe fn posix_memalign(pptr: *mut *mut c_void, bound: usize, size: usize) -> c_int {
    if !resolved() {
        let served = bootstrap(|| {
            let ptr = arena::alloc(bound, size);
            if ptr.is_null() {
                libc::ENOMEM
            } else {
                // SAFETY: caller contract.
                unsafe { *pptr = ptr };
                0
            }
        });
        if let Some(err) = served {
            return err;
        }
    }
    match fetch::<MemalignFn>(&REAL_POSIX_MEMALIGN) {
        // SAFETY: resolved slot, forwarded arguments.
        Some(real) => unsafe { real(pptr, bound, size) },
        None => libc::ENOMEM,
    }
}

/// `realloc` through the underlying allocator.
///
/// Arena pointers cannot grow: any `realloc` of one fails with null, before
/// and after resolution. During resolution only `realloc(null, n)` succeeds.
pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if arena::contains(ptr) {
        return ptr::null_mut();
    }
    if !resolved() {
        let served = bootstrap(|| {
            if ptr.is_null() {
                arena::alloc(16, size)
            } else {
                // The linker has no non-arena pointers to hand us here.
                ptr::null_mut()
            }
        });
        if let Some(served) = served {
            return served;
        }
    }
    match fetch::<ReallocFn>(&REAL_REALLOC) {
        // SAFETY: resolved slot, forwarded arguments.
        Some(real) => unsafe { real(ptr, size) },
        None => ptr::null_mut(),
    }
}

/// `free` through the underlying allocator. Null and arena pointers are
/// no-ops forever.
pub fn free(ptr: *mut c_void) {
    if ptr.is_null() || arena::contains(ptr) {
        return;
    }
    if !resolved() && bootstrap(|| ()).is_some() {
        return;
    }
    if let Some(real) = fetch::<FreeFn>(&REAL_FREE) {
        // SAFETY: resolved slot, forwarded argument.
        unsafe { real(ptr) };
    }
}

/// `malloc_usable_size` through the underlying allocator. Arena pointers
/// report 0: the bump cursor keeps no per-allocation sizes.
pub fn usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() || arena::contains(ptr) {
        return 0;
    }
    if !resolved() && bootstrap(|| 0).is_some() {
        return 0;
    }
    match fetch::<UsableSizeFn>(&REAL_USABLE_SIZE) {
        // SAFETY: resolved slot, forwarded argument.
        Some(real) => unsafe { real(ptr) },
        None => 0,
    }
}

/// `dlopen` through the underlying implementation.
///
/// # Safety
///
/// `filename` must be null or a valid NUL-terminated string.
pub unsafe fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    if !resolved() {
        // Resolution opens no libraries, so a recursive dlopen cannot occur.
        if let Some(served) = bootstrap(|| ptr::null_mut()) {
            return served;
        }
    }
    match fetch::<DlopenFn>(&REAL_DLOPEN) {
        // SAFETY: resolved slot, forwarded arguments.
        Some(real) => unsafe { real(filename, flags) },
        None => ptr::null_mut(),
    }
}

/// `dlclose` through the underlying implementation.
///
/// # Safety
///
/// `handle` must be a handle obtained from `dlopen`.
pub unsafe fn dlclose(handle: *mut c_void) -> c_int {
    if !resolved() {
        if let Some(served) = bootstrap(|| -1) {
            return served;
        }
    }
    match fetch::<DlcloseFn>(&REAL_DLCLOSE) {
        // SAFETY: resolved slot, forwarded argument.
        Some(real) => unsafe { real(handle) },
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_roundtrip() {
        let ptr = malloc(64);
        assert!(!ptr.is_null());
        assert!(resolved());
        // SAFETY: 64 writable bytes were just allocated.
        unsafe {
            ptr.cast::<u8>().write_bytes(0x5a, 64);
        }
        assert!(usable_size(ptr) >= 64);
        free(ptr);
    }

    #[test]
    fn calloc_zeroes() {
        let ptr = calloc(16, 8);
        assert!(!ptr.is_null());
        // SAFETY: 128 readable bytes were just allocated.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        free(ptr);
    }

    #[test]
    fn calloc_overflow_fails() {
        assert!(calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn memalign_honors_bound() {
        let mut ptr = ptr::null_mut();
        // SAFETY: `ptr` is a valid out-pointer.
        let err = unsafe { posix_memalign(&mut ptr, 256, 512) };
        assert_eq!(err, 0);
        assert_eq!(ptr as usize % 256, 0);
        free(ptr);
    }

    #[test]
    fn realloc_preserves_contents() {
        let ptr = malloc(32);
        assert!(!ptr.is_null());
        // SAFETY: 32 writable bytes were just allocated.
        unsafe {
            ptr.cast::<u8>().write_bytes(0xa7, 32);
        }
        let grown = realloc(ptr, 512);
        assert!(!grown.is_null());
        // SAFETY: the first 32 bytes survive a growing realloc.
        let bytes = unsafe { std::slice::from_raw_parts(grown.cast::<u8>(), 32) };
        assert!(bytes.iter().all(|&b| b == 0xa7));
        free(grown);
    }

    #[test]
    fn arena_pointers_are_terminal() {
        let ptr = crate::arena::alloc(16, 48);
        assert!(!ptr.is_null());
        assert!(realloc(ptr, 96).is_null());
        assert_eq!(usable_size(ptr), 0);
        free(ptr); // no-op, must not reach the real allocator
    }

    #[test]
    fn free_null_is_noop() {
        free(ptr::null_mut());
    }
}
