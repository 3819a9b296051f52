//! Fallback bump arena for bootstrap-time allocations.
//!
//! While the underlying allocator's symbols are being resolved, the dynamic
//! linker may itself call `calloc`/`free`. Those requests are served from a
//! fixed static buffer with a monotonically advancing cursor. Nothing is
//! ever deallocated; arena pointers are recognized for the rest of the
//! process lifetime purely by address range.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the static fallback buffer.
///
/// Sized for what the linker allocates during symbol resolution; exhaustion
/// is unrecoverable (see `alloc`).
pub const ARENA_CAPACITY: usize = 1024 * 1024;

static mut ARENA: [u8; ARENA_CAPACITY] = [0u8; ARENA_CAPACITY];

/// Byte offset of the high-water mark within `ARENA`.
static CURSOR: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn begin() -> usize {
    (&raw mut ARENA) as usize
}

/// Round `value` up to the alignment mask derived from `bound`.
///
/// The mask covers one bit more than `bound`'s highest set bit, so a
/// power-of-two bound rounds to multiples of twice itself.
#[inline]
#[must_use]
pub fn align_up(value: usize, bound: usize) -> usize {
    let mask = (1usize << (usize::BITS - bound.leading_zeros())) - 1;
    (value + mask) & !mask
}

/// Bump-allocate `size` bytes at `bound` alignment (per `align_up`).
///
/// Returns null once the remaining span cannot hold the request. The buffer
/// starts zeroed and is never reused, so fresh spans satisfy `calloc`
/// without explicit clearing.
pub fn alloc(bound: usize, size: usize) -> *mut c_void {
    let begin = begin();
    loop {
        let cursor = CURSOR.load(Ordering::Relaxed);
        let ptr = align_up(begin + cursor, bound);
        let Some(end) = ptr.checked_add(size) else {
            return ptr::null_mut();
        };
        if end > begin + ARENA_CAPACITY {
            return ptr::null_mut();
        }
        if CURSOR
            .compare_exchange_weak(cursor, end - begin, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return ptr as *mut c_void;
        }
    }
}

/// True when `ptr` points into the fallback buffer.
#[inline]
#[must_use]
pub fn contains(ptr: *const c_void) -> bool {
    let addr = ptr as usize;
    let begin = begin();
    addr >= begin && addr < begin + ARENA_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_doubles_power_of_two_bounds() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 32);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_up(33, 16), 64);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn alloc_returns_in_range_aligned_pointers() {
        let ptr = alloc(16, 24);
        assert!(!ptr.is_null());
        assert!(contains(ptr));
        assert_eq!(ptr as usize % 32, 0);

        let next = alloc(16, 8);
        assert!(!next.is_null());
        assert!((next as usize) > (ptr as usize));
    }

    #[test]
    fn oversized_request_fails_without_advancing() {
        let before = CURSOR.load(Ordering::Relaxed);
        assert!(alloc(16, ARENA_CAPACITY + 1).is_null());
        assert_eq!(CURSOR.load(Ordering::Relaxed), before);
    }

    #[test]
    fn foreign_pointers_are_outside() {
        let local = 0u64;
        assert!(!contains((&raw const local).cast()));
        assert!(!contains(std::ptr::null()));
    }
}
