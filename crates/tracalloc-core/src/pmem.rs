//! File-backed persistent memory kind.
//!
//! Backs routed allocations with an unlinked temporary file in the
//! configured directory, sized up front and mapped shared. On top of the
//! mapping sits a first-fit allocator whose bookkeeping lives entirely on
//! the ordinary heap: free extents in an address-ordered map (coalesced on
//! insert), live extents keyed by offset. The mapped bytes hold user
//! payloads only.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use parking_lot::Mutex;
use thiserror::Error;

use crate::kind::KindBackend;

/// Extent granularity; every run offset and length is a multiple of this.
const GRAIN: usize = 16;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity {0:#x} is below the minimum extent")]
    Capacity(usize),
    #[error("pool backing file creation in {dir:?} failed: errno {errno}")]
    Create { dir: PathBuf, errno: i32 },
    #[error("pool backing file resize to {size:#x} bytes failed: errno {errno}")]
    Resize { size: usize, errno: i32 },
    #[error("pool mapping of {size:#x} bytes failed: errno {errno}")]
    Map { size: usize, errno: i32 },
}

#[derive(Debug, Default)]
struct PoolState {
    /// Free extents, offset → length, adjacent runs always merged.
    free: BTreeMap<usize, usize>,
    /// Live extents, offset → length.
    allocated: HashMap<usize, usize>,
}

pub struct PmemKind {
    base: *mut u8,
    capacity: usize,
    state: Mutex<PoolState>,
}

// SAFETY: the mapping is owned exclusively by this value; all extent
// bookkeeping is serialized by `state`, and payload bytes belong to callers.
unsafe impl Send for PmemKind {}
// SAFETY: as above.
unsafe impl Sync for PmemKind {}

impl PmemKind {
    /// Map an unlinked `capacity`-byte file created in `dir`.
    pub fn create(dir: &Path, capacity: usize) -> Result<Self, PoolError> {
        let capacity = capacity & !(GRAIN - 1);
        if capacity < GRAIN {
            return Err(PoolError::Capacity(capacity));
        }

        use std::os::unix::ffi::OsStrExt;
        let mut template = dir.as_os_str().as_bytes().to_vec();
        template.extend_from_slice(b"/trac-pool.XXXXXX\0");

        // SAFETY: `template` is a writable NUL-terminated buffer in the
        // mkstemp format.
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
        if fd < 0 {
            return Err(PoolError::Create {
                dir: dir.to_path_buf(),
                errno: last_errno(),
            });
        }
        // The pool is private scratch space; keep the directory clean even
        // on crash.
        // SAFETY: `template` now holds the generated NUL-terminated name.
        unsafe {
            libc::unlink(template.as_ptr().cast());
        }

        // SAFETY: `fd` is the file just created.
        if unsafe { libc::ftruncate(fd, capacity as libc::off_t) } != 0 {
            let errno = last_errno();
            // SAFETY: `fd` is open.
            unsafe { libc::close(fd) };
            return Err(PoolError::Resize {
                size: capacity,
                errno,
            });
        }

        // SAFETY: plain shared mapping of the whole file.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: `fd` is open; the mapping keeps the file alive.
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(PoolError::Map {
                size: capacity,
                errno: last_errno(),
            });
        }

        let mut state = PoolState::default();
        state.free.insert(0, capacity);
        Ok(Self {
            base: base.cast(),
            capacity,
            state: Mutex::new(state),
        })
    }

    fn offset_of(&self, ptr: *mut c_void) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.base as usize;
        (addr >= base && addr < base + self.capacity).then(|| addr - base)
    }

    fn alloc_extent(&self, size: usize) -> Option<usize> {
        let need = round_up(size)?;
        let mut state = self.state.lock();
        let slot = state
            .free
            .iter()
            .find(|&(_, &len)| len >= need)
            .map(|(&off, &len)| (off, len));
        let (off, len) = slot?;
        state.free.remove(&off);
        if len > need {
            state.free.insert(off + need, len - need);
        }
        state.allocated.insert(off, need);
        Some(off)
    }

    fn aligned_extent(&self, bound: usize, size: usize) -> Option<usize> {
        let need = round_up(size)?;
        let base = self.base as usize;
        let mut state = self.state.lock();
        let slot = state.free.iter().find_map(|(&off, &len)| {
            let aligned = align_to(base + off, bound).checked_sub(base)?;
            let front = aligned - off;
            (len >= front + need).then_some((off, len, aligned, front))
        });
        let (off, len, aligned, front) = slot?;
        state.free.remove(&off);
        if front > 0 {
            state.free.insert(off, front);
        }
        let tail = len - front - need;
        if tail > 0 {
            state.free.insert(aligned + need, tail);
        }
        state.allocated.insert(aligned, need);
        Some(aligned)
    }

    fn release_extent(state: &mut PoolState, mut off: usize, mut len: usize) {
        if let Some((&prev_off, &prev_len)) = state.free.range(..off).next_back() {
            if prev_off + prev_len == off {
                state.free.remove(&prev_off);
                off = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = state.free.get(&(off + len)) {
            state.free.remove(&(off + len));
            len += next_len;
        }
        state.free.insert(off, len);
    }

    #[inline]
    fn payload(&self, off: usize) -> *mut c_void {
        // SAFETY: `off` is within the mapping by construction.
        unsafe { self.base.add(off) }.cast()
    }
}

impl Drop for PmemKind {
    fn drop(&mut self) {
        // SAFETY: `base`/`capacity` describe the mapping created above.
        unsafe {
            libc::munmap(self.base.cast(), self.capacity);
        }
    }
}

impl KindBackend for PmemKind {
    fn label(&self) -> &'static str {
        "pmem"
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        match self.alloc_extent(size) {
            Some(off) => self.payload(off),
            None => ptr::null_mut(),
        }
    }

    unsafe fn calloc(&self, count: usize, unit: usize) -> *mut c_void {
        let Some(total) = count.checked_mul(unit) else {
            return ptr::null_mut();
        };
        let Some(off) = self.alloc_extent(total) else {
            return ptr::null_mut();
        };
        let len = self.state.lock().allocated[&off];
        // Mapped pages start zeroed, but reused extents do not.
        // SAFETY: the extent spans `len` writable bytes.
        unsafe {
            self.payload(off).cast::<u8>().write_bytes(0, len);
        }
        self.payload(off)
    }

    unsafe fn memalign(&self, pptr: *mut *mut c_void, bound: usize, size: usize) -> c_int {
        if !bound.is_power_of_two() || bound % std::mem::size_of::<*mut c_void>() != 0 {
            return libc::EINVAL;
        }
        match self.aligned_extent(bound.max(GRAIN), size) {
            Some(off) => {
                // SAFETY: caller contract (`pptr` is writable).
                unsafe { *pptr = self.payload(off) };
                0
            }
            None => libc::ENOMEM,
        }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            // SAFETY: plain allocation.
            return unsafe { self.malloc(size) };
        }
        let Some(off) = self.offset_of(ptr) else {
            return ptr::null_mut();
        };
        let Some(need) = round_up(size) else {
            return ptr::null_mut();
        };

        let mut state = self.state.lock();
        let Some(&current) = state.allocated.get(&off) else {
            return ptr::null_mut();
        };

        if need == current {
            return ptr;
        }
        if need < current {
            state.allocated.insert(off, need);
            Self::release_extent(&mut state, off + need, current - need);
            return ptr;
        }

        // Grow in place when the very next extent is free and large enough.
        if let Some(&next_len) = state.free.get(&(off + current)) {
            if current + next_len >= need {
                state.free.remove(&(off + current));
                let leftover = current + next_len - need;
                if leftover > 0 {
                    state.free.insert(off + need, leftover);
                }
                state.allocated.insert(off, need);
                return ptr;
            }
        }

        drop(state);
        let Some(new_off) = self.alloc_extent(size) else {
            return ptr::null_mut();
        };
        // SAFETY: both extents are live and disjoint; `current < need`.
        unsafe {
            ptr::copy_nonoverlapping(
                self.payload(off).cast::<u8>(),
                self.payload(new_off).cast::<u8>(),
                current,
            );
        }
        let mut state = self.state.lock();
        state.allocated.remove(&off);
        Self::release_extent(&mut state, off, current);
        self.payload(new_off)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        let Some(off) = self.offset_of(ptr) else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(len) = state.allocated.remove(&off) {
            Self::release_extent(&mut state, off, len);
        }
    }
}

#[inline]
fn round_up(size: usize) -> Option<usize> {
    size.max(1).checked_add(GRAIN - 1).map(|n| n & !(GRAIN - 1))
}

#[inline]
fn align_to(addr: usize, bound: usize) -> usize {
    (addr + bound - 1) & !(bound - 1)
}

#[inline]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
