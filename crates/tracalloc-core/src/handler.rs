//! Per-thread allocation handlers.
//!
//! Each thread binds to one handler on its first non-bypassed allocation
//! and keeps it for life. The handler classifies requests against the size
//! threshold, routes large ones to a memory kind, keeps the table of live
//! allocations, and appends trace records. Frees and reallocations may
//! arrive on a different thread than the one that allocated; a process-wide
//! registry resolves those against every handler's table and hands back the
//! owner, so the record (and its `-` trace line) stays with the owning
//! handler.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{self, Config};
use crate::kind::{self, Kind};
use crate::modmap::LibAddr;
use crate::passthrough;
use crate::stack::{SHIM_FRAMES, StackScratch};
use crate::trace::{Sign, TraceLog};

/// Metadata for one live allocation, keyed by the address handed to the
/// caller.
#[derive(Clone)]
pub struct Allocation {
    /// Byte count the caller requested.
    pub size: usize,
    /// Backing kind; `None` marks untagged passthrough allocations.
    pub kind: Option<Kind>,
}

/// Registered handlers in creation order. Cross-thread lookups walk this.
static HANDLERS: Mutex<Vec<Arc<Handler>>> = Mutex::new(Vec::new());

pub struct Handler {
    id: usize,
    allocs: RwLock<HashMap<usize, Allocation>>,
    trace: Option<TraceLog>,
    threshold: usize,
    scratch: Mutex<StackScratch>,
}

impl Handler {
    fn new(id: usize, cfg: &Config) -> Self {
        let trace = cfg.log_dir.as_deref().and_then(|dir| {
            // SAFETY: no preconditions.
            let tid = unsafe { libc::gettid() };
            TraceLog::open(dir, id, tid).ok()
        });
        Self {
            id,
            allocs: RwLock::new(HashMap::new()),
            trace,
            threshold: cfg.threshold,
            scratch: Mutex::new(StackScratch::new(cfg.stack_levels, SHIM_FRAMES)),
        }
    }

    /// Dense creation index.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Route one `malloc`.
    pub fn malloc(self: &Arc<Self>, size: usize) -> *mut c_void {
        if size < self.threshold {
            let ptr = passthrough::malloc(size);
            if !ptr.is_null() {
                self.insert(ptr as usize, Allocation { size, kind: None });
            }
            return ptr;
        }
        let mut scratch = self.scratch.lock();
        let stack = scratch.capture();
        let kind = self.select(size, stack);
        // SAFETY: the caller's request, forwarded unchanged.
        let ptr = unsafe { kind.malloc(size) };
        if !ptr.is_null() {
            self.trace_event(Sign::Alloc, ptr as usize, size, stack);
            self.insert(
                ptr as usize,
                Allocation {
                    size,
                    kind: Some(kind),
                },
            );
        }
        ptr
    }

    /// Route one `calloc`.
    pub fn calloc(self: &Arc<Self>, count: usize, unit: usize) -> *mut c_void {
        let Some(size) = count.checked_mul(unit) else {
            return ptr::null_mut();
        };
        if size < self.threshold {
            let ptr = passthrough::calloc(count, unit);
            if !ptr.is_null() {
                self.insert(ptr as usize, Allocation { size, kind: None });
            }
            return ptr;
        }
        let mut scratch = self.scratch.lock();
        let stack = scratch.capture();
        let kind = self.select(size, stack);
        // SAFETY: the caller's request, forwarded unchanged.
        let ptr = unsafe { kind.calloc(count, unit) };
        if !ptr.is_null() {
            self.trace_event(Sign::Alloc, ptr as usize, size, stack);
            self.insert(
                ptr as usize,
                Allocation {
                    size,
                    kind: Some(kind),
                },
            );
        }
        ptr
    }

    /// Route one `posix_memalign`. `*pptr` is written only on success.
    ///
    /// # Safety
    ///
    /// `pptr` must be valid for a pointer-sized write.
    pub unsafe fn memalign(self: &Arc<Self>, pptr: *mut *mut c_void, bound: usize, size: usize) -> c_int {
        if size < self.threshold {
            // SAFETY: forwarded caller contract.
            let err = unsafe { passthrough::posix_memalign(pptr, bound, size) };
            if err == 0 {
                // SAFETY: the passthrough wrote a valid pointer on success.
                let base = unsafe { *pptr } as usize;
                self.insert(base, Allocation { size, kind: None });
            }
            return err;
        }
        let mut scratch = self.scratch.lock();
        let stack = scratch.capture();
        let kind = self.select(size, stack);
        // SAFETY: forwarded caller contract.
        let err = unsafe { kind.memalign(pptr, bound, size) };
        if err == 0 {
            // SAFETY: the kind wrote a valid pointer on success.
            let base = unsafe { *pptr } as usize;
            self.trace_event(Sign::Alloc, base, size, stack);
            self.insert(
                base,
                Allocation {
                    size,
                    kind: Some(kind),
                },
            );
        }
        err
    }

    /// Route one `realloc` of a pointer some handler owns.
    ///
    /// `None` means no handler knows `ptr` and the caller must migrate it.
    /// `Some(new)` reports the outcome exactly as the backing produced it:
    /// a null `new` is an allocation failure with the old block still live
    /// (and still recorded).
    pub fn realloc(self: &Arc<Self>, ptr: *mut c_void, size: usize) -> Option<*mut c_void> {
        let base = ptr as usize;
        let (home, old) = self.locate(base)?;

        if size < self.threshold {
            let new_ptr = match &old.kind {
                // SAFETY: `ptr` is live and was produced by this kind.
                Some(old_kind) => unsafe { old_kind.realloc(ptr, size) },
                None => passthrough::realloc(ptr, size),
            };
            if !new_ptr.is_null() {
                if old.size >= self.threshold {
                    let mut scratch = self.scratch.lock();
                    let stack = scratch.capture();
                    home.trace_event(Sign::Dealloc, base, old.size, stack);
                }
                home.remove(base);
                self.insert(
                    new_ptr as usize,
                    Allocation {
                        size,
                        kind: old.kind.clone(),
                    },
                );
            }
            return Some(new_ptr);
        }

        let mut scratch = self.scratch.lock();
        let stack = scratch.capture();
        let new_kind = self.select(size, stack);
        let stays = old
            .kind
            .as_ref()
            .is_some_and(|old_kind| kind::same_kind(old_kind, &new_kind));
        let new_ptr = if stays {
            // SAFETY: `ptr` is live and was produced by this kind.
            unsafe { new_kind.realloc(ptr, size) }
        } else {
            // SAFETY: a fresh request of the caller's size.
            let fresh = unsafe { new_kind.malloc(size) };
            if !fresh.is_null() {
                // SAFETY: both blocks are live; the copy spans the smaller
                // of the two.
                unsafe {
                    ptr::copy_nonoverlapping(
                        ptr.cast::<u8>(),
                        fresh.cast::<u8>(),
                        old.size.min(size),
                    );
                }
                match &old.kind {
                    // SAFETY: `ptr` is live and was produced by this kind.
                    Some(old_kind) => unsafe { old_kind.free(ptr) },
                    None => passthrough::free(ptr),
                }
            }
            fresh
        };
        if !new_ptr.is_null() {
            if old.size >= self.threshold {
                home.trace_event(Sign::Dealloc, base, old.size, stack);
            }
            self.trace_event(Sign::Alloc, new_ptr as usize, size, stack);
            home.remove(base);
            self.insert(
                new_ptr as usize,
                Allocation {
                    size,
                    kind: Some(new_kind),
                },
            );
        }
        Some(new_ptr)
    }

    /// Route one `free`. False when no handler owns `ptr`.
    pub fn free(self: &Arc<Self>, ptr: *mut c_void) -> bool {
        let base = ptr as usize;
        let Some((home, info)) = self.locate(base) else {
            return false;
        };
        match &info.kind {
            // SAFETY: `ptr` is live and was produced by this kind.
            Some(owner_kind) => unsafe { owner_kind.free(ptr) },
            None => passthrough::free(ptr),
        }
        if info.size >= self.threshold {
            let mut scratch = self.scratch.lock();
            let stack = scratch.capture();
            home.trace_event(Sign::Dealloc, base, info.size, stack);
        }
        home.remove(base);
        true
    }

    /// Recorded request size for `ptr`, searched across all handlers.
    #[must_use]
    pub fn getsize(self: &Arc<Self>, ptr: *mut c_void) -> Option<usize> {
        self.locate(ptr as usize).map(|(_, info)| info.size)
    }

    /// Emit free-on-shutdown records for residual entries, clear the table,
    /// close the log.
    pub fn on_end(&self) {
        let mut allocs = self.allocs.write();
        for (&base, info) in allocs.iter() {
            if info.size > self.threshold {
                self.trace_event(Sign::Dealloc, base, info.size, &[]);
            }
        }
        allocs.clear();
        drop(allocs);
        if let Some(trace) = &self.trace {
            trace.close();
        }
    }

    /// Pick the backing kind for a routed request.
    ///
    /// The default policy ignores its inputs and returns the process-wide
    /// routed kind; replacements only need to be deterministic for
    /// identical inputs.
    fn select(&self, _size: usize, _stack: &[LibAddr]) -> Kind {
        kind::routed_kind()
    }

    fn locate(self: &Arc<Self>, base: usize) -> Option<(Arc<Handler>, Allocation)> {
        if let Some(info) = self.lookup_local(base) {
            return Some((Arc::clone(self), info));
        }
        global_lookup(base, self.id)
    }

    fn lookup_local(&self, base: usize) -> Option<Allocation> {
        self.allocs.read().get(&base).cloned()
    }

    fn insert(&self, base: usize, info: Allocation) {
        self.allocs.write().insert(base, info);
    }

    fn remove(&self, base: usize) {
        self.allocs.write().remove(&base);
    }

    fn trace_event(&self, sign: Sign, base: usize, size: usize, stack: &[LibAddr]) {
        if let Some(trace) = &self.trace {
            trace.emit(sign, base, size, stack);
        }
    }
}

/// Create and register the calling thread's handler.
#[must_use]
pub fn install() -> Arc<Handler> {
    install_with(config::global())
}

/// As `install`, with explicit configuration.
#[must_use]
pub fn install_with(cfg: &Config) -> Arc<Handler> {
    let mut handlers = HANDLERS.lock();
    let handler = Arc::new(Handler::new(handlers.len(), cfg));
    handlers.push(Arc::clone(&handler));
    handler
}

/// Drain every registered handler: residual records, table clear, log close.
pub fn end_all() {
    let drained: Vec<Arc<Handler>> = {
        let mut handlers = HANDLERS.lock();
        handlers.drain(..).collect()
    };
    for handler in drained {
        handler.on_end();
    }
}

/// Find `base` in any handler's table except `exclude`'s.
fn global_lookup(base: usize, exclude: usize) -> Option<(Arc<Handler>, Allocation)> {
    let handlers = HANDLERS.lock();
    for handler in handlers.iter() {
        if handler.id != exclude {
            if let Some(info) = handler.lookup_local(base) {
                return Some((Arc::clone(handler), info));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(threshold: usize) -> Config {
        Config {
            threshold,
            ..Config::default()
        }
    }

    #[test]
    fn ids_increase_with_registration() {
        let a = install_with(&quiet(0));
        let b = install_with(&quiet(0));
        assert!(b.id() > a.id());
    }

    #[test]
    fn malloc_records_and_free_clears() {
        let handler = install_with(&quiet(0));
        let ptr = handler.malloc(96);
        assert!(!ptr.is_null());
        assert_eq!(handler.getsize(ptr), Some(96));
        assert!(handler.free(ptr));
        assert_eq!(handler.getsize(ptr), None);
    }

    #[test]
    fn below_threshold_allocations_are_untagged() {
        let handler = install_with(&quiet(1 << 12));
        let ptr = handler.malloc(64);
        assert!(!ptr.is_null());
        let info = handler.lookup_local(ptr as usize).expect("recorded");
        assert!(info.kind.is_none());
        assert!(handler.free(ptr));
    }

    #[test]
    fn routed_allocations_carry_their_kind() {
        let handler = install_with(&quiet(0));
        let ptr = handler.malloc(4096);
        assert!(!ptr.is_null());
        let info = handler.lookup_local(ptr as usize).expect("recorded");
        assert!(info.kind.is_some());
        assert!(handler.free(ptr));
    }

    #[test]
    fn free_of_unknown_pointer_is_reported() {
        let handler = install_with(&quiet(0));
        let foreign = passthrough::malloc(32);
        assert!(!handler.free(foreign));
        passthrough::free(foreign);
    }

    #[test]
    fn cross_handler_free_finds_the_owner() {
        let owner = install_with(&quiet(0));
        let other = install_with(&quiet(0));
        let ptr = owner.malloc(512);
        assert!(!ptr.is_null());
        assert_eq!(other.getsize(ptr), Some(512));
        assert!(other.free(ptr));
        assert!(owner.lookup_local(ptr as usize).is_none());
    }

    #[test]
    fn realloc_transfers_ownership_to_the_caller() {
        let owner = install_with(&quiet(0));
        let other = install_with(&quiet(0));
        let ptr = owner.malloc(128);
        let new_ptr = other.realloc(ptr, 256).expect("known pointer");
        assert!(!new_ptr.is_null());
        assert!(owner.lookup_local(ptr as usize).is_none());
        assert_eq!(
            other.lookup_local(new_ptr as usize).map(|info| info.size),
            Some(256)
        );
        assert!(other.free(new_ptr));
    }

    #[test]
    fn realloc_of_unknown_pointer_is_reported() {
        let handler = install_with(&quiet(0));
        let foreign = passthrough::malloc(32);
        assert!(handler.realloc(foreign, 64).is_none());
        passthrough::free(foreign);
    }

    #[test]
    fn calloc_overflow_fails_without_recording() {
        let handler = install_with(&quiet(0));
        assert!(handler.calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn memalign_records_the_aligned_address() {
        let handler = install_with(&quiet(0));
        let mut ptr = ptr::null_mut();
        // SAFETY: `ptr` is a valid out-pointer.
        let err = unsafe { handler.memalign(&mut ptr, 64, 200) };
        assert_eq!(err, 0);
        assert_eq!(ptr as usize % 64, 0);
        assert_eq!(handler.getsize(ptr), Some(200));
        assert!(handler.free(ptr));
    }

    #[test]
    fn on_end_clears_the_table() {
        let handler = install_with(&quiet(0));
        let ptr = handler.malloc(256);
        assert!(!ptr.is_null());
        handler.on_end();
        assert!(handler.lookup_local(ptr as usize).is_none());
        // The block itself still needs releasing; it never reached a trace.
        passthrough::free(ptr);
    }
}
