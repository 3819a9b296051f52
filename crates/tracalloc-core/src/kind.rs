//! Memory kinds: the coexisting allocator backends behind routed requests.
//!
//! A kind behaves like the C allocation family: null (or an errno) reports
//! failure, and `free` accepts exactly the pointers the other operations
//! returned. Records in the handler tables carry the kind that produced
//! them so reallocation and free route back to the right backend.

use std::ffi::{c_int, c_void};
use std::sync::{Arc, OnceLock};

use crate::config::{self, Config};
use crate::passthrough;
use crate::pmem::PmemKind;

pub trait KindBackend: Send + Sync {
    /// Short name for diagnostics.
    fn label(&self) -> &'static str;

    /// # Safety
    ///
    /// Same contract as C `malloc`.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// Same contract as C `calloc`.
    unsafe fn calloc(&self, count: usize, unit: usize) -> *mut c_void;

    /// `posix_memalign` semantics: 0 on success, `EINVAL`/`ENOMEM` otherwise.
    ///
    /// # Safety
    ///
    /// `pptr` must be valid for a pointer-sized write.
    unsafe fn memalign(&self, pptr: *mut *mut c_void, bound: usize, size: usize) -> c_int;

    /// # Safety
    ///
    /// `ptr` must be null or a live pointer this kind produced.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` must be a live pointer this kind produced.
    unsafe fn free(&self, ptr: *mut c_void);
}

/// Opaque handle to a kind.
pub type Kind = Arc<dyn KindBackend>;

/// Kinds are compared by identity, never by content.
#[must_use]
pub fn same_kind(a: &Kind, b: &Kind) -> bool {
    Arc::ptr_eq(a, b)
}

/// The backend behind default-routed requests: the underlying allocator
/// itself, reached through the passthrough layer.
pub struct DefaultKind;

impl KindBackend for DefaultKind {
    fn label(&self) -> &'static str {
        "default"
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        passthrough::malloc(size)
    }

    unsafe fn calloc(&self, count: usize, unit: usize) -> *mut c_void {
        passthrough::calloc(count, unit)
    }

    unsafe fn memalign(&self, pptr: *mut *mut c_void, bound: usize, size: usize) -> c_int {
        // SAFETY: forwarded caller contract.
        unsafe { passthrough::posix_memalign(pptr, bound, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        passthrough::realloc(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        passthrough::free(ptr);
    }
}

/// The process-wide routed kind, decided once from the environment.
///
/// With `TRAC_PMEMDIR` set, a persistent pool of `TRAC_PMEMSIZE` bytes is
/// created on first use; a pool that fails to come up falls back to the
/// default kind without diagnostics.
#[must_use]
pub fn routed_kind() -> Kind {
    static ROUTED: OnceLock<Kind> = OnceLock::new();
    Arc::clone(ROUTED.get_or_init(|| build_routed(config::global())))
}

fn build_routed(cfg: &Config) -> Kind {
    if let Some(dir) = &cfg.pmem_dir {
        if let Ok(pool) = PmemKind::create(dir, cfg.pmem_size) {
            return Arc::new(pool);
        }
    }
    Arc::new(DefaultKind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_identity_is_by_handle() {
        let a: Kind = Arc::new(DefaultKind);
        let b: Kind = Arc::new(DefaultKind);
        assert!(same_kind(&a, &Arc::clone(&a)));
        assert!(!same_kind(&a, &b));
    }

    #[test]
    fn default_kind_reaches_the_underlying_allocator() {
        let kind: Kind = Arc::new(DefaultKind);
        // SAFETY: standard allocation round-trip.
        unsafe {
            let ptr = kind.malloc(128);
            assert!(!ptr.is_null());
            let grown = kind.realloc(ptr, 256);
            assert!(!grown.is_null());
            kind.free(grown);
        }
    }

    #[test]
    fn unconfigured_routing_falls_back_to_default() {
        let cfg = Config::default();
        let kind = build_routed(&cfg);
        assert_eq!(kind.label(), "default");
    }

    #[test]
    fn configured_pool_becomes_the_routed_kind() {
        let cfg = Config {
            pmem_dir: Some(std::env::temp_dir()),
            pmem_size: 1 << 20,
            ..Config::default()
        };
        let kind = build_routed(&cfg);
        assert_eq!(kind.label(), "pmem");
        // SAFETY: allocation round-trip on the freshly built kind.
        unsafe {
            let ptr = kind.malloc(4096);
            assert!(!ptr.is_null());
            let grown = kind.realloc(ptr, 8192);
            assert!(!grown.is_null());
            kind.free(grown);
        }
    }

    #[test]
    fn pool_failure_falls_back_to_default() {
        let cfg = Config {
            pmem_dir: Some("/nonexistent/tracalloc".into()),
            pmem_size: 1 << 20,
            ..Config::default()
        };
        let kind = build_routed(&cfg);
        assert_eq!(kind.label(), "default");
    }
}
