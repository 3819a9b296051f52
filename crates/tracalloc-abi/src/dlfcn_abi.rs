//! Interposed `dlopen`/`dlclose`.
//!
//! Both delegate to the underlying implementation, then refresh the module
//! map so stack symbolication keeps tracking the set of loaded objects.

use std::ffi::{c_char, c_int, c_void};

use tracalloc_core::passthrough;

use crate::shim;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let handle = unsafe { passthrough::dlopen(filename, flags) };
    shim::refresh_modules();
    handle
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    // SAFETY: forwarded caller contract.
    let rc = unsafe { passthrough::dlclose(handle) };
    shim::refresh_modules();
    rc
}
