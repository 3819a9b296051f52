// All extern "C" exports accept raw pointers from arbitrary C callers; the
// per-function contracts are the POSIX ones, so per-export safety docs would
// be boilerplate.
#![allow(clippy::missing_safety_doc)]
//! # tracalloc-abi
//!
//! The interposition boundary: a `cdylib` that exports the standard C
//! allocation entry points ahead of the C library in symbol-resolution
//! order (`LD_PRELOAD`).
//!
//! # Architecture
//!
//! ```text
//! host call -> entry point -> ready/nested gate -> per-thread handler
//!                                  |
//!                                  v (not ready, or re-entered)
//!                            core passthrough
//! ```
//!
//! Every entry point first consults the process `READY` flag and the
//! thread's `NESTED` guard; either one diverts the call straight to the
//! passthrough layer, which is callable at any point in the process
//! lifetime. Otherwise the call runs against the thread's handler with
//! `NESTED` held, so internal allocations cannot recurse into the handler.

mod shim;

// The exported symbols (and the lifecycle markers) shadow the test binary's
// own allocator; gated out so `cargo test` does not recurse into itself.
#[cfg(not(test))]
pub mod alloc_abi;
#[cfg(not(test))]
pub mod dlfcn_abi;
#[cfg(not(test))]
mod lifecycle;
