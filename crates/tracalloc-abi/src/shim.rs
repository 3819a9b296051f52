//! Per-thread gating state shared by every entry point.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracalloc_core::handler::{self, Handler};
use tracalloc_core::modmap;

/// False before the library constructor and after the destructor.
static READY: AtomicBool = AtomicBool::new(false);

std::thread_local! {
    /// Set while this thread is inside a handler operation.
    static NESTED: Cell<bool> = const { Cell::new(false) };
    /// This thread's handler, installed on first use.
    static CURRENT: RefCell<Option<Arc<Handler>>> = const { RefCell::new(None) };
}

#[inline]
pub fn ready() -> bool {
    READY.load(Ordering::Acquire)
}

pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::Release);
}

/// Claim the re-entrancy guard. False when already held or when the
/// thread's storage is gone (teardown).
fn enter() -> bool {
    NESTED
        .try_with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        })
        .unwrap_or(false)
}

fn leave() {
    let _ = NESTED.try_with(|flag| flag.set(false));
}

/// Run `op` against this thread's handler with the guard held, installing
/// the handler on first use. `None` directs the caller to the passthrough.
pub fn with_handler<R>(op: impl FnOnce(&Arc<Handler>) -> R) -> Option<R> {
    if !enter() {
        return None;
    }
    let handler = CURRENT
        .try_with(|slot| Arc::clone(slot.borrow_mut().get_or_insert_with(handler::install)))
        .ok();
    let result = handler.as_ref().map(op);
    leave();
    result
}

/// As `with_handler`, but never installs: `None` also when this thread has
/// no handler yet.
pub fn with_installed<R>(op: impl FnOnce(&Arc<Handler>) -> R) -> Option<R> {
    if !enter() {
        return None;
    }
    let handler = CURRENT.try_with(|slot| slot.borrow().clone()).ok().flatten();
    let result = handler.as_ref().map(op);
    leave();
    result
}

/// Refresh the module map with the guard held; dropped when re-entered.
pub fn refresh_modules() {
    if enter() {
        modmap::update();
        leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_flag_round_trips() {
        assert!(!ready());
        set_ready(true);
        assert!(ready());
        set_ready(false);
        assert!(!ready());
    }

    #[test]
    fn with_handler_refuses_nested_entry() {
        let outcome = with_handler(|_| with_handler(|_| ()));
        assert_eq!(outcome, Some(None));
    }

    #[test]
    fn with_installed_sees_the_handler_after_first_use() {
        // A fresh thread has no handler until `with_handler` installs one.
        std::thread::spawn(|| {
            assert_eq!(with_installed(|h| h.id()), None);
            let installed = with_handler(|h| h.id()).expect("install");
            assert_eq!(with_installed(|h| h.id()), Some(installed));
        })
        .join()
        .expect("thread");
    }
}
