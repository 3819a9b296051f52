//! Call-stack capture for trace records.

use std::ffi::{c_int, c_void};

use crate::modmap::{self, LibAddr};

/// Frames belonging to the interposer itself, skipped from every capture.
pub const SHIM_FRAMES: usize = 3;

/// Reusable capture buffers, sized once at handler creation so the walk
/// itself allocates nothing.
pub struct StackScratch {
    raw: Vec<usize>,
    resolved: Vec<LibAddr>,
    levels: usize,
    offset: usize,
}

impl StackScratch {
    #[must_use]
    pub fn new(levels: usize, offset: usize) -> Self {
        Self {
            raw: vec![0; levels + offset],
            resolved: vec![LibAddr::default(); levels],
            levels,
            offset,
        }
    }

    /// Walk the current thread's stack and resolve the frames below the
    /// shim prefix. Empty when capture is disabled.
    pub fn capture(&mut self) -> &[LibAddr] {
        if self.levels == 0 {
            return &[];
        }
        let capacity = self.raw.len();
        // SAFETY: `raw` holds `capacity` machine words, which is exactly
        // what the walker fills; `usize` and `*mut c_void` share layout.
        let depth = unsafe {
            libc::backtrace(self.raw.as_mut_ptr().cast::<*mut c_void>(), capacity as c_int)
        };
        let depth = usize::try_from(depth).unwrap_or(0);
        let mut count = 0;
        for &frame in self.raw.iter().take(depth).skip(self.offset) {
            self.resolved[count] = modmap::lookup(frame);
            count += 1;
        }
        &self.resolved[..count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_capture_is_empty() {
        let mut scratch = StackScratch::new(0, SHIM_FRAMES);
        assert!(scratch.capture().is_empty());
    }

    #[test]
    fn capture_skips_the_shim_prefix_and_caps_depth() {
        let mut scratch = StackScratch::new(8, 2);
        let frames = scratch.capture();
        assert!(!frames.is_empty());
        assert!(frames.len() <= 8);
    }

    #[test]
    fn frames_resolve_through_the_module_map() {
        let mut scratch = StackScratch::new(8, 0);
        let frames = scratch.capture();
        // The innermost frames sit in this test binary or libc, both of
        // which are loadable segments with nonzero ids.
        assert!(frames.iter().any(|f| f.module != 0));
    }
}
