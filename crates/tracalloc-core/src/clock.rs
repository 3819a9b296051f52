//! Clock readings for trace records.
//!
//! Trace timestamps come from `CLOCK_MONOTONIC_RAW` so they are immune to
//! wall-clock adjustment; the begin/end markers additionally carry the
//! per-process CPU clock.

use std::fmt;

/// Seconds + nanoseconds pair read from a POSIX clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub secs: i64,
    pub nanos: i64,
}

impl fmt::Display for Stamp {
    /// `SECS.NANOS` with a fixed 9-digit fraction.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

fn read(clock: libc::clockid_t) -> Stamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer and both clock ids used below
    // exist on Linux.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    Stamp {
        secs: ts.tv_sec,
        nanos: ts.tv_nsec,
    }
}

/// Raw monotonic clock reading.
#[must_use]
pub fn monotonic() -> Stamp {
    read(libc::CLOCK_MONOTONIC_RAW)
}

/// Per-process CPU time.
#[must_use]
pub fn process_cpu() -> Stamp {
    read(libc::CLOCK_PROCESS_CPUTIME_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
        assert!(a.nanos < 1_000_000_000);
    }

    #[test]
    fn display_pads_nanoseconds() {
        let stamp = Stamp { secs: 12, nanos: 3 };
        assert_eq!(stamp.to_string(), "12.000000003");
    }
}
