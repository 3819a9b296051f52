//! Environment configuration.
//!
//! Every knob comes from a `TRAC_*` environment variable, read once on first
//! use and cached for the life of the process. Unparsable values silently
//! fall back to their defaults.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Capacity of the persistent pool when `TRAC_PMEMDIR` is set but
/// `TRAC_PMEMSIZE` is absent or zero: 4 GiB.
pub const DEFAULT_PMEM_SIZE: usize = 1 << 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Directory for per-handler trace logs and `maps.log`; `None` disables
    /// tracing entirely.
    pub log_dir: Option<PathBuf>,
    /// Requests strictly below this many bytes bypass kind routing and
    /// tracing.
    pub threshold: usize,
    /// Stack frames captured per routed event.
    pub stack_levels: usize,
    /// Filesystem backing for the secondary memory kind.
    pub pmem_dir: Option<PathBuf>,
    /// Capacity of the secondary backing in bytes.
    pub pmem_size: usize,
}

impl Config {
    /// Read the `TRAC_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let pmem_size = match std::env::var("TRAC_PMEMSIZE")
            .ok()
            .and_then(|v| parse_size(&v))
        {
            Some(size) if size > 0 => size,
            _ => DEFAULT_PMEM_SIZE,
        };
        Self {
            log_dir: std::env::var_os("TRAC_LOGPATH").map(PathBuf::from),
            threshold: std::env::var("TRAC_THRESHOLD")
                .ok()
                .and_then(|v| parse_size(&v))
                .unwrap_or(0),
            stack_levels: std::env::var("TRAC_STACKLEVELS")
                .ok()
                .and_then(|v| parse_size(&v))
                .unwrap_or(0),
            pmem_dir: std::env::var_os("TRAC_PMEMDIR").map(PathBuf::from),
            pmem_size,
        }
    }
}

/// Process-wide configuration (first call reads the environment).
#[must_use]
pub fn global() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

/// Parse a size given as decimal or `0x`-prefixed hex.
#[must_use]
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_size("64"), Some(64));
        assert_eq!(parse_size("0x40"), Some(0x40));
        assert_eq!(parse_size("0X100000000"), Some(1 << 32));
        assert_eq!(parse_size(" 12 "), Some(12));
    }

    #[test]
    fn junk_yields_none() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("0xzz"), None);
        assert_eq!(parse_size("-4"), None);
    }
}
