//! Trace-log grammar.
//!
//! Event lines:
//!
//! ```text
//! SIGN SECS.NSECS,HEX_ADDR,HEX_SIZE[,MODID+HEX_OFF]*
//! ```
//!
//! Map lines: `<id>: <pathname>`.

use serde::Serialize;
use thiserror::Error;

/// One `(module, offset)` stack frame from a trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub module: usize,
    pub offset: u64,
}

/// One allocation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// True for `+`, false for `-`.
    pub alloc: bool,
    /// Monotonic timestamp in nanoseconds.
    pub at_ns: u64,
    pub base: u64,
    pub size: u64,
    pub stack: Vec<Frame>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown event sign {0:?}")]
    Sign(char),
    #[error("malformed timestamp {0:?}")]
    Timestamp(String),
    #[error("malformed hex field {0:?}")]
    Hex(String),
    #[error("malformed stack frame {0:?}")]
    Frame(String),
    #[error("missing {0} field")]
    Missing(&'static str),
    #[error("malformed map line {0:?}")]
    MapLine(String),
}

/// Parse one event line.
pub fn parse_event(line: &str) -> Result<Event, ParseError> {
    let mut chars = line.chars();
    let alloc = match chars.next() {
        Some('+') => true,
        Some('-') => false,
        Some(other) => return Err(ParseError::Sign(other)),
        None => return Err(ParseError::Empty),
    };
    let mut fields = chars.as_str().split(',');
    let at_ns = parse_stamp(fields.next().ok_or(ParseError::Missing("timestamp"))?)?;
    let base = parse_hex(fields.next().ok_or(ParseError::Missing("address"))?)?;
    let size = parse_hex(fields.next().ok_or(ParseError::Missing("size"))?)?;
    let stack = fields.map(parse_frame).collect::<Result<_, _>>()?;
    Ok(Event {
        alloc,
        at_ns,
        base,
        size,
        stack,
    })
}

/// Parse one `maps.log` line into `(id, pathname)`.
pub fn parse_map_line(line: &str) -> Result<(usize, String), ParseError> {
    let (id, path) = line
        .split_once(": ")
        .ok_or_else(|| ParseError::MapLine(line.to_owned()))?;
    let id = id
        .parse()
        .map_err(|_| ParseError::MapLine(line.to_owned()))?;
    Ok((id, path.to_owned()))
}

fn parse_stamp(field: &str) -> Result<u64, ParseError> {
    let bad = || ParseError::Timestamp(field.to_owned());
    let (secs, nanos) = field.split_once('.').ok_or_else(bad)?;
    let secs: u64 = secs.parse().map_err(|_| bad())?;
    let nanos: u64 = nanos.parse().map_err(|_| bad())?;
    if nanos >= 1_000_000_000 {
        return Err(bad());
    }
    Ok(secs * 1_000_000_000 + nanos)
}

fn parse_hex(field: &str) -> Result<u64, ParseError> {
    u64::from_str_radix(field, 16).map_err(|_| ParseError::Hex(field.to_owned()))
}

fn parse_frame(field: &str) -> Result<Frame, ParseError> {
    let bad = || ParseError::Frame(field.to_owned());
    let (module, offset) = field.split_once('+').ok_or_else(bad)?;
    Ok(Frame {
        module: module.parse().map_err(|_| bad())?,
        offset: u64::from_str_radix(offset, 16).map_err(|_| bad())?,
    })
}
