//! Per-handler trace log.
//!
//! One file per handler, one event per line:
//!
//! ```text
//! SIGN SECS.NSECS,HEX_ADDR,HEX_SIZE[,MODID+HEX_OFF]*
//! ```
//!
//! with `SIGN` being `+` for an allocation and `-` for a deallocation,
//! timestamps from the raw monotonic clock, addresses and sizes as 16-digit
//! zero-padded hex, and the optional trailing list holding the captured
//! stack as `(module id, offset)` pairs.

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::clock;
use crate::modmap::LibAddr;

/// Event polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Alloc,
    Dealloc,
}

impl Sign {
    fn glyph(self) -> char {
        match self {
            Sign::Alloc => '+',
            Sign::Dealloc => '-',
        }
    }
}

/// Line-oriented event sink for one handler.
///
/// The writer serializes internally: deallocation records for cross-thread
/// frees land on the owning handler's log, so another thread may emit here.
pub struct TraceLog {
    writer: Mutex<Option<LineWriter<File>>>,
}

impl TraceLog {
    /// Open `alloc_<handler>_<tid>.log` under `dir`.
    pub fn open(dir: &Path, handler_id: usize, tid: i32) -> std::io::Result<Self> {
        let file = File::create(dir.join(format!("alloc_{handler_id}_{tid}.log")))?;
        Ok(Self {
            writer: Mutex::new(Some(LineWriter::new(file))),
        })
    }

    /// Append one event line. Write errors are dropped on the floor.
    pub fn emit(&self, sign: Sign, base: usize, size: usize, stack: &[LibAddr]) {
        let now = clock::monotonic();
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let _ = write!(writer, "{}{now},{base:016x},{size:016x}", sign.glyph());
        for frame in stack {
            let _ = write!(writer, ",{}+{:x}", frame.module, frame.offset);
        }
        let _ = writeln!(writer);
    }

    /// Flush and close; later events are dropped.
    pub fn close(&self) {
        let mut guard = self.writer.lock();
        if let Some(mut writer) = guard.take() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tracalloc-trace-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn emits_the_documented_line_format() {
        let dir = scratch_dir("format");
        let log = TraceLog::open(&dir, 7, 4242).expect("open log");
        log.emit(
            Sign::Alloc,
            0x1000,
            0x100,
            &[
                LibAddr {
                    module: 2,
                    offset: 0x40,
                },
                LibAddr {
                    module: 0,
                    offset: 0xdead,
                },
            ],
        );
        log.emit(Sign::Dealloc, 0x1000, 0x100, &[]);
        log.close();

        let text = fs::read_to_string(dir.join("alloc_7_4242.log")).expect("read log");
        let mut lines = text.lines();

        let alloc = lines.next().expect("alloc line");
        let (head, stack) = alloc.split_at(alloc.find(",00").expect("address field"));
        assert!(head.starts_with('+'));
        let stamp = &head[1..];
        let (secs, nanos) = stamp.split_once('.').expect("timestamp");
        assert!(secs.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(nanos.len(), 9);
        assert_eq!(stack, ",0000000000001000,0000000000000100,2+40,0+dead");

        let dealloc = lines.next().expect("dealloc line");
        assert!(dealloc.starts_with('-'));
        assert!(dealloc.ends_with(",0000000000001000,0000000000000100"));
        assert!(lines.next().is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn emit_after_close_is_dropped() {
        let dir = scratch_dir("closed");
        let log = TraceLog::open(&dir, 1, 1).expect("open log");
        log.close();
        log.emit(Sign::Alloc, 0x20, 0x20, &[]);
        let text = fs::read_to_string(dir.join("alloc_1_1.log")).expect("read log");
        assert!(text.is_empty());
        fs::remove_dir_all(&dir).ok();
    }
}
