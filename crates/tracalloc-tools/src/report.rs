//! Aggregation of parsed trace events.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::parse::Event;

/// Summary of one or more trace logs, folded in timestamp order.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub events: usize,
    pub allocs: usize,
    pub frees: usize,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    /// Live bytes at the end of the trace.
    pub live_bytes: u64,
    /// Live allocation count at the end of the trace.
    pub live_count: usize,
    /// Highest live-byte watermark seen.
    pub peak_live_bytes: u64,
    /// Timestamp (ns) at which the watermark was reached.
    pub peak_at_ns: u64,
    /// Frees whose address never appeared in an allocation record. These
    /// come from blocks allocated before tracing began.
    pub unmatched_frees: usize,
    /// Attribution by the innermost captured frame's module, descending by
    /// bytes.
    pub by_module: Vec<ModuleUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleUsage {
    pub module: usize,
    pub path: Option<String>,
    pub allocs: usize,
    pub bytes: u64,
}

/// Fold `events` into a summary. `modules` maps ids from `maps.log` to
/// pathnames for attribution.
#[must_use]
pub fn summarize(mut events: Vec<Event>, modules: &HashMap<usize, String>) -> Summary {
    events.sort_by_key(|event| event.at_ns);

    let mut summary = Summary::default();
    let mut live: HashMap<u64, u64> = HashMap::new();
    let mut usage: HashMap<usize, (usize, u64)> = HashMap::new();

    for event in &events {
        summary.events += 1;
        if event.alloc {
            summary.allocs += 1;
            summary.bytes_allocated += event.size;
            live.insert(event.base, event.size);
            summary.live_bytes += event.size;
            if summary.live_bytes > summary.peak_live_bytes {
                summary.peak_live_bytes = summary.live_bytes;
                summary.peak_at_ns = event.at_ns;
            }
            if let Some(frame) = event.stack.first() {
                let slot = usage.entry(frame.module).or_default();
                slot.0 += 1;
                slot.1 += event.size;
            }
        } else {
            summary.frees += 1;
            summary.bytes_freed += event.size;
            if live.remove(&event.base).is_some() {
                summary.live_bytes = summary.live_bytes.saturating_sub(event.size);
            } else {
                summary.unmatched_frees += 1;
            }
        }
    }
    summary.live_count = live.len();

    summary.by_module = usage
        .into_iter()
        .map(|(module, (allocs, bytes))| ModuleUsage {
            module,
            path: modules.get(&module).cloned(),
            allocs,
            bytes,
        })
        .collect();
    summary
        .by_module
        .sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.module.cmp(&b.module)));
    summary
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "events {} (+{} / -{}, {} unmatched frees)",
            self.events, self.allocs, self.frees, self.unmatched_frees
        )?;
        writeln!(
            f,
            "bytes  {} allocated, {} freed, {} live in {} blocks",
            self.bytes_allocated, self.bytes_freed, self.live_bytes, self.live_count
        )?;
        writeln!(
            f,
            "peak   {} bytes at {}.{:09}s",
            self.peak_live_bytes,
            self.peak_at_ns / 1_000_000_000,
            self.peak_at_ns % 1_000_000_000
        )?;
        for usage in &self.by_module {
            writeln!(
                f,
                "  [{}] {:>12} bytes in {:>6} allocs  {}",
                usage.module,
                usage.bytes,
                usage.allocs,
                usage.path.as_deref().unwrap_or("?")
            )?;
        }
        Ok(())
    }
}
