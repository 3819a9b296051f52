//! Integration test: the parser consumes what the interposer writes.
//!
//! Drives a real handler with tracing enabled, then feeds its log and the
//! maps log through the reader and checks the folded summary.
//!
//! Run: cargo test -p tracalloc-tools --test roundtrip

use std::collections::HashMap;
use std::fs;

use tracalloc_core::config::Config;
use tracalloc_core::handler;
use tracalloc_tools::parse;
use tracalloc_tools::report;

#[test]
fn handler_logs_parse_and_balance() {
    let dir = std::env::temp_dir().join(format!("tracalloc-roundtrip-{}", std::process::id()));
    fs::create_dir_all(&dir).expect("create scratch dir");

    let cfg = Config {
        log_dir: Some(dir.clone()),
        threshold: 0x40,
        stack_levels: 4,
        ..Config::default()
    };
    let handler = handler::install_with(&cfg);

    let kept = handler.malloc(512);
    let freed = handler.malloc(256);
    let small = handler.malloc(16); // below threshold, must not appear
    assert!(!kept.is_null() && !freed.is_null() && !small.is_null());
    assert!(handler.free(freed));
    assert!(handler.free(small));
    handler.on_end();

    let mut events = Vec::new();
    for entry in fs::read_dir(&dir).expect("read scratch dir").flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.starts_with("alloc_") {
            continue;
        }
        for line in fs::read_to_string(entry.path()).expect("read log").lines() {
            events.push(parse::parse_event(line).expect("every emitted line parses"));
        }
    }

    // +512, +256, -256, and the shutdown -512 drain record.
    assert_eq!(events.iter().filter(|e| e.alloc).count(), 2);
    assert_eq!(events.iter().filter(|e| !e.alloc).count(), 2);
    assert!(events.iter().all(|e| e.size == 512 || e.size == 256));
    assert!(
        events
            .iter()
            .filter(|e| e.alloc)
            .all(|e| e.stack.len() <= 4 && !e.stack.is_empty())
    );

    let summary = report::summarize(events, &HashMap::new());
    assert_eq!(summary.live_bytes, 0);
    assert_eq!(summary.live_count, 0);
    assert_eq!(summary.peak_live_bytes, 768);
    assert_eq!(summary.unmatched_frees, 0);

    fs::remove_dir_all(&dir).ok();
}
