//! # tracalloc-tools
//!
//! Offline readers for the interposer's trace output: the per-handler
//! `alloc_*.log` event streams and the `maps.log` module table. The
//! `trac-report` binary folds them into live/peak/per-module summaries.

pub mod parse;
pub mod report;
