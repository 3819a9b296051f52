//! Summarize tracalloc trace logs.
//!
//! ```text
//! trac-report <LOGDIR | alloc_*.log ...> [--maps maps.log] [--json]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use tracalloc_tools::parse::{self, Event};
use tracalloc_tools::report;

#[derive(Parser)]
#[command(name = "trac-report", about = "Summarize allocation trace logs")]
struct Args {
    /// Trace files, or directories to scan for `alloc_*.log`.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Module map log for pathname attribution. Defaults to `maps.log`
    /// next to the first input directory.
    #[arg(long)]
    maps: Option<PathBuf>,
    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut files = Vec::new();
    for input in &args.inputs {
        if input.is_dir() {
            collect_logs(input, &mut files);
        } else {
            files.push(input.clone());
        }
    }
    if files.is_empty() {
        eprintln!("no trace logs found");
        return ExitCode::FAILURE;
    }

    let mut events = Vec::new();
    let mut bad_lines = 0usize;
    for file in &files {
        match fs::read_to_string(file) {
            Ok(text) => bad_lines += read_events(file, &text, &mut events),
            Err(err) => {
                eprintln!("{}: {err}", file.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let maps_path = args
        .maps
        .or_else(|| default_maps_path(&args.inputs))
        .filter(|path| path.is_file());
    let modules = maps_path.map(read_modules).unwrap_or_default();

    let summary = report::summarize(events, &modules);
    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("serializing summary: {err}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{summary}");
    }

    if bad_lines > 0 {
        eprintln!("skipped {bad_lines} malformed lines");
    }
    ExitCode::SUCCESS
}

fn collect_logs(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("alloc_") && name.ends_with(".log") {
            files.push(path);
        }
    }
    files.sort();
}

fn default_maps_path(inputs: &[PathBuf]) -> Option<PathBuf> {
    inputs
        .iter()
        .find(|input| input.is_dir())
        .map(|dir| dir.join("maps.log"))
}

fn read_events(file: &Path, text: &str, events: &mut Vec<Event>) -> usize {
    let mut bad = 0;
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        match parse::parse_event(line) {
            Ok(event) => events.push(event),
            Err(err) => {
                eprintln!("{}:{}: {err}", file.display(), lineno + 1);
                bad += 1;
            }
        }
    }
    bad
}

fn read_modules(path: PathBuf) -> HashMap<usize, String> {
    let mut modules = HashMap::new();
    let Ok(text) = fs::read_to_string(&path) else {
        return modules;
    };
    for line in text.lines() {
        if let Ok((id, name)) = parse::parse_map_line(line) {
            modules.insert(id, name);
        }
    }
    modules
}
