//! Log drivers and policies.
//!
//! A driver is a sink for fully processed entries; a policy may rewrite an
//! entry in place or drop it. Both are only ever called from the channel
//! worker thread.

use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use super::entry::{Entry, Level};

pub trait Driver: Send {
    fn submit(&mut self, entry: &Entry);
    fn flush(&mut self) {}
}

pub trait Policy: Send {
    /// Returning `false` drops the entry.
    fn transform_filter(&mut self, entry: &mut Entry) -> bool;
}

/// Drops entries below a severity threshold.
pub struct LevelFilterPolicy {
    pub threshold: Level,
}

impl Policy for LevelFilterPolicy {
    fn transform_filter(&mut self, entry: &mut Entry) -> bool {
        entry.level <= self.threshold
    }
}

pub(crate) fn format_entry(entry: &Entry) -> String {
    let epoch_ms = entry
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut line = format!(
        "{epoch_ms} [{}] {}:{} {}",
        entry.level.as_str(),
        entry.source_file,
        entry.source_line,
        entry.message
    );
    for (k, v) in &entry.diagnostics {
        line.push_str(&format!(" {k}={v}"));
    }
    if let Some(trace) = &entry.trace {
        line.push_str(&format!("\n{trace:?}"));
    }
    line
}

/// Writes formatted entries to stderr.
#[derive(Default)]
pub struct StderrDriver;

impl Driver for StderrDriver {
    fn submit(&mut self, entry: &Entry) {
        eprintln!("{}", format_entry(entry));
    }
}

/// Buffers formatted entries in memory; test harnesses read them back
/// through the shared handle.
pub struct MemoryDriver {
    lines: Arc<Mutex<Vec<(Level, String)>>>,
}

impl MemoryDriver {
    pub fn new() -> (MemoryDriver, Arc<Mutex<Vec<(Level, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        (
            MemoryDriver {
                lines: Arc::clone(&lines),
            },
            lines,
        )
    }
}

impl Driver for MemoryDriver {
    fn submit(&mut self, entry: &Entry) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((entry.level, format_entry(entry)));
        }
    }
}
