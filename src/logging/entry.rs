//! Structured log entries.

use std::time::SystemTime;

use backtrace::Backtrace;

/// Severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Verbose => "verbose",
        }
    }
}

/// One log entry as submitted by a producer thread.
///
/// A captured backtrace stays unresolved until the channel worker resolves
/// it; producers never pay symbolication cost.
#[derive(Debug)]
pub struct Entry {
    pub timestamp: SystemTime,
    pub level: Level,
    pub source_file: &'static str,
    pub source_line: u32,
    pub message: String,
    pub diagnostics: Vec<(String, String)>,
    pub trace: Option<Backtrace>,
    pub(crate) trace_resolved: bool,
}

impl Entry {
    pub fn new(level: Level, message: impl Into<String>) -> Entry {
        Entry {
            timestamp: SystemTime::now(),
            level,
            source_file: "",
            source_line: 0,
            message: message.into(),
            diagnostics: Vec::new(),
            trace: None,
            trace_resolved: false,
        }
    }

    pub fn with_source(mut self, file: &'static str, line: u32) -> Entry {
        self.source_file = file;
        self.source_line = line;
        self
    }

    pub fn with_diagnostic(mut self, key: impl Into<String>, value: impl Into<String>) -> Entry {
        self.diagnostics.push((key.into(), value.into()));
        self
    }

    /// Captures the submitting thread's backtrace, unresolved.
    pub fn with_trace(mut self) -> Entry {
        self.trace = Some(Backtrace::new_unresolved());
        self.trace_resolved = false;
        self
    }
}
