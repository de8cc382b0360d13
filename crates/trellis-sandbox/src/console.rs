//! Console output from user code.
//!
//! `print` and the SDK's `log.*` functions write through a [`Console`]. Every
//! entry is logged via `tracing` and forwarded to attached sinks (the
//! inspector attaches one to stream output to debugger clients).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Log => "log",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    /// `file:line` of the calling Lua code, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConsoleEntry {
    pub fn new(level: ConsoleLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            location: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }
}

/// Receives console entries.
pub trait ConsoleSink: Send + Sync {
    fn emit(&self, entry: &ConsoleEntry);
}

/// Fan-out handle shared by the engine and the inspector.
#[derive(Clone, Default)]
pub struct Console {
    sinks: Arc<RwLock<Vec<Arc<dyn ConsoleSink>>>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn ConsoleSink>) {
        self.sinks.write().push(sink);
    }

    pub fn detach_all(&self) {
        self.sinks.write().clear();
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn emit(&self, entry: ConsoleEntry) {
        let location = entry.location.as_deref().unwrap_or("-");
        match entry.level {
            ConsoleLevel::Error => {
                tracing::error!(target: "trellis::console", location, "{}", entry.message)
            }
            ConsoleLevel::Warn => {
                tracing::warn!(target: "trellis::console", location, "{}", entry.message)
            }
            ConsoleLevel::Debug => {
                tracing::debug!(target: "trellis::console", location, "{}", entry.message)
            }
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "trellis::console", location, "{}", entry.message)
            }
        }
        for sink in self.sinks.read().iter() {
            sink.emit(&entry);
        }
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ConsoleSink for Collect {
        fn emit(&self, entry: &ConsoleEntry) {
            self.0.lock().push(format!("{}:{}", entry.level, entry.message));
        }
    }

    #[test]
    fn test_emit_forwards_to_sinks() {
        let console = Console::new();
        let sink = Arc::new(Collect::default());
        console.attach(sink.clone());
        console.emit(ConsoleEntry::new(ConsoleLevel::Warn, "careful"));
        console.emit(ConsoleEntry::new(ConsoleLevel::Log, "hi"));
        assert_eq!(*sink.0.lock(), vec!["warn:careful", "log:hi"]);
    }

    #[test]
    fn test_detach_all() {
        let console = Console::new();
        console.attach(Arc::new(Collect::default()));
        assert_eq!(console.sink_count(), 1);
        console.detach_all();
        assert_eq!(console.sink_count(), 0);
    }
}
