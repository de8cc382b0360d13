//! File watcher that turns source edits into reload signals.
//!
//! Debounces rapid editor save patterns so one save means one reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DevError, Result};
use crate::source::is_source;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// One debounced batch of source changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSignal {
    pub paths: Vec<PathBuf>,
}

/// Watches a project directory for `.lua` changes.
pub struct EntryWatcher {
    root: PathBuf,
    debounce: Duration,
}

/// Keeps the watcher alive. Dropping the receiver stops it.
pub struct WatcherHandle {
    _thread: std::thread::JoinHandle<()>,
}

impl EntryWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    pub fn watch(&self) -> Result<(mpsc::Receiver<ReloadSignal>, WatcherHandle)> {
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut debouncer = new_debouncer(self.debounce, notify_tx)
            .map_err(|e| DevError::Watch(format!("watcher init: {e}")))?;
        debouncer
            .watcher()
            .watch(&self.root, notify::RecursiveMode::Recursive)
            .map_err(|e| DevError::Watch(format!("{}: {e}", self.root.display())))?;
        debug!(root = %self.root.display(), "Watching project sources");

        let root = self.root.clone();
        let thread = std::thread::spawn(move || {
            let _debouncer = debouncer;

            while let Ok(result) = notify_rx.recv() {
                let events = match result {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "File watcher error");
                        continue;
                    }
                };
                let mut paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .filter(|e| is_source(&e.path) && !is_hidden(&root, &e.path))
                    .map(|e| e.path)
                    .collect();
                if paths.is_empty() {
                    continue;
                }
                paths.sort();
                paths.dedup();
                if signal_tx.blocking_send(ReloadSignal { paths }).is_err() {
                    break;
                }
            }
        });

        Ok((signal_rx, WatcherHandle { _thread: thread }))
    }
}

/// Editors write swap and backup files into dot-directories.
fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}
