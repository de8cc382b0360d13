//! Enriched error reports for handler failures.
//!
//! Only used for logging. Nothing here may fail: lookups that do not
//! resolve are left out of the report.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use regex::Regex;
use trellis_sandbox::VirtualFs;
use trellis_types::{ErrorReporter, EventContext, HandlerError};

use crate::sourcemap::SourceMapRegistry;

/// Lines of source shown on each side of the failing line.
pub const CONTEXT_LINES: u32 = 3;

fn frame_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([A-Za-z0-9_./\-]+\.lua):(\d+):").ok())
        .as_ref()
}

/// A `file:line` position found in an error message or traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: String,
    pub line: u32,
}

/// Extract `.lua:line:` positions in order of appearance, without duplicates.
pub fn parse_frames(text: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    let Some(pattern) = frame_pattern() else {
        return frames;
    };
    for caps in pattern.captures_iter(text) {
        let Ok(line) = caps[2].parse::<u32>() else {
            continue;
        };
        let frame = Frame {
            file: caps[1].trim_start_matches("./").to_string(),
            line,
        };
        if !frames.contains(&frame) {
            frames.push(frame);
        }
    }
    frames
}

/// Renders `source` around `line` with a marker on the failing line.
pub fn source_context(source: &str, line: u32) -> Option<String> {
    let total = source.lines().count() as u32;
    if line == 0 || line > total {
        return None;
    }
    let first = line.saturating_sub(CONTEXT_LINES).max(1);
    let last = (line + CONTEXT_LINES).min(total);
    let width = last.to_string().len();

    let mut out = String::new();
    for (idx, text) in source.lines().enumerate() {
        let number = idx as u32 + 1;
        if number < first || number > last {
            continue;
        }
        let marker = if number == line { ">" } else { " " };
        let _ = writeln!(out, "{marker} {number:>width$} | {text}");
    }
    Some(out)
}

/// `root/file`, if it exists and does not resolve outside `root`.
fn contained(root: &Path, file: &str) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let path = root.join(file).canonicalize().ok()?;
    path.starts_with(&root).then_some(path)
}

/// [`ErrorReporter`] that adds stack frames, mapped positions and inline source.
#[derive(Default)]
pub struct ErrorEnricher {
    project_root: Option<PathBuf>,
    files: RwLock<Option<Arc<VirtualFs>>>,
    source_maps: Arc<SourceMapRegistry>,
}

impl ErrorEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve files on disk relative to `root`.
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn with_source_maps(mut self, maps: Arc<SourceMapRegistry>) -> Self {
        self.source_maps = maps;
        self
    }

    pub fn source_maps(&self) -> &Arc<SourceMapRegistry> {
        &self.source_maps
    }

    /// Snapshot of the project files from the latest execution cycle.
    pub fn set_files(&self, files: Arc<VirtualFs>) {
        *self.files.write() = Some(files);
    }

    fn read_source(&self, file: &str) -> Option<String> {
        if let Some(path) = self.project_root.as_deref().and_then(|root| contained(root, file))
            && let Ok(text) = std::fs::read_to_string(path)
        {
            return Some(text);
        }
        self.files
            .read()
            .as_ref()
            .and_then(|fs| fs.get(file))
            .map(|source| source.to_string())
    }
}

impl ErrorReporter for ErrorEnricher {
    fn report(&self, error: &HandlerError, context: &EventContext) -> String {
        let mut out = format!(
            "{} handler failed ({} event, trigger {}): {}",
            context.trigger_kind,
            context.event_kind,
            context.trigger_id.short(),
            error.message
        );

        if let Some(traceback) = &error.traceback {
            out.push('\n');
            for line in traceback.lines() {
                let _ = write!(out, "\n  {}", line.trim_end());
            }
        }

        let mut text = error.message.clone();
        if let Some(traceback) = &error.traceback {
            text.push('\n');
            text.push_str(traceback);
        }
        let frames = parse_frames(&text);

        let mapped: Vec<String> = frames
            .iter()
            .filter_map(|f| {
                self.source_maps
                    .lookup(&f.file, f.line)
                    .map(|orig| format!("{}:{} -> {}:{}", f.file, f.line, orig.source, orig.line))
            })
            .collect();
        if !mapped.is_empty() {
            out.push_str("\n\nSource map:");
            for entry in mapped {
                let _ = write!(out, "\n  {entry}");
            }
        }

        if let Some(frame) = frames.first()
            && let Some(context) = self
                .read_source(&frame.file)
                .and_then(|source| source_context(&source, frame.line))
        {
            let _ = write!(out, "\n\n{}:{}\n{}", frame.file, frame.line, context.trim_end());
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::{EventKind, TriggerId, TriggerKind};

    fn context() -> EventContext {
        EventContext {
            event_kind: EventKind::Cron,
            trigger_kind: TriggerKind::Cron,
            trigger_id: TriggerId::new(),
        }
    }

    #[test]
    fn test_parse_frames() {
        let frames = parse_frames(
            "lib/util.lua:4: boom\nstack traceback:\n\t[C]: in function 'error'\n\tlib/util.lua:4: in function <lib/util.lua:2>\n\tmain.lua:9: in function <main.lua:7>",
        );
        assert_eq!(
            frames,
            vec![
                Frame {
                    file: "lib/util.lua".into(),
                    line: 4
                },
                Frame {
                    file: "main.lua".into(),
                    line: 9
                },
            ]
        );
    }

    #[test]
    fn test_source_context_window() {
        let source = (1..=10).map(|n| format!("line{n}")).collect::<Vec<_>>().join("\n");
        let ctx = source_context(&source, 5).unwrap();
        let lines: Vec<&str> = ctx.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "  2 | line2");
        assert_eq!(lines[3], "> 5 | line5");
        assert_eq!(lines[6], "  8 | line8");

        let edge = source_context(&source, 1).unwrap();
        assert_eq!(edge.lines().count(), 4);
        assert!(source_context(&source, 11).is_none());
    }

    #[test]
    fn test_report_uses_vfs_snapshot() {
        let enricher = ErrorEnricher::new();
        enricher.set_files(Arc::new(
            [("main.lua", "local x = 1\nerror('boom')\nreturn x\n")]
                .into_iter()
                .collect(),
        ));
        enricher
            .source_maps()
            .register("main.lua", r#"{"sources":["main.tl"]}"#)
            .unwrap();

        let err = HandlerError::new("main.lua:2: boom")
            .with_traceback("stack traceback:\n\tmain.lua:2: in main chunk");
        let report = enricher.report(&err, &context());

        assert!(report.starts_with("cron handler failed (cron event, trigger "));
        assert!(report.contains("main.lua:2: boom"));
        assert!(report.contains("stack traceback:"));
        assert!(report.contains("main.lua:2 -> main.tl:2"));
        assert!(report.contains("> 2 | error('boom')"), "{report}");
    }

    #[test]
    fn test_report_prefers_disk_under_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.lua"), "print('a')\nerror('disk')\n").unwrap();
        let enricher = ErrorEnricher::new().with_project_root(dir.path());
        enricher.set_files(Arc::new(
            [("main.lua", "print('a')\nerror('vfs')\n")].into_iter().collect(),
        ));

        let report = enricher.report(&HandlerError::new("main.lua:2: disk"), &context());
        assert!(report.contains("error('disk')"), "{report}");
    }

    #[test]
    fn test_report_ignores_paths_outside_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(dir.path().join("secret.lua"), "local token = 'hunter2'\n").unwrap();
        let enricher = ErrorEnricher::new().with_project_root(&root);

        let report = enricher.report(&HandlerError::new("../secret.lua:1: nope"), &context());
        assert!(!report.contains("hunter2"), "{report}");
        assert!(contained(&root, "../secret.lua").is_none());
        assert!(contained(dir.path(), "secret.lua").is_some());
    }

    #[test]
    fn test_report_without_resolvable_source() {
        let enricher = ErrorEnricher::new();
        let report = enricher.report(&HandlerError::new("attempt to call a nil value"), &context());
        assert!(report.ends_with("attempt to call a nil value"));
    }
}
