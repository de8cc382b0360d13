//! Loading project files from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use trellis_sandbox::VirtualFs;
use walkdir::{DirEntry, WalkDir};

pub const SOURCE_EXTENSION: &str = "lua";

/// Suffix of a source map sitting next to its generated file (`main.lua.map`).
pub const SOURCE_MAP_SUFFIX: &str = ".lua.map";

/// Directories never scanned for sources.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

/// One snapshot of a project directory.
#[derive(Debug, Default)]
pub struct ProjectFiles {
    pub sources: VirtualFs,
    /// Source map JSON keyed by the generated file it describes.
    pub source_maps: BTreeMap<String, String>,
}

/// The `.lua` files of a project directory.
///
/// Sources are re-read on every [`load`](Self::load) so each execution
/// cycle sees the files as they are on disk.
#[derive(Debug, Clone)]
pub struct ProjectSource {
    root: PathBuf,
}

impl ProjectSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read every source file and source map under the root.
    ///
    /// Files that are not valid UTF-8 are skipped with a warning.
    pub fn load(&self) -> std::io::Result<ProjectFiles> {
        let mut files = ProjectFiles::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable path");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let map = is_source_map(entry.path());
            if !map && !is_source(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let Some(text) = read_text(entry.path())? else {
                warn!(path = %relative, "Skipping file that is not valid UTF-8");
                continue;
            };

            if map {
                let generated = relative.trim_end_matches(".map").to_string();
                files.source_maps.insert(generated, text);
            } else if !files.sources.insert(&relative, text) {
                warn!(path = %relative, "Ignoring file with unusable path");
            }
        }

        debug!(
            root = %self.root.display(),
            files = files.sources.len(),
            source_maps = files.source_maps.len(),
            "Loaded project sources"
        );
        Ok(files)
    }
}

/// `None` when the file is not UTF-8. Read errors name the file.
fn read_text(path: &Path) -> std::io::Result<Option<String>> {
    let bytes = std::fs::read(path).map_err(|e| {
        std::io::Error::new(e.kind(), format!("failed to read {}: {e}", path.display()))
    })?;
    Ok(String::from_utf8(bytes).ok())
}

fn is_source_map(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(SOURCE_MAP_SUFFIX))
}

pub(crate) fn is_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION)
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_lua_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/util")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("main.lua"), "return 1").unwrap();
        std::fs::write(dir.path().join("lib/util/strings.lua"), "return {}").unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
        std::fs::write(dir.path().join(".git/hook.lua"), "").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/x.lua"), "").unwrap();

        let fs = ProjectSource::new(dir.path()).load().unwrap().sources;
        let paths: Vec<&str> = fs.paths().collect();
        assert_eq!(paths, vec!["lib/util/strings.lua", "main.lua"]);
        assert_eq!(fs.get("main.lua").as_deref(), Some("return 1"));
    }

    #[test]
    fn test_reload_sees_edits() {
        let dir = tempfile::tempdir().unwrap();
        let source = ProjectSource::new(dir.path());
        std::fs::write(dir.path().join("main.lua"), "return 1").unwrap();
        assert_eq!(source.load().unwrap().sources.get("main.lua").as_deref(), Some("return 1"));
        std::fs::write(dir.path().join("main.lua"), "return 2").unwrap();
        assert_eq!(source.load().unwrap().sources.get("main.lua").as_deref(), Some("return 2"));
    }

    #[test]
    fn test_source_maps_keyed_by_generated_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("main.lua"), "return 1").unwrap();
        std::fs::write(dir.path().join("main.lua.map"), r#"{"sources":["main.tl"]}"#).unwrap();
        std::fs::write(dir.path().join("lib/util.lua.map"), "{}").unwrap();

        let files = ProjectSource::new(dir.path()).load().unwrap();
        assert_eq!(files.sources.len(), 1);
        let generated: Vec<&str> = files.source_maps.keys().map(String::as_str).collect();
        assert_eq!(generated, vec!["lib/util.lua", "main.lua"]);
        assert_eq!(files.source_maps["main.lua"], r#"{"sources":["main.tl"]}"#);
    }

    #[test]
    fn test_invalid_utf8_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.lua"), "return 1").unwrap();
        std::fs::write(dir.path().join("latin1.lua"), [0x2d, 0x2d, 0xe9, 0xff]).unwrap();

        let files = ProjectSource::new(dir.path()).load().unwrap();
        let paths: Vec<&str> = files.sources.paths().collect();
        assert_eq!(paths, vec!["main.lua"]);
    }

    #[test]
    fn test_is_source() {
        assert!(is_source(Path::new("a/b.lua")));
        assert!(!is_source(Path::new("a/b.luac")));
        assert!(!is_source(Path::new("lua")));
    }
}
