//! In-memory project files and module resolution.
//!
//! User code never touches the host filesystem: every `require` goes
//! through a [`ModuleResolver`], and the default [`VfsResolver`] only sees
//! the files placed in a [`VirtualFs`].
//!
//! Resolution rules for [`VfsResolver`]:
//!
//! | Name | Lookup |
//! |------|--------|
//! | `/main.lua` | exact path from project root |
//! | `./util`, `../lib/x` | relative to the requiring file's directory |
//! | `lib.util` | `lib/util.lua`, then `lib/util/init.lua` |

use std::collections::BTreeMap;
use std::sync::Arc;

/// Normalise a project-relative path.
///
/// Converts separators to `/`, drops `.` segments and resolves `..`.
/// Returns `None` for empty paths or paths that escape the project root.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    let unified = path.replace('\\', "/");
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Directory component of a normalised path (`""` for top-level files).
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Map of normalised relative paths to UTF-8 source.
#[derive(Debug, Clone, Default)]
pub struct VirtualFs {
    files: BTreeMap<String, Arc<str>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file. Paths that do not normalise are ignored and `false` returned.
    pub fn insert(&mut self, path: &str, source: impl Into<Arc<str>>) -> bool {
        match normalize_path(path) {
            Some(normalized) => {
                self.files.insert(normalized, source.into());
                true
            }
            None => false,
        }
    }

    pub fn with_file(mut self, path: &str, source: impl Into<Arc<str>>) -> Self {
        self.insert(path, source);
        self
    }

    pub fn get(&self, path: &str) -> Option<Arc<str>> {
        let normalized = normalize_path(path)?;
        self.files.get(&normalized).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        normalize_path(path).is_some_and(|p| self.files.contains_key(&p))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<P: AsRef<str>, S: Into<Arc<str>>> FromIterator<(P, S)> for VirtualFs {
    fn from_iter<I: IntoIterator<Item = (P, S)>>(iter: I) -> Self {
        let mut fs = VirtualFs::new();
        for (path, source) in iter {
            fs.insert(path.as_ref(), source);
        }
        fs
    }
}

/// A module located by a resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModule {
    /// Normalised path; also the module's cache key and chunk name.
    pub path: String,
    pub source: Arc<str>,
}

/// Resolves `require` names to source.
///
/// `from` is the normalised path of the requiring file, or `None` when the
/// request comes from the synthesized entry wrapper.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, from: Option<&str>, name: &str) -> Option<ResolvedModule>;
}

/// Default resolver over a [`VirtualFs`].
#[derive(Debug, Clone)]
pub struct VfsResolver {
    fs: Arc<VirtualFs>,
}

impl VfsResolver {
    pub fn new(fs: Arc<VirtualFs>) -> Self {
        Self { fs }
    }

    fn lookup(&self, candidate: &str) -> Option<ResolvedModule> {
        let path = normalize_path(candidate)?;
        let source = self.fs.files.get(&path)?.clone();
        Some(ResolvedModule { path, source })
    }

    /// Try `base` as-is when it names a `.lua` file, then `base.lua`, then `base/init.lua`.
    fn lookup_module(&self, base: &str) -> Option<ResolvedModule> {
        if base.ends_with(".lua") {
            if let Some(found) = self.lookup(base) {
                return Some(found);
            }
        }
        self.lookup(&format!("{base}.lua"))
            .or_else(|| self.lookup(&format!("{base}/init.lua")))
    }
}

impl ModuleResolver for VfsResolver {
    fn resolve(&self, from: Option<&str>, name: &str) -> Option<ResolvedModule> {
        if name.is_empty() {
            return None;
        }
        if let Some(rooted) = name.strip_prefix('/') {
            return self.lookup_module(rooted);
        }
        if name.starts_with("./") || name.starts_with("../") {
            let dir = from.map(parent_dir).unwrap_or("");
            let joined = if dir.is_empty() {
                name.to_string()
            } else {
                format!("{dir}/{name}")
            };
            return self.lookup_module(&joined);
        }
        if name.contains('/') {
            return self.lookup_module(name);
        }
        self.lookup_module(&name.replace('.', "/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> VfsResolver {
        let fs: VirtualFs = [
            ("main.lua", "return 1"),
            ("lib/util.lua", "return 2"),
            ("lib/strings/init.lua", "return 3"),
            ("handlers/orders.lua", "return 4"),
        ]
        .into_iter()
        .collect();
        VfsResolver::new(Arc::new(fs))
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./a/b.lua").as_deref(), Some("a/b.lua"));
        assert_eq!(normalize_path("a/../b.lua").as_deref(), Some("b.lua"));
        assert_eq!(normalize_path("a\\b.lua").as_deref(), Some("a/b.lua"));
        assert_eq!(normalize_path("/a//b.lua").as_deref(), Some("a/b.lua"));
        assert_eq!(normalize_path("../escape.lua"), None);
        assert_eq!(normalize_path(""), None);
        assert_eq!(normalize_path("."), None);
    }

    #[test]
    fn test_dotted_names() {
        let r = resolver();
        assert_eq!(r.resolve(None, "lib.util").unwrap().path, "lib/util.lua");
        assert_eq!(
            r.resolve(None, "lib.strings").unwrap().path,
            "lib/strings/init.lua"
        );
        assert!(r.resolve(None, "lib.missing").is_none());
    }

    #[test]
    fn test_relative_names() {
        let r = resolver();
        let found = r.resolve(Some("handlers/orders.lua"), "../lib/util").unwrap();
        assert_eq!(found.path, "lib/util.lua");
        assert_eq!(&*found.source, "return 2");

        let found = r.resolve(Some("main.lua"), "./lib/util.lua").unwrap();
        assert_eq!(found.path, "lib/util.lua");
    }

    #[test]
    fn test_relative_cannot_escape_root() {
        let r = resolver();
        assert!(r.resolve(Some("main.lua"), "../main").is_none());
    }

    #[test]
    fn test_rooted_names() {
        let r = resolver();
        assert_eq!(r.resolve(None, "/main.lua").unwrap().path, "main.lua");
        assert_eq!(
            r.resolve(Some("lib/util.lua"), "/handlers/orders").unwrap().path,
            "handlers/orders.lua"
        );
    }

    #[test]
    fn test_vfs_insert_rejects_escaping_paths() {
        let mut fs = VirtualFs::new();
        assert!(!fs.insert("../x.lua", "x"));
        assert!(fs.insert("./x.lua", "x"));
        assert!(fs.contains("x.lua"));
        assert_eq!(fs.len(), 1);
    }
}
