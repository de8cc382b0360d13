//! Virtual project loader.
//!
//! Turns a set of in-memory files plus an entry point into a
//! [`PreparedProject`]: the files, a resolver over them, and a synthesized
//! wrapper chunk that drives one registration cycle.

use std::fmt;
use std::sync::Arc;

use trellis_types::ProviderConfig;

use crate::error::{Result, SandboxError};
use crate::vfs::{ModuleResolver, VfsResolver, VirtualFs, normalize_path};

/// Module name of the internal registry bridge. Only the wrapper may require it.
pub const REGISTRY_MODULE: &str = "@trellis/registry";

/// Chunk name of the synthesized wrapper.
pub const WRAPPER_CHUNK_NAME: &str = "=trellis:entry";

/// User files plus the logical entry point.
#[derive(Debug, Clone)]
pub struct VirtualProject {
    pub files: VirtualFs,
    pub entry: String,
}

impl VirtualProject {
    pub fn new(files: VirtualFs, entry: impl Into<String>) -> Self {
        Self {
            files,
            entry: entry.into(),
        }
    }
}

/// A project ready for [`SandboxEngine::execute`](crate::SandboxEngine::execute).
#[derive(Clone)]
pub struct PreparedProject {
    files: Arc<VirtualFs>,
    entry: String,
    wrapper: String,
    provider_configs: Vec<ProviderConfig>,
    resolver: Arc<dyn ModuleResolver>,
}

impl PreparedProject {
    pub fn files(&self) -> &Arc<VirtualFs> {
        &self.files
    }

    /// Normalised entry path.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Source of the synthesized wrapper chunk.
    pub fn wrapper_source(&self) -> &str {
        &self.wrapper
    }

    pub fn provider_configs(&self) -> &[ProviderConfig] {
        &self.provider_configs
    }

    pub fn resolver(&self) -> &Arc<dyn ModuleResolver> {
        &self.resolver
    }

    /// Replace the default VFS resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl fmt::Debug for PreparedProject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedProject")
            .field("entry", &self.entry)
            .field("files", &self.files.len())
            .field("provider_configs", &self.provider_configs.len())
            .finish()
    }
}

/// Builds [`PreparedProject`]s.
#[derive(Debug, Clone, Default)]
pub struct ProjectLoader;

impl ProjectLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn prepare(
        &self,
        project: VirtualProject,
        provider_configs: Vec<ProviderConfig>,
    ) -> Result<PreparedProject> {
        let entry = normalize_path(&project.entry)
            .filter(|p| project.files.contains(p))
            .ok_or_else(|| SandboxError::EntryNotFound(project.entry.clone()))?;

        let wrapper = synthesize_wrapper(&entry);
        let files = Arc::new(project.files);
        let resolver: Arc<dyn ModuleResolver> = Arc::new(VfsResolver::new(files.clone()));

        Ok(PreparedProject {
            files,
            entry,
            wrapper,
            provider_configs,
            resolver,
        })
    }
}

/// The wrapper clears the registry and injects configs before the user
/// import so nothing from a previous cycle survives into this one.
fn synthesize_wrapper(entry: &str) -> String {
    let entry_literal = lua_string_literal(&format!("/{entry}"));
    format!(
        "local registry = require(\"{REGISTRY_MODULE}\")\n\
         registry.clear()\n\
         registry.inject_provider_configs()\n\
         require({entry_literal})\n\
         return registry.export()\n"
    )
}

fn lua_string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(entry: &str) -> VirtualProject {
        let files = VirtualFs::new().with_file("src/main.lua", "return nil");
        VirtualProject::new(files, entry)
    }

    #[test]
    fn test_prepare_normalises_entry() {
        let prepared = ProjectLoader::new()
            .prepare(project("./src/main.lua"), Vec::new())
            .unwrap();
        assert_eq!(prepared.entry(), "src/main.lua");
    }

    #[test]
    fn test_prepare_missing_entry() {
        let err = ProjectLoader::new()
            .prepare(project("main.lua"), Vec::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::EntryNotFound(ref e) if e == "main.lua"));
    }

    #[test]
    fn test_wrapper_statement_order() {
        let prepared = ProjectLoader::new()
            .prepare(project("src/main.lua"), Vec::new())
            .unwrap();
        let wrapper = prepared.wrapper_source();
        let clear = wrapper.find("registry.clear()").unwrap();
        let inject = wrapper.find("registry.inject_provider_configs()").unwrap();
        let import = wrapper.find("require(\"/src/main.lua\")").unwrap();
        let export = wrapper.find("return registry.export()").unwrap();
        assert!(clear < inject);
        assert!(inject < import);
        assert!(import < export);
    }

    #[test]
    fn test_lua_string_literal_escapes() {
        assert_eq!(lua_string_literal("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }
}
