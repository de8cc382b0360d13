//! Best-effort source map lookups.
//!
//! Maps are registered per generated file. Lookups are heuristic: a map
//! with a single source maps a line to the same line in that source,
//! shifted by the optional `x_line_offsets` extension (one signed delta per
//! generated line). `mappings` is never decoded.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{InspectorError, Result};

#[derive(Debug, Clone, Deserialize)]
struct SourceMap {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default, rename = "sourceRoot")]
    source_root: Option<String>,
    #[serde(default)]
    x_line_offsets: Vec<i64>,
}

/// A position in an original source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: String,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct SourceMapRegistry {
    maps: RwLock<HashMap<String, SourceMap>>,
}

impl SourceMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the map JSON for `generated_file`, replacing any previous one.
    pub fn register(&self, generated_file: &str, json: &str) -> Result<()> {
        let map: SourceMap =
            serde_json::from_str(json).map_err(|source| InspectorError::SourceMap {
                file: generated_file.to_string(),
                source,
            })?;
        self.maps.write().insert(generated_file.to_string(), map);
        Ok(())
    }

    pub fn clear(&self) {
        self.maps.write().clear();
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }

    pub fn lookup(&self, generated_file: &str, line: u32) -> Option<OriginalPosition> {
        let maps = self.maps.read();
        let map = maps.get(generated_file)?;
        let [source] = map.sources.as_slice() else {
            return None;
        };

        let offset = line
            .checked_sub(1)
            .and_then(|idx| map.x_line_offsets.get(idx as usize))
            .copied()
            .unwrap_or(0);
        let mapped = i64::from(line) + offset;
        if mapped < 1 {
            return None;
        }

        let source = match map.source_root.as_deref() {
            Some(root) if !root.is_empty() => format!("{}/{}", root.trim_end_matches('/'), source),
            _ => source.clone(),
        };
        Some(OriginalPosition {
            source,
            line: u32::try_from(mapped).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_source_maps_same_line() {
        let registry = SourceMapRegistry::new();
        registry
            .register("main.lua", r#"{"version":3,"sources":["main.tl"],"mappings":"AAAA"}"#)
            .unwrap();
        assert_eq!(
            registry.lookup("main.lua", 7),
            Some(OriginalPosition {
                source: "main.tl".into(),
                line: 7
            })
        );
        assert_eq!(registry.lookup("other.lua", 7), None);
    }

    #[test]
    fn test_line_offsets_and_source_root() {
        let registry = SourceMapRegistry::new();
        registry
            .register(
                "main.lua",
                r#"{"sources":["main.tl"],"sourceRoot":"src/","x_line_offsets":[0,2,-5]}"#,
            )
            .unwrap();
        assert_eq!(registry.lookup("main.lua", 2).unwrap().line, 4);
        assert_eq!(registry.lookup("main.lua", 2).unwrap().source, "src/main.tl");
        assert_eq!(registry.lookup("main.lua", 3), None);
        assert_eq!(registry.lookup("main.lua", 9).unwrap().line, 9);
    }

    #[test]
    fn test_multiple_sources_are_not_guessed() {
        let registry = SourceMapRegistry::new();
        registry
            .register("bundle.lua", r#"{"sources":["a.tl","b.tl"]}"#)
            .unwrap();
        assert_eq!(registry.lookup("bundle.lua", 1), None);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let registry = SourceMapRegistry::new();
        assert!(matches!(
            registry.register("main.lua", "not json"),
            Err(InspectorError::SourceMap { .. })
        ));
        assert!(registry.is_empty());
    }
}
