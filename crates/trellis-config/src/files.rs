//! The two config files: `trellis.toml` in the project and the user profile.

use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{ConfigError, Result};

/// `trellis.toml` at the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    pub namespace: Option<String>,
    pub workflow_id: Option<String>,
    /// Entry module, relative to the project root.
    pub entry: Option<String>,
    #[serde(default)]
    pub dev: DevSection,
}

/// `[dev]` table of the project file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Externally reachable base URL for webhooks, e.g. a tunnel.
    pub public_url: Option<String>,
    pub inspect_port: Option<u16>,
}

/// User profile with backend credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub namespace: Option<String>,
    pub backend_url: Option<String>,
    pub websocket_url: Option<String>,
    pub api_token: Option<String>,
}

/// Parse `path`, or `None` when it does not exist.
pub fn load_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
}

/// Write `value` as TOML, creating parent directories.
pub fn save<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(value)?;
    std::fs::write(path, contents).map_err(|source| ConfigError::WriteFile {
        path: path.display().to_string(),
        source,
    })
}
