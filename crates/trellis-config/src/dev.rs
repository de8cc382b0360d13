//! Resolution of the dev session configuration.
//!
//! Each value is taken from the first source that has it:
//! CLI flag, environment, project file, user profile, default.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::files::{ProjectFile, Profile, load_optional};
use crate::paths::{PROFILE_FILE, project_file_path, xdg_config_dir};

pub const DEFAULT_ENTRY: &str = "main.lua";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_INSPECT_PORT: u16 = 9229;

pub const ENV_NAMESPACE: &str = "TRELLIS_NAMESPACE";
pub const ENV_BACKEND_URL: &str = "TRELLIS_BACKEND_URL";
pub const ENV_WS_URL: &str = "TRELLIS_WS_URL";
pub const ENV_API_TOKEN: &str = "TRELLIS_API_TOKEN";
pub const ENV_WORKFLOW_ID: &str = "TRELLIS_WORKFLOW_ID";
pub const ENV_PORT: &str = "TRELLIS_PORT";

/// Where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFrom {
    Flag,
    Env(&'static str),
    ProjectFile,
    Profile,
    Default,
}

impl fmt::Display for ResolvedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag => write!(f, "command line"),
            Self::Env(var) => write!(f, "${var}"),
            Self::ProjectFile => write!(f, "trellis.toml"),
            Self::Profile => write!(f, "profile"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct DevOverrides {
    pub entry: Option<String>,
    pub workflow_id: Option<String>,
    pub namespace: Option<String>,
    pub port: Option<u16>,
    pub inspect_port: Option<u16>,
    /// Profile directory; defaults to [`xdg_config_dir`].
    pub config_dir: Option<PathBuf>,
}

/// Fully resolved dev session settings.
#[derive(Debug, Clone)]
pub struct DevConfig {
    pub project_dir: PathBuf,
    pub entry: String,
    pub namespace: String,
    pub workflow_id: Option<String>,
    pub backend_url: Option<String>,
    pub websocket_url: Option<String>,
    pub api_token: Option<String>,
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,
    pub inspect_port: u16,
    /// Provenance of every key that was set.
    pub sources: BTreeMap<&'static str, ResolvedFrom>,
}

struct Resolver<'a> {
    overrides: &'a DevOverrides,
    project: ProjectFile,
    profile: Profile,
    env: &'a dyn Fn(&str) -> Option<String>,
    sources: BTreeMap<&'static str, ResolvedFrom>,
}

impl Resolver<'_> {
    fn env(&self, var: &'static str) -> Option<(String, ResolvedFrom)> {
        (self.env)(var)
            .filter(|v| !v.is_empty())
            .map(|v| (v, ResolvedFrom::Env(var)))
    }

    fn record<T>(&mut self, key: &'static str, found: Option<(T, ResolvedFrom)>) -> Option<T> {
        let (value, from) = found?;
        self.sources.insert(key, from);
        Some(value)
    }

    fn or_default<T>(&mut self, key: &'static str, found: Option<T>, default: T) -> T {
        match found {
            Some(value) => value,
            None => {
                self.sources.insert(key, ResolvedFrom::Default);
                default
            }
        }
    }
}

fn tag<T>(value: Option<T>, from: ResolvedFrom) -> Option<(T, ResolvedFrom)> {
    value.map(|v| (v, from))
}

impl DevConfig {
    /// Resolve against the process environment.
    pub fn resolve(project_dir: &Path, overrides: &DevOverrides) -> Result<Self> {
        Self::resolve_with_env(project_dir, overrides, &|var| std::env::var(var).ok())
    }

    pub fn resolve_with_env(
        project_dir: &Path,
        overrides: &DevOverrides,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if !project_dir.is_dir() {
            return Err(ConfigError::ProjectDirMissing(
                project_dir.display().to_string(),
            ));
        }
        let project: ProjectFile =
            load_optional(&project_file_path(project_dir))?.unwrap_or_default();
        let profile_path = overrides
            .config_dir
            .clone()
            .or_else(xdg_config_dir)
            .map(|d| d.join(PROFILE_FILE));
        let profile: Profile = match profile_path {
            Some(path) => load_optional(&path)?.unwrap_or_default(),
            None => Profile::default(),
        };

        let mut r = Resolver {
            overrides,
            project,
            profile,
            env,
            sources: BTreeMap::new(),
        };

        let found = tag(r.overrides.entry.clone(), ResolvedFrom::Flag)
            .or_else(|| tag(r.project.entry.clone(), ResolvedFrom::ProjectFile));
        let entry = r.record("entry", found);
        let entry = r.or_default("entry", entry, DEFAULT_ENTRY.to_string());

        let found = tag(r.overrides.namespace.clone(), ResolvedFrom::Flag)
            .or_else(|| r.env(ENV_NAMESPACE))
            .or_else(|| tag(r.project.namespace.clone(), ResolvedFrom::ProjectFile))
            .or_else(|| tag(r.profile.namespace.clone(), ResolvedFrom::Profile));
        let namespace = r.record("namespace", found);
        let namespace = r.or_default("namespace", namespace, DEFAULT_NAMESPACE.to_string());

        let found = tag(r.overrides.workflow_id.clone(), ResolvedFrom::Flag)
            .or_else(|| r.env(ENV_WORKFLOW_ID))
            .or_else(|| tag(r.project.workflow_id.clone(), ResolvedFrom::ProjectFile));
        let workflow_id = r.record("workflow_id", found);

        let found = r
            .env(ENV_BACKEND_URL)
            .or_else(|| tag(r.profile.backend_url.clone(), ResolvedFrom::Profile));
        let backend_url = r.record("backend_url", found);

        let found = r
            .env(ENV_WS_URL)
            .or_else(|| tag(r.profile.websocket_url.clone(), ResolvedFrom::Profile));
        let websocket_url = r.record("websocket_url", found);

        let found = r
            .env(ENV_API_TOKEN)
            .or_else(|| tag(r.profile.api_token.clone(), ResolvedFrom::Profile));
        let api_token = r.record("api_token", found);

        let found = tag(r.project.dev.host.clone(), ResolvedFrom::ProjectFile);
        let host = r.record("host", found);
        let host = r.or_default("host", host, DEFAULT_HOST.to_string());

        let env_port = match r.env(ENV_PORT) {
            Some((value, from)) => match value.parse::<u16>() {
                Ok(port) => Some((port, from)),
                Err(_) => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_PORT.to_string(),
                        value,
                    });
                }
            },
            None => None,
        };
        let found = tag(r.overrides.port, ResolvedFrom::Flag)
            .or(env_port)
            .or_else(|| tag(r.project.dev.port, ResolvedFrom::ProjectFile));
        let port = r.record("port", found);
        let port = r.or_default("port", port, DEFAULT_PORT);

        let found = tag(r.project.dev.public_url.clone(), ResolvedFrom::ProjectFile);
        let public_url = r.record("public_url", found);

        let found = tag(r.overrides.inspect_port, ResolvedFrom::Flag)
            .or_else(|| tag(r.project.dev.inspect_port, ResolvedFrom::ProjectFile));
        let inspect_port = r.record("inspect_port", found);
        let inspect_port = r.or_default("inspect_port", inspect_port, DEFAULT_INSPECT_PORT);

        let config = Self {
            project_dir: project_dir.to_path_buf(),
            entry,
            namespace,
            workflow_id,
            backend_url,
            websocket_url,
            api_token,
            host,
            port,
            public_url,
            inspect_port,
            sources: r.sources,
        };
        config.log_summary();
        Ok(config)
    }

    /// Backend calls are only possible with a URL to call.
    pub fn has_backend(&self) -> bool {
        self.backend_url.is_some()
    }

    fn log_summary(&self) {
        for (key, from) in &self.sources {
            let value = match *key {
                "api_token" => "<redacted>".to_string(),
                "entry" => self.entry.clone(),
                "namespace" => self.namespace.clone(),
                "workflow_id" => self.workflow_id.clone().unwrap_or_default(),
                "backend_url" => self.backend_url.clone().unwrap_or_default(),
                "websocket_url" => self.websocket_url.clone().unwrap_or_default(),
                "host" => self.host.clone(),
                "port" => self.port.to_string(),
                "public_url" => self.public_url.clone().unwrap_or_default(),
                "inspect_port" => self.inspect_port.to_string(),
                _ => String::new(),
            };
            debug!(key, %value, from = %from, "Config resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn setup(project_toml: Option<&str>, profile_toml: Option<&str>) -> (tempfile::TempDir, DevOverrides) {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        if let Some(text) = project_toml {
            std::fs::write(dir.path().join("trellis.toml"), text).unwrap();
        }
        if let Some(text) = profile_toml {
            std::fs::write(config_dir.join("profile.toml"), text).unwrap();
        }
        let overrides = DevOverrides {
            config_dir: Some(config_dir),
            ..Default::default()
        };
        (dir, overrides)
    }

    #[test]
    fn test_defaults_without_any_source() {
        let (dir, overrides) = setup(None, None);
        let config = DevConfig::resolve_with_env(dir.path(), &overrides, &no_env).unwrap();
        assert_eq!(config.entry, "main.lua");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.port, 3000);
        assert_eq!(config.inspect_port, 9229);
        assert!(config.workflow_id.is_none());
        assert!(!config.has_backend());
        assert_eq!(config.sources["port"], ResolvedFrom::Default);
    }

    #[test]
    fn test_precedence_flag_env_project_profile() {
        let (dir, mut overrides) = setup(
            Some("namespace = \"from-project\"\nworkflow_id = \"wf_project\"\n[dev]\nport = 4000\n"),
            Some("namespace = \"from-profile\"\nbackend_url = \"https://profile.example.com\"\napi_token = \"tok\"\n"),
        );
        let env: HashMap<&str, &str> = [
            (ENV_WORKFLOW_ID, "wf_env"),
            (ENV_BACKEND_URL, "https://env.example.com"),
        ]
        .into_iter()
        .collect();
        let lookup = |var: &str| env.get(var).map(|v| v.to_string());

        let config = DevConfig::resolve_with_env(dir.path(), &overrides, &lookup).unwrap();
        assert_eq!(config.namespace, "from-project");
        assert_eq!(config.sources["namespace"], ResolvedFrom::ProjectFile);
        assert_eq!(config.workflow_id.as_deref(), Some("wf_env"));
        assert_eq!(config.sources["workflow_id"], ResolvedFrom::Env(ENV_WORKFLOW_ID));
        assert_eq!(config.backend_url.as_deref(), Some("https://env.example.com"));
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert_eq!(config.sources["api_token"], ResolvedFrom::Profile);
        assert_eq!(config.port, 4000);

        overrides.workflow_id = Some("wf_flag".into());
        overrides.port = Some(5000);
        let config = DevConfig::resolve_with_env(dir.path(), &overrides, &lookup).unwrap();
        assert_eq!(config.workflow_id.as_deref(), Some("wf_flag"));
        assert_eq!(config.sources["workflow_id"], ResolvedFrom::Flag);
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let (dir, overrides) = setup(None, Some("namespace = \"acme\"\n"));
        let lookup = |var: &str| (var == ENV_NAMESPACE).then(String::new);
        let config = DevConfig::resolve_with_env(dir.path(), &overrides, &lookup).unwrap();
        assert_eq!(config.namespace, "acme");
    }

    #[test]
    fn test_invalid_port_env() {
        let (dir, overrides) = setup(None, None);
        let lookup = |var: &str| (var == ENV_PORT).then(|| "http".to_string());
        let err = DevConfig::resolve_with_env(dir.path(), &overrides, &lookup).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_missing_project_dir() {
        let overrides = DevOverrides::default();
        let err = DevConfig::resolve_with_env(Path::new("/definitely/not/here"), &overrides, &no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ProjectDirMissing(_)));
    }

    #[test]
    fn test_resolved_from_display() {
        assert_eq!(ResolvedFrom::Env(ENV_API_TOKEN).to_string(), "$TRELLIS_API_TOKEN");
        assert_eq!(ResolvedFrom::ProjectFile.to_string(), "trellis.toml");
    }
}
