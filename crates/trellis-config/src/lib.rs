//! Configuration for Trellis dev sessions.
//!
//! Sources, highest precedence first: command line, `TRELLIS_*` environment,
//! the project's `trellis.toml`, the user profile, built-in defaults.

pub mod dev;
pub mod error;
pub mod files;
pub mod paths;

pub use dev::{DevConfig, DevOverrides, ResolvedFrom};
pub use error::{ConfigError, Result};
pub use files::{DevSection, Profile, ProjectFile, load_optional, save};
pub use paths::{log_dir, profile_path, project_file_path, xdg_config_dir};
