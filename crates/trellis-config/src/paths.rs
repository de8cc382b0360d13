//! Well-known locations.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "trellis";

/// Overrides the user config directory. Useful for tests and parallel setups.
pub const CONFIG_DIR_ENV: &str = "TRELLIS_CONFIG_DIR";

pub const PROFILE_FILE: &str = "profile.toml";
pub const PROJECT_FILE: &str = "trellis.toml";

/// User config directory: `TRELLIS_CONFIG_DIR`, else the platform config dir.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

pub fn profile_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(PROFILE_FILE))
}

/// Directory for rolling log files.
pub fn log_dir() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join("logs"))
}

pub fn project_file_path(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_FILE)
}
