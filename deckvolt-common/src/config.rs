//! Configuration file and state directory resolution
//!
//! Both follow the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "DECKVOLT_CONFIG";

/// Environment variable naming the state directory
pub const STATE_DIR_ENV: &str = "DECKVOLT_STATE_DIR";

/// Locate the TOML config file
///
/// Returns `None` when no file exists at any candidate location; callers
/// then run on compiled defaults.
pub fn locate_config_file(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("deckvolt").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/deckvolt/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Parse a TOML file into `T`
///
/// Missing keys fall back to the serde defaults of `T`.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Resolve the directory holding persisted engine state
///
/// `config_value` is the `state_dir` key from an already-loaded TOML file.
pub fn resolve_state_dir(cli_arg: Option<&Path>, config_value: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(path);
    }

    // Priority 3: TOML config file
    if let Some(path) = config_value {
        return path.to_path_buf();
    }

    // Priority 4: OS-dependent compiled default
    default_state_dir()
}

/// Default state directory for the platform
///
/// Linux: `~/.local/share/deckvolt`, falling back to `/var/lib/deckvolt`
/// when no home directory is known.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("deckvolt"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/deckvolt"))
}
