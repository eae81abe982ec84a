//! Configuration loading and root folder resolution
//!
//! Resolution priority for every setting follows the same order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is never fatal: the module logs a warning and starts
//! with defaults. A TOML file that exists but does not parse IS fatal, since
//! silently ignoring an operator's budgets would be worse than refusing to start.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "WKTAG_ROOT_FOLDER";

/// Name of the shared database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "wktag.db";

/// `[logging]` section shared by all WKTAG modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Resolve the root folder (holds the shared database)
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_value: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/wktag (or /var/lib/wktag for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("wktag"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/wktag"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("wktag"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/wktag"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("wktag"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\wktag"))
    } else {
        PathBuf::from("./wktag_data")
    }
}

/// Path of the shared database inside a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join(DATABASE_FILE_NAME)
}

/// Locate the TOML config file for a module
///
/// Linux checks `~/.config/wktag/<module>.toml` then `/etc/wktag/<module>.toml`;
/// other platforms only the per-user config directory.
pub fn find_config_file(module_name: &str) -> Option<PathBuf> {
    let file_name = format!("{}.toml", module_name);

    let user_config = dirs::config_dir().map(|d| d.join("wktag").join(&file_name));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/wktag").join(&file_name);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load a module's TOML config
///
/// `explicit` (from `--config`) must exist; otherwise the default search
/// locations are tried and a missing file yields `T::default()`.
pub fn load_toml_config<T>(explicit: Option<&Path>, module_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match find_config_file(module_name) {
            Some(path) => path,
            None => {
                warn!(
                    module = module_name,
                    "No config file found, using compiled defaults"
                );
                return Ok(T::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = parse_toml(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse TOML text into a config struct
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> std::result::Result<T, toml::de::Error> {
    toml::from_str(content)
}

/// Read an environment variable and parse it, ignoring unset or empty values
///
/// A set-but-unparseable value is a configuration error rather than being
/// silently ignored.
pub fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?} is invalid: {}", name, raw, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        logging: LoggingConfig,
        name: Option<String>,
    }

    #[test]
    fn test_parse_toml_with_logging_section() {
        let sample: Sample = parse_toml("name = \"x\"\n[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(sample.logging.level, "debug");
        assert_eq!(sample.name.as_deref(), Some("x"));
    }

    #[test]
    fn test_parse_toml_defaults_missing_sections() {
        let sample: Sample = parse_toml("").unwrap();
        assert_eq!(sample, Sample::default());
        assert_eq!(sample.logging.level, "info");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let result: Result<Sample> =
            load_toml_config(Some(Path::new("/nonexistent/wktag-ai.toml")), "wktag-ai");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_database_path_joins_file_name() {
        let path = database_path(Path::new("/data/wktag"));
        assert_eq!(path, PathBuf::from("/data/wktag/wktag.db"));
    }
}
