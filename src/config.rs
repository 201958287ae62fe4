//! Configuration for the directory watcher.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.treewatch/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `TREEWATCH_` and use double
//! underscores to separate nested levels:
//! - `TREEWATCH_WATCHER__SIGNAL_CAPACITY=4096` sets `watcher.signal_capacity`
//! - `TREEWATCH_WATCHER__FOLLOW_LINKS=true` sets `watcher.follow_links`
//! - `TREEWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::watcher::DEFAULT_CAPACITY;

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".treewatch";
/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";

const ENV_PREFIX: &str = "TREEWATCH_";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watcher tuning
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Logging levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Buffered signalled keys per subscriber before it starts lagging
    #[serde(default = "default_capacity")]
    pub signal_capacity: usize,

    /// Buffered errors per subscriber before it starts lagging
    #[serde(default = "default_capacity")]
    pub error_capacity: usize,

    /// Descend into symlinked directories when registering a tree
    #[serde(default = "default_false")]
    pub follow_links: bool,

    /// Thread name of the worker started by `DirectoryWatcher::spawn`
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `treewatch = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_false() -> bool {
    false
}
fn default_worker_name() -> String {
    "treewatch-dispatcher".to_string()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            signal_capacity: default_capacity(),
            error_capacity: default_capacity(),
            follow_links: false,
            worker_name: default_worker_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels; single underscores stay in field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for `.treewatch` from the current directory up.
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Save current configuration to file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Write a default settings file under `dir`.
    pub fn init_config_file(dir: &Path, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watcher.signal_capacity, DEFAULT_CAPACITY);
        assert!(!settings.watcher.follow_links);
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE);

        let toml_content = r#"
[watcher]
follow_links = true

[logging.modules]
treewatch = "debug"
"#;
        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();

        // Modified values
        assert!(settings.watcher.follow_links);
        assert_eq!(settings.logging.modules["treewatch"], "debug");

        // Default values should still be present
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watcher.error_capacity, DEFAULT_CAPACITY);
        assert_eq!(settings.watcher.worker_name, "treewatch-dispatcher");
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let mut settings = Settings::default();
        settings.watcher.signal_capacity = 64;
        settings.logging.default = "info".to_string();
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.watcher.signal_capacity, 64);
        assert_eq!(loaded.logging.default, "info");
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();

        let path = Settings::init_config_file(temp_dir.path(), false).unwrap();
        assert!(path.ends_with(".treewatch/settings.toml"));
        assert!(Settings::init_config_file(temp_dir.path(), false).is_err());
        assert!(Settings::init_config_file(temp_dir.path(), true).is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.watcher, WatcherConfig::default());
    }
}
