//! Application configuration.
//!
//! Handles loading and parsing the `.hangarrc` configuration file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::logging::{LogConfig, LogLevel, parse_retention_hours};
use crate::paths::DirectoryResolver;

/// Default .hangarrc file content with all settings documented.
const DEFAULT_HANGARRC: &str = r#"# Hangar Configuration File
# ==========================
# This file is read on startup.
# Lines starting with '#' are comments. Paths may start with '~/'.
#
# Locations
# ---------
# install_root        = ~/.hangar/addons     # Where addons are installed
# temp_root           = <system temp>/hangar # Scratch space for downloads
# package_cache_root  = ~/.hangar/cache      # Per-addon package cache
# documents_root      = ~/Documents/hangar   # Per-addon user documents

# Catalog
# -------
# catalog             = ~/.hangar/catalog.toml
# catalog_override    = ~/.hangar/catalog.override.toml

# Prompts
# -------
# Answer yes to every confirmation (disk space, incompatible packages, ...)
# assume_yes = false

# Logging Configuration
# ---------------------
# Logs are stored in ~/.hangar/logs/ with automatic cleanup.
#
# log_enabled = true       # Enable/disable file logging (true/false)
# log_level = info         # Log level: trace, debug, info, warn, error, off
# log_retention = 24       # Hours to keep log files (default: 24)
# log_directory = ~/.hangar/logs
"#;

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn hangar_dir() -> PathBuf {
    home().join(".hangar")
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

/// Expands a leading `~/` to the home directory.
#[must_use]
pub fn expand_path(value: &str) -> PathBuf {
    if value == "~" {
        return home();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home().join(rest),
        None => PathBuf::from(value),
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to config file.
    pub config_path: PathBuf,
    /// Directory addons are installed into.
    pub install_root: PathBuf,
    /// Directory temp installs are built in.
    pub temp_root: PathBuf,
    /// Package cache directory.
    pub package_cache_root: PathBuf,
    /// User documents directory.
    pub documents_root: PathBuf,
    /// Catalog file.
    pub catalog: PathBuf,
    /// Catalog merged over `catalog`.
    pub catalog_override: Option<PathBuf>,
    /// Answer yes to every prompt.
    pub assume_yes: bool,
    /// Logging configuration.
    pub log_config: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        let documents = dirs::document_dir().unwrap_or_else(|| home().join("Documents"));
        Self {
            config_path: Self::default_config_path(),
            install_root: hangar_dir().join("addons"),
            temp_root: std::env::temp_dir().join("hangar"),
            package_cache_root: hangar_dir().join("cache"),
            documents_root: documents.join("hangar"),
            catalog: hangar_dir().join("catalog.toml"),
            catalog_override: None,
            assume_yes: false,
            log_config: LogConfig::default(),
        }
    }
}

impl Config {
    /// Returns the default config file path (~/.hangarrc).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        home().join(".hangarrc")
    }

    /// Returns the settings file path (~/.hangar/settings).
    #[must_use]
    pub fn settings_path() -> PathBuf {
        hangar_dir().join("settings")
    }

    /// Loads configuration from the default path, creating it if it doesn't exist.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn load() -> io::Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Loads configuration from a specific path.
    ///
    /// # Errors
    /// Returns error if config cannot be read.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self {
            config_path: path.to_path_buf(),
            ..Self::default()
        };
        config.parse(&content);
        debug!("[CONFIG] Loaded {}", path.display());
        Ok(config)
    }

    /// Creates the default config file.
    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_HANGARRC.as_bytes())?;
        Ok(())
    }

    /// Parses the config file content.
    fn parse(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                // Remove inline comments
                let value = value.split('#').next().unwrap_or(value).trim();
                self.apply_setting(key, value);
            }
        }
    }

    /// Applies a single setting.
    fn apply_setting(&mut self, key: &str, value: &str) {
        match key {
            "install_root" => self.install_root = expand_path(value),
            "temp_root" => self.temp_root = expand_path(value),
            "package_cache_root" => self.package_cache_root = expand_path(value),
            "documents_root" => self.documents_root = expand_path(value),
            "catalog" => self.catalog = expand_path(value),
            "catalog_override" => {
                self.catalog_override = (!value.is_empty()).then(|| expand_path(value));
            }
            "assume_yes" => self.assume_yes = parse_bool(value),
            "log_level" => self.log_config.level = LogLevel::parse(value),
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = parse_retention_hours(value);
            }
            "log_directory" => self.log_config.directory = expand_path(value),
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => debug!("[CONFIG] Ignoring unknown key '{}'", key),
        }
    }

    /// Builds the directory resolver for the configured roots.
    #[must_use]
    pub fn resolver(&self) -> DirectoryResolver {
        DirectoryResolver::new(
            self.install_root.clone(),
            self.temp_root.clone(),
            self.package_cache_root.clone(),
            self.documents_root.clone(),
        )
    }
}
