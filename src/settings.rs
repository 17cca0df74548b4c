//! Persisted settings.
//!
//! Suppression flags ("don't ask again") and autostart preferences are kept
//! in a `key = value` file, one setting per line, `#` starting a comment.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of lines read from the settings file.
const MAX_LINES: usize = 10_000;

/// Settings errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Key/value settings store.
pub trait Settings: Send + Sync {
    /// Returns a boolean setting, `None` when unset or not a boolean.
    fn get_bool(&self, key: &str) -> Option<bool>;

    /// Stores a boolean setting.
    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError>;
}

/// Key of the "don't ask again" flag for an optional dependency prompt.
#[must_use]
pub fn dont_ask_optional_dependency_key(publisher: &str, addon: &str, dependency: &str) -> String {
    let dependency = dependency.trim_start_matches('@').replace('/', ".");
    format!("dont_ask.optional_dependency.{publisher}.{addon}.{dependency}")
}

/// Key of the autostart flag of an addon's background service.
#[must_use]
pub fn autostart_key(publisher: &str, addon: &str) -> String {
    format!("autostart.{publisher}.{addon}")
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Settings persisted to a file.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileSettings {
    /// Opens the settings file, starting empty if it does not exist.
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let values = load_values(&path);
        debug!("[SETTINGS] Loaded {} setting(s) from {}", values.len(), path.display());
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// Returns the default settings path (~/.hangar/settings).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hangar")
            .join("settings")
    }

    /// Updates a single setting in the file, keeping comments and order.
    fn update_setting(&self, key: &str, value: &str) -> io::Result<()> {
        let content = fs::read_to_string(&self.path).unwrap_or_default();

        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let mut found = false;

        for line in lines.iter_mut().take(MAX_LINES) {
            let Some((existing, _)) = line.split_once('=') else {
                continue;
            };
            if !line.trim_start().starts_with('#') && existing.trim() == key {
                *line = format!("{} = {}", key, value);
                found = true;
                break;
            }
        }

        if !found {
            lines.push(format!("{} = {}", key, value));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&self.path)?;
        for line in &lines {
            writeln!(file, "{}", line)?;
        }

        Ok(())
    }
}

fn load_values(path: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();

    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return values,
    };

    for line in BufReader::new(file).lines().take(MAX_LINES) {
        let Ok(line) = line else {
            continue;
        };
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.split('#').next().unwrap_or("").trim();
            if !key.is_empty() {
                values.insert(key.to_string(), value.to_string());
            }
        }
    }

    values
}

impl Settings for FileSettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        let values = self.values.lock().ok()?;
        parse_bool(values.get(key)?)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        let value = if value { "true" } else { "false" };
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        } else {
            warn!("[SETTINGS] Settings lock poisoned");
        }
        self.update_setting(key, value)?;
        Ok(())
    }
}

/// In-memory settings.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, bool>>,
}

impl MemorySettings {
    /// Creates empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemorySettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.lock().ok()?.get(key).copied()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), SettingsError> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}
