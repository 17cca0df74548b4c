//! Addon catalog.
//!
//! The catalog is read from a TOML document, optionally merged with an
//! override document, validated once and then shared read-only.
//!
//! Cross references use the `@publisher/addon` form, for dependencies as
//! well as for external apps.

mod types;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::paths::sanitize_relative;

pub use types::{
    Addon, AddonDependency, AddonTrack, BackgroundService, Catalog, ExternalApp, ExternalAppKind,
    IncompatibleAddon, Publisher, ReleaseModel,
};

/// Maximum catalog file size (4 MB).
const MAX_CATALOG_SIZE: u64 = 4 * 1024 * 1024;

/// Errors raised while loading the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// File I/O error.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Catalog path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// File too large.
    #[error("Catalog file too large (max {MAX_CATALOG_SIZE} bytes)")]
    FileTooLarge,

    /// Structurally valid but inconsistent catalog.
    #[error("Invalid catalog: {0}")]
    Invalid(String),
}

/// Splits an `@publisher/addon` reference into its two keys.
#[must_use]
pub fn parse_addon_ref(reference: &str) -> Option<(&str, &str)> {
    let rest = reference.strip_prefix('@')?;
    let (publisher, addon) = rest.split_once('/')?;
    if publisher.is_empty() || addon.is_empty() || addon.contains('/') {
        return None;
    }
    Some((publisher, addon))
}

impl Catalog {
    /// Parses a catalog from TOML text and validates it.
    pub fn from_toml(text: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Loads and validates a catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let catalog = read_catalog(path)?;
        catalog.validate()?;
        info!(
            "[CATALOG] Loaded {} publisher(s) from {}",
            catalog.publishers.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Loads a base catalog, merges an optional override over it and validates
    /// the result.
    pub fn load_merged(base: &Path, overrides: Option<&Path>) -> Result<Self, CatalogError> {
        let mut catalog = read_catalog(base)?;
        if let Some(path) = overrides {
            if path.exists() {
                let extra = read_catalog(path)?;
                info!("[CATALOG] Merging overrides from {}", path.display());
                catalog.merge(extra);
            } else {
                debug!("[CATALOG] No override catalog at {}", path.display());
            }
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Merges `other` over this catalog.
    ///
    /// Publishers are matched by key. Addons and external apps of a matched
    /// publisher replace entries with the same key or are appended.
    pub fn merge(&mut self, other: Catalog) {
        for incoming in other.publishers {
            let Some(existing) = self
                .publishers
                .iter_mut()
                .find(|p| p.key == incoming.key)
            else {
                self.publishers.push(incoming);
                continue;
            };

            if !incoming.name.is_empty() {
                existing.name = incoming.name;
            }
            for addon in incoming.addons {
                match existing.addons.iter_mut().find(|a| a.key == addon.key) {
                    Some(slot) => *slot = addon,
                    None => existing.addons.push(addon),
                }
            }
            for app in incoming.external_apps {
                match existing.external_apps.iter_mut().find(|a| a.key == app.key) {
                    Some(slot) => *slot = app,
                    None => existing.external_apps.push(app),
                }
            }
        }
    }

    /// Checks keys, tracks and reference syntax.
    ///
    /// Whether a dependency actually resolves is checked at install time.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut publisher_keys = HashSet::new();
        for publisher in &self.publishers {
            if publisher.key.is_empty() {
                return Err(CatalogError::Invalid("publisher with empty key".into()));
            }
            if !publisher_keys.insert(publisher.key.as_str()) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate publisher '{}'",
                    publisher.key
                )));
            }

            let mut addon_keys = HashSet::new();
            for addon in &publisher.addons {
                let at = format!("{}/{}", publisher.key, addon.key);
                if addon.key.is_empty() {
                    return Err(CatalogError::Invalid(format!(
                        "addon with empty key in '{}'",
                        publisher.key
                    )));
                }
                if !addon_keys.insert(addon.key.as_str()) {
                    return Err(CatalogError::Invalid(format!("duplicate addon '{at}'")));
                }
                if sanitize_relative(&addon.target_directory).as_os_str().is_empty() {
                    return Err(CatalogError::Invalid(format!(
                        "addon '{at}' has no target directory"
                    )));
                }
                if addon.tracks.is_empty() {
                    return Err(CatalogError::Invalid(format!("addon '{at}' has no tracks")));
                }
                let mut track_keys = HashSet::new();
                for track in &addon.tracks {
                    if !track_keys.insert(track.key.as_str()) {
                        return Err(CatalogError::Invalid(format!(
                            "duplicate track '{}' in '{at}'",
                            track.key
                        )));
                    }
                }
                for dep in &addon.dependencies {
                    if parse_addon_ref(&dep.addon).is_none() {
                        return Err(CatalogError::Invalid(format!(
                            "malformed dependency '{}' in '{at}'",
                            dep.addon
                        )));
                    }
                }
                for app in &addon.disallowed_running_external_apps {
                    if parse_addon_ref(app).is_none() {
                        return Err(CatalogError::Invalid(format!(
                            "malformed external app reference '{app}' in '{at}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Finds a publisher by key.
    #[must_use]
    pub fn find_publisher(&self, key: &str) -> Option<&Publisher> {
        self.publishers.iter().find(|p| p.key == key)
    }

    /// Finds an addon by publisher and addon key.
    #[must_use]
    pub fn find_addon(&self, publisher_key: &str, addon_key: &str) -> Option<(&Publisher, &Addon)> {
        let publisher = self.find_publisher(publisher_key)?;
        let addon = publisher.addons.iter().find(|a| a.key == addon_key)?;
        Some((publisher, addon))
    }

    /// Resolves an `@publisher/addon` reference.
    #[must_use]
    pub fn resolve_addon_ref(&self, reference: &str) -> Option<(&Publisher, &Addon)> {
        let (publisher, addon) = parse_addon_ref(reference)?;
        self.find_addon(publisher, addon)
    }

    /// Resolves a dependency declaration to the addon it names.
    #[must_use]
    pub fn resolve_dependency(&self, dependency: &AddonDependency) -> Option<(&Publisher, &Addon)> {
        self.resolve_addon_ref(&dependency.addon)
    }

    /// Resolves an `@publisher/app` external app reference.
    #[must_use]
    pub fn resolve_external_app(&self, reference: &str) -> Option<&ExternalApp> {
        let (publisher, app) = parse_addon_ref(reference)?;
        self.find_publisher(publisher)?
            .external_apps
            .iter()
            .find(|a| a.key == app)
    }

    /// Iterates over every `(publisher, addon)` pair.
    pub fn addons(&self) -> impl Iterator<Item = (&Publisher, &Addon)> {
        self.publishers
            .iter()
            .flat_map(|p| p.addons.iter().map(move |a| (p, a)))
    }
}

fn read_catalog(path: &Path) -> Result<Catalog, CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    };
    let metadata = fs::metadata(path).map_err(io_err)?;
    if metadata.len() > MAX_CATALOG_SIZE {
        return Err(CatalogError::FileTooLarge);
    }
    let text = fs::read_to_string(path).map_err(io_err)?;
    Ok(toml::from_str(&text)?)
}
