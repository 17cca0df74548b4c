//! Catalog type definitions.
//!
//! Publishers, addons, tracks and the references between them, as read
//! from the catalog TOML document.

use serde::{Deserialize, Serialize};

/// The resolved addon catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// All publishers, in display order.
    #[serde(default)]
    pub publishers: Vec<Publisher>,
}

/// A publisher offering one or more addons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    /// Unique publisher key (e.g. "flybywire").
    pub key: String,
    /// Display name.
    pub name: String,
    /// Addons offered by this publisher.
    #[serde(default)]
    pub addons: Vec<Addon>,
    /// External applications addons may refer to.
    #[serde(default)]
    pub external_apps: Vec<ExternalApp>,
}

/// A single installable package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addon {
    /// Key, unique within the publisher.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Install path relative to the install root.
    pub target_directory: String,
    /// Legacy install names, removed after a successful install.
    #[serde(default)]
    pub alternative_names: Vec<String>,
    /// Release tracks. The first one is the default.
    pub tracks: Vec<AddonTrack>,
    /// Other addons this addon needs.
    #[serde(default)]
    pub dependencies: Vec<AddonDependency>,
    /// Third-party packages known to conflict with this addon.
    #[serde(default)]
    pub incompatible_addons: Vec<IncompatibleAddon>,
    /// External app references (`@publisher/app`) that must not run during install.
    #[serde(default)]
    pub disallowed_running_external_apps: Vec<String>,
    /// Optional helper process installed alongside the addon.
    #[serde(default)]
    pub background_service: Option<BackgroundService>,
    /// Hidden addons are listed but never installed.
    #[serde(default)]
    pub hidden: bool,
}

impl Addon {
    /// Returns the track with the given key.
    #[must_use]
    pub fn track(&self, key: &str) -> Option<&AddonTrack> {
        self.tracks.iter().find(|t| t.key == key)
    }

    /// Returns the default track (the first one declared).
    #[must_use]
    pub fn default_track(&self) -> Option<&AddonTrack> {
        self.tracks.first()
    }

    /// Returns the track whose current or historical URL matches `source`.
    #[must_use]
    pub fn track_for_source(&self, source: &str) -> Option<&AddonTrack> {
        self.tracks.iter().find(|t| t.matches_source(source))
    }
}

/// A release channel of an addon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonTrack {
    /// Track key (e.g. "stable", "dev").
    pub key: String,
    /// Display name.
    pub name: String,
    /// Package source URL.
    pub url: String,
    /// Former URLs this track was published under.
    #[serde(default)]
    pub alternative_urls: Vec<String>,
    /// How the latest version of this track is determined.
    #[serde(default)]
    pub release_model: ReleaseModel,
    /// Experimental tracks are shown with a warning.
    #[serde(default)]
    pub is_experimental: bool,
    /// Warning shown before switching to this track.
    #[serde(default)]
    pub warning_content: Option<String>,
}

impl AddonTrack {
    /// Returns true if `source` is this track's URL or one of its former URLs.
    #[must_use]
    pub fn matches_source(&self, source: &str) -> bool {
        let source = source.trim_end_matches('/');
        self.url.trim_end_matches('/') == source
            || self
                .alternative_urls
                .iter()
                .any(|u| u.trim_end_matches('/') == source)
    }
}

/// Release model of a track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReleaseModel {
    /// Fragmenter delta packages.
    #[default]
    Fragmenter,
    /// Latest GitHub release.
    GithubRelease,
    /// Head of a GitHub branch.
    GithubBranch {
        /// Branch name.
        branch: String,
    },
    /// Version manifest served from a CDN.
    Cdn {
        /// Manifest URL.
        url: String,
    },
}

/// A dependency on another addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonDependency {
    /// Reference in `@publisher/addon` form.
    pub addon: String,
    /// Optional dependencies can be declined.
    #[serde(default)]
    pub optional: bool,
    /// Text shown when asking about an optional dependency.
    #[serde(default)]
    pub modal_text: Option<String>,
}

/// Signature of a third-party package that conflicts with an addon.
///
/// Every field that is present must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatibleAddon {
    /// Package title from its `manifest.json`.
    #[serde(default)]
    pub title: Option<String>,
    /// Package creator from its `manifest.json`.
    #[serde(default)]
    pub creator: Option<String>,
    /// Semver range of conflicting package versions.
    #[serde(default)]
    pub package_version: Option<String>,
    /// Folder name in the install root.
    #[serde(default)]
    pub folder: Option<String>,
    /// Explanation shown to the user.
    #[serde(default)]
    pub description: String,
}

/// An application outside the installer whose running state matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalApp {
    /// Key, unique within the publisher.
    pub key: String,
    /// Display name.
    pub name: String,
    /// How the app is detected.
    pub kind: ExternalAppKind,
}

/// Detection method for an external app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExternalAppKind {
    /// A running process with this executable name.
    Executable {
        /// Executable file name.
        name: String,
    },
    /// Something listening on this localhost TCP port.
    Tcp {
        /// Port number.
        port: u16,
    },
}

/// Helper process shipped with an addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundService {
    /// Executable name without extension.
    pub executable_file_base_name: String,
    /// External app reference used to check whether the service runs.
    #[serde(default)]
    pub run_check_external_app_ref: Option<String>,
    /// Whether autostart at login can be configured.
    #[serde(default)]
    pub enable_autostart_configuration: bool,
    /// Whether to offer enabling autostart after install.
    #[serde(default)]
    pub autostart_prompt: bool,
}
