//! Install errors and results.

use thiserror::Error;

use crate::abort::AbortError;
use crate::fetcher::FetchError;
use crate::settings::SettingsError;

/// Errors surfaced by install and uninstall.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The addon is not in the catalog.
    #[error("Unknown addon: {0}")]
    UnknownAddon(String),

    /// The addon's target directory resolves to the install root itself.
    #[error("Addon {0} has no usable target directory")]
    InvalidTarget(String),

    /// The addon declares no tracks.
    #[error("Addon {0} has no tracks")]
    NoTrack(String),

    /// The requested track does not exist.
    #[error("Addon {addon} has no track '{track}'")]
    UnknownTrack {
        /// Addon.
        addon: String,
        /// Requested track key.
        track: String,
    },

    /// A dependency reference does not resolve against the catalog.
    #[error("Dependency {dependency} of {addon} is not in the catalog")]
    UnresolvedDependency {
        /// Dependent addon.
        addon: String,
        /// Dependency reference.
        dependency: String,
    },

    /// A required dependency failed to install.
    #[error("Dependency {dependency} failed: {source}")]
    DependencyFailed {
        /// Dependency that failed.
        dependency: String,
        /// Why it failed.
        source: Box<InstallError>,
    },

    /// An install of the addon is already running.
    #[error("{0} is already being installed")]
    AlreadyInstalling(String),

    /// No abort slot is free.
    #[error(transparent)]
    Capacity(#[from] AbortError),

    /// The package fetcher failed.
    #[error("Download failed: {0}")]
    Fetch(#[from] FetchError),

    /// The fetcher reported an error event but returned success.
    #[error("Download failed: {0}")]
    FetcherReported(String),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be written.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Nothing to cancel.
    #[error("No install in progress for {0}")]
    NothingInFlight(String),
}

/// Outcome of `install`.
#[derive(Debug)]
pub enum InstallResult {
    /// The addon is installed.
    Success,
    /// The install failed; the install directory is unchanged.
    Failure(InstallError),
    /// The user declined or cancelled; the install directory is unchanged.
    Cancelled,
}

impl InstallResult {
    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true for `Cancelled`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error of a `Failure`.
    #[must_use]
    pub fn error(&self) -> Option<&InstallError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of `uninstall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallResult {
    /// The addon was removed.
    Removed,
    /// The user declined.
    Cancelled,
}
