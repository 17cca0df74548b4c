//! Per-addon install state.
//!
//! `InstallState` carries only the payload relevant to its status.
//! `DownloadItem` tracks an in-flight install and owns an abort slot.

mod store;

use std::fmt;

use chrono::{DateTime, Utc};

pub use store::{InstallStateStore, StoreEvent};

/// Identifies an addon across publishers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddonId {
    /// Publisher key.
    pub publisher: String,
    /// Addon key within the publisher.
    pub addon: String,
}

impl AddonId {
    /// Creates a new addon id.
    #[must_use]
    pub fn new(publisher: impl Into<String>, addon: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
            addon: addon.into(),
        }
    }

    /// Parses `publisher/addon` or `@publisher/addon`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix('@').unwrap_or(text);
        let (publisher, addon) = text.split_once('/')?;
        if publisher.is_empty() || addon.is_empty() {
            return None;
        }
        Some(Self::new(publisher, addon))
    }
}

impl fmt::Display for AddonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}", self.publisher, self.addon)
    }
}

/// Install status of an addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallStatus {
    NotInstalled,
    NeedsUpdate,
    TrackSwitch,
    DownloadPending,
    DownloadPrep,
    Downloading,
    DownloadRetry,
    Decompressing,
    DownloadEnding,
    DownloadDone,
    DownloadCanceled,
    DownloadError,
    InstallingDependency,
    InstallingDependencyEnding,
    UpToDate,
    GitInstall,
    Hidden,
    Unknown,
}

impl InstallStatus {
    /// Returns true while an install session owns the addon.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::DownloadPending
                | Self::DownloadPrep
                | Self::Downloading
                | Self::DownloadRetry
                | Self::Decompressing
                | Self::DownloadEnding
                | Self::InstallingDependency
                | Self::InstallingDependencyEnding
        )
    }

    /// Returns true for the states shown briefly after an interrupted install.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::DownloadCanceled | Self::DownloadError)
    }

    /// Returns true for states recomputed by status determination.
    #[must_use]
    pub fn is_steady(&self) -> bool {
        matches!(
            self,
            Self::NotInstalled
                | Self::NeedsUpdate
                | Self::TrackSwitch
                | Self::UpToDate
                | Self::GitInstall
                | Self::Hidden
                | Self::Unknown
        )
    }

    /// Returns a display string for this status.
    #[must_use]
    pub fn display(&self) -> &'static str {
        match self {
            Self::NotInstalled => "Not installed",
            Self::NeedsUpdate => "Update available",
            Self::TrackSwitch => "Track switch pending",
            Self::DownloadPending => "Pending...",
            Self::DownloadPrep => "Preparing...",
            Self::Downloading => "Downloading...",
            Self::DownloadRetry => "Retrying...",
            Self::Decompressing => "Decompressing...",
            Self::DownloadEnding => "Finishing...",
            Self::DownloadDone => "Installed",
            Self::DownloadCanceled => "Canceled",
            Self::DownloadError => "Failed",
            Self::InstallingDependency => "Installing dependency...",
            Self::InstallingDependencyEnding => "Finishing dependency...",
            Self::UpToDate => "Up to date",
            Self::GitInstall => "Git install",
            Self::Hidden => "Hidden",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display())
    }
}

/// Install state of an addon with status-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallState {
    NotInstalled,
    NeedsUpdate,
    TrackSwitch,
    DownloadPending,
    DownloadPrep,
    Downloading,
    DownloadRetry {
        /// Retry attempt number.
        retry_count: u32,
        /// Seconds until the retry starts.
        wait_seconds: u64,
    },
    Decompressing {
        /// Extraction progress (0-100).
        percent: u8,
        /// Entry currently being extracted.
        entry: Option<String>,
    },
    DownloadEnding,
    DownloadDone,
    DownloadCanceled {
        /// When the cancel was observed.
        at: DateTime<Utc>,
    },
    DownloadError {
        /// Error shown to the user.
        message: String,
    },
    InstallingDependency {
        /// Dependency being installed, `@publisher/addon`.
        dependency: String,
    },
    InstallingDependencyEnding {
        /// Dependency being finished, `@publisher/addon`.
        dependency: String,
    },
    UpToDate,
    GitInstall,
    Hidden,
    Unknown,
}

impl InstallState {
    /// Returns the status of this state.
    #[must_use]
    pub fn status(&self) -> InstallStatus {
        match self {
            Self::NotInstalled => InstallStatus::NotInstalled,
            Self::NeedsUpdate => InstallStatus::NeedsUpdate,
            Self::TrackSwitch => InstallStatus::TrackSwitch,
            Self::DownloadPending => InstallStatus::DownloadPending,
            Self::DownloadPrep => InstallStatus::DownloadPrep,
            Self::Downloading => InstallStatus::Downloading,
            Self::DownloadRetry { .. } => InstallStatus::DownloadRetry,
            Self::Decompressing { .. } => InstallStatus::Decompressing,
            Self::DownloadEnding => InstallStatus::DownloadEnding,
            Self::DownloadDone => InstallStatus::DownloadDone,
            Self::DownloadCanceled { .. } => InstallStatus::DownloadCanceled,
            Self::DownloadError { .. } => InstallStatus::DownloadError,
            Self::InstallingDependency { .. } => InstallStatus::InstallingDependency,
            Self::InstallingDependencyEnding { .. } => InstallStatus::InstallingDependencyEnding,
            Self::UpToDate => InstallStatus::UpToDate,
            Self::GitInstall => InstallStatus::GitInstall,
            Self::Hidden => InstallStatus::Hidden,
            Self::Unknown => InstallStatus::Unknown,
        }
    }

    /// Builds the payload-free state for a steady status.
    ///
    /// Returns `None` for statuses that need a payload.
    #[must_use]
    pub fn from_steady(status: InstallStatus) -> Option<Self> {
        let state = match status {
            InstallStatus::NotInstalled => Self::NotInstalled,
            InstallStatus::NeedsUpdate => Self::NeedsUpdate,
            InstallStatus::TrackSwitch => Self::TrackSwitch,
            InstallStatus::UpToDate => Self::UpToDate,
            InstallStatus::GitInstall => Self::GitInstall,
            InstallStatus::Hidden => Self::Hidden,
            InstallStatus::Unknown => Self::Unknown,
            _ => return None,
        };
        Some(state)
    }
}

/// Download progress of an in-flight install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Set when the connection dropped and a retry is pending.
    pub interrupted: bool,
    /// Overall percentage (0-100).
    pub total_percent: u8,
    /// Percentage of the current part for split downloads.
    pub split_part_percent: Option<u8>,
    /// Index of the current part.
    pub split_part_index: Option<u32>,
    /// Number of parts.
    pub split_part_count: Option<u32>,
}

/// An in-flight install of one addon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    /// Module currently being processed.
    pub module: String,
    /// Index of that module.
    pub module_index: u32,
    /// Number of modules in this install.
    pub module_count: u32,
    /// Progress of the current download.
    pub progress: DownloadProgress,
    /// Abort registry slot owned by this install.
    pub abort_controller_id: usize,
}

impl DownloadItem {
    /// Creates an item that owns the given abort slot.
    #[must_use]
    pub fn new(abort_controller_id: usize) -> Self {
        Self {
            module: String::new(),
            module_index: 0,
            module_count: 0,
            progress: DownloadProgress::default(),
            abort_controller_id,
        }
    }
}
