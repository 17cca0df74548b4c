//! Package fetcher interface.
//!
//! The fetcher performs the delta-aware download and decompression of a
//! track into a temp directory. Progress is published on a shared event
//! bus; every event carries the session id of the install that started it
//! so concurrent installs never pick up each other's progress.
//!
//! A fetcher writes the complete new install into `temp_dir`. It may read
//! `dest_dir` to reuse unchanged modules but never writes to it; the
//! orchestrator swaps the result into place.

mod local;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::abort::AbortSignal;

pub use local::{
    INSTALL_MANIFEST_FILE, LocalFetcher, ModuleEntry, SOURCE_MANIFEST_FILE, SourceManifest,
};

/// Capacity of the shared event channel.
const EVENT_BUS_CAPACITY: usize = 4096;

/// Random id correlating fetcher events with one install call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Fetcher errors.
#[derive(Debug, Error)]
pub enum FetchError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The package source could not be reached or read.
    #[error("Source unavailable: {0}")]
    Source(String),

    /// A manifest could not be parsed.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// An archive failed verification or extraction.
    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    /// The destination volume ran out of space.
    #[error("Not enough disk space")]
    NoSpace,

    /// The abort signal was observed.
    #[error("Install cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns true if this error reports a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Options for an update check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCheckOptions {
    /// Re-validate against the source instead of trusting cached data.
    pub force_cache_bust: bool,
}

/// Result of comparing a track's source against an install directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Nothing usable is installed.
    pub is_fresh_install: bool,
    /// Something must be downloaded.
    pub needs_update: bool,
    /// Bytes that will be written during install.
    pub required_disk_space: u64,
    /// Bytes that will be downloaded.
    pub download_size: u64,
    /// Installed modules with new content.
    pub updated_modules: Vec<String>,
    /// Modules not installed yet.
    pub added_modules: Vec<String>,
    /// Installed modules no longer published.
    pub removed_modules: Vec<String>,
    /// The base package changed, forcing a full install.
    pub base_changed: bool,
}

impl UpdateInfo {
    /// Number of modules an install will download, the base included when
    /// it has to be fetched.
    #[must_use]
    pub fn module_count(&self) -> u32 {
        let base = usize::from(self.is_fresh_install || self.base_changed);
        let count = self.updated_modules.len() + self.added_modules.len() + base;
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// Install pipeline phase reported by `PhaseChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Comparing source and destination.
    CheckingUpdate,
    /// Downloading a module.
    DownloadingModule,
    /// Extracting a module.
    InstallingModule,
    /// Assembling the finished install.
    InstallFinish,
}

/// Event emitted by a fetcher during `install`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherEventKind {
    DownloadStarted {
        module: String,
    },
    DownloadProgress {
        module: String,
        percent: u8,
        part_percent: Option<u8>,
        part_index: Option<u32>,
        part_count: Option<u32>,
    },
    DownloadInterrupted,
    PhaseChange {
        phase: FetchPhase,
        module_index: Option<u32>,
    },
    UnzipStarted {
        module: String,
    },
    UnzipProgress {
        entry_index: u32,
        entry_count: u32,
        entry_name: String,
    },
    CopyStarted {
        module: String,
    },
    RetryScheduled {
        module: String,
        retry_count: u32,
        wait_seconds: u64,
    },
    RetryStarted {
        module: String,
        retry_count: u32,
    },
    Cancelled,
    Error {
        message: String,
    },
}

/// A fetcher event tagged with its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherEvent {
    /// Session that produced the event.
    pub session: SessionId,
    /// Event payload.
    pub kind: FetcherEventKind,
}

/// Shared channel carrying events of every running install.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FetcherEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribes to all events on the bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FetcherEvent> {
        self.sender.subscribe()
    }

    /// Returns an emitter that tags events with `session`.
    #[must_use]
    pub fn emitter(&self, session: SessionId) -> EventEmitter {
        EventEmitter {
            session,
            sender: self.sender.clone(),
        }
    }
}

/// Sends events for one session.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    session: SessionId,
    sender: broadcast::Sender<FetcherEvent>,
}

impl EventEmitter {
    /// Returns the session this emitter tags events with.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Publishes an event.
    pub fn emit(&self, kind: FetcherEventKind) {
        let _ = self.sender.send(FetcherEvent {
            session: self.session,
            kind,
        });
    }
}

/// Everything a fetcher needs to run one install.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Correlation id of the install call.
    pub session: SessionId,
    /// Track source URL.
    pub url: String,
    /// Fresh directory to build the new install in.
    pub temp_dir: PathBuf,
    /// Current install directory (read only).
    pub dest_dir: PathBuf,
    /// Cooperative cancellation signal.
    pub abort: AbortSignal,
    /// Event emitter for this session.
    pub events: EventEmitter,
}

/// Delta-aware download and decompression engine.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Compares the source at `url` with the install in `dest_dir`.
    async fn needs_update(
        &self,
        url: &str,
        dest_dir: &Path,
        options: UpdateCheckOptions,
    ) -> Result<UpdateInfo, FetchError>;

    /// Builds the new install in `request.temp_dir`.
    ///
    /// Returns `FetchError::Cancelled` after observing the abort signal.
    async fn install(&self, request: FetchRequest) -> Result<(), FetchError>;

    /// Returns the source URL recorded in the install manifest of `dest_dir`.
    async fn installed_source(&self, dest_dir: &Path) -> Option<String>;

    /// Requests cancellation of a session.
    ///
    /// The abort signal in the request is the primary channel; fetchers with
    /// out-of-band work may override this.
    fn cancel(&self, _session: SessionId) {}
}
