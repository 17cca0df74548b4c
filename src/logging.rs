//! Logging setup.
//!
//! Installs a `tracing` subscriber writing either to a timestamped file in
//! the log directory (`~/.hangar/logs/` by default) or, for verbose CLI
//! runs, to stderr. `RUST_LOG` overrides the configured level.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 24;

/// Log file name prefix.
const LOG_FILE_PREFIX: &str = "hangar_";

/// Minimum severity written to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    /// Parses a level name. Unknown names fall back to `Info`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Info,
        }
    }

    /// Returns the `EnvFilter` directive for this level.
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// A new file in the log directory per run.
    #[default]
    File,
    /// Standard error, without timestamps.
    Stderr,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,
    /// Minimum level.
    pub level: LogLevel,
    /// Hours to keep old log files.
    pub retention_hours: u32,
    /// Output target.
    pub target: LogTarget,
    /// Directory holding log files.
    pub directory: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::default(),
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            target: LogTarget::default(),
            directory: default_log_directory(),
        }
    }
}

/// Parses a retention period in hours, falling back to the default.
#[must_use]
pub fn parse_retention_hours(value: &str) -> u32 {
    value.trim().parse().unwrap_or(DEFAULT_LOG_RETENTION_HOURS)
}

/// Returns `~/.hangar/logs`.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hangar")
        .join("logs")
}

/// Returns the log file name for a run started at `started`.
#[must_use]
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("{}{}.log", LOG_FILE_PREFIX, started.format("%Y-%m-%d_%H-%M-%S"))
}

fn is_expired(path: &Path, now: SystemTime, retention: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > retention)
}

/// Deletes our `.log` files in `directory` older than the retention period.
/// Returns how many were deleted.
pub fn prune_logs(directory: &Path, retention_hours: u32) -> io::Result<u32> {
    if !directory.is_dir() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(directory)?.flatten() {
        let path = entry.path();
        let ours = path.extension().is_some_and(|e| e == "log")
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with(LOG_FILE_PREFIX);
        if ours && is_expired(&path, now, retention) && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Installs the global subscriber.
///
/// Returns the log file path when logging to a file. An already installed
/// subscriber is left in place.
pub fn init(config: &LogConfig) -> io::Result<Option<PathBuf>> {
    if !config.enabled || config.level == LogLevel::Off {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));

    if config.target == LogTarget::Stderr {
        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .without_time();
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
        return Ok(None);
    }

    fs::create_dir_all(&config.directory)?;
    let pruned = prune_logs(&config.directory, config.retention_hours)?;
    let path = config.directory.join(log_file_name(Local::now()));
    let file = File::create(&path)?;

    let layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true);
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();

    tracing::info!(
        "[LOG] Hangar v{} logging to {} (level {}, keeping {}h)",
        env!("CARGO_PKG_VERSION"),
        path.display(),
        config.level.directive(),
        config.retention_hours
    );
    if pruned > 0 {
        tracing::info!("[LOG] Removed {} expired log file(s)", pruned);
    }
    Ok(Some(path))
}
