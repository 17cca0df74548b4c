//! Hangar
//!
//! Installs, updates and removes addons distributed as delta-updatable
//! archives. Publishers expose addons with release tracks, dependencies and
//! incompatibilities; the orchestrator drives each install from status
//! determination to the atomic swap into the install directory.
//!
//! # Architecture
//!
//! - **Catalog**: publishers, addons, tracks and dependencies (TOML)
//! - **Paths**: directory resolution with path sanitisation
//! - **State**: per-addon install state store with change notifications
//! - **Abort**: bounded registry of cancellation signals
//! - **Fetcher**: package fetcher contract and a local implementation
//! - **Installer**: the install orchestrator
//!
//! # Usage
//!
//! ```no_run
//! use hangar::installer::Orchestrator;
//!
//! async fn update(orchestrator: &Orchestrator) {
//!     let result = orchestrator.install("flybywire", "a32nx").await;
//!     println!("{:?}", result);
//! }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod abort;
pub mod apps;
pub mod catalog;
pub mod config;
pub mod disk;
pub mod fetcher;
pub mod fsutil;
pub mod installer;
pub mod logging;
pub mod paths;
pub mod prompt;
pub mod reporting;
pub mod service;
pub mod settings;
pub mod state;

// Re-export main types
pub use catalog::Catalog;
pub use config::Config;
pub use installer::{InstallError, InstallResult, Orchestrator, OrchestratorDeps};
pub use state::{AddonId, InstallState, InstallStateStore, InstallStatus};
