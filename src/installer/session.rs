//! Translation of fetcher events into store writes for one install session.

use chrono::Utc;
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::fetcher::{FetchPhase, FetcherEventKind};
use crate::state::{AddonId, DownloadItem, DownloadProgress, InstallState, InstallStateStore};

/// Module name the fetcher uses for the final copy of a full install.
const FULL_INSTALL_MODULE: &str = "full";

/// Percentage of `entry_index + 1` out of `entry_count`, rounded.
#[must_use]
pub fn unzip_percent(entry_index: u32, entry_count: u32) -> u8 {
    if entry_count == 0 {
        return 100;
    }
    let done = u64::from(entry_index) + 1;
    let count = u64::from(entry_count);
    let percent = (200 * done + count) / (2 * count);
    u8::try_from(percent.min(100)).unwrap_or(100)
}

/// Applies the events of one session to the store.
///
/// Events arriving after the abort signal tripped are ignored.
pub(super) struct SessionTranslator<'a> {
    store: &'a InstallStateStore,
    id: &'a AddonId,
    dependency_of: Option<&'a AddonId>,
    abort: &'a AbortSignal,
    last_download_percent: Option<u8>,
    last_unzip_percent: Option<u8>,
    cancelled: bool,
    error: Option<String>,
}

impl<'a> SessionTranslator<'a> {
    pub(super) fn new(
        store: &'a InstallStateStore,
        id: &'a AddonId,
        dependency_of: Option<&'a AddonId>,
        abort: &'a AbortSignal,
    ) -> Self {
        Self {
            store,
            id,
            dependency_of,
            abort,
            last_download_percent: None,
            last_unzip_percent: None,
            cancelled: false,
            error: None,
        }
    }

    /// Returns true once a `Cancelled` event was seen.
    pub(super) fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Takes the message of an `Error` event, if one was seen.
    pub(super) fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    fn set_state(&self, state: InstallState) {
        self.store.set_install_state(self.id, state);
    }

    fn ending(&self) {
        self.set_state(InstallState::DownloadEnding);
        if let Some(parent) = self.dependency_of {
            self.store.set_install_state(
                parent,
                InstallState::InstallingDependencyEnding {
                    dependency: self.id.to_string(),
                },
            );
        }
    }

    fn update_item<F: FnOnce(&mut DownloadItem)>(&self, update: F) {
        if self.store.update_download_item(self.id, update).is_none() {
            debug!("[SESSION] No download item for {}", self.id);
        }
    }

    /// Applies one event.
    pub(super) fn apply(&mut self, event: FetcherEventKind) {
        if let FetcherEventKind::Cancelled = event {
            self.cancelled = true;
            self.set_state(InstallState::DownloadCanceled { at: Utc::now() });
            return;
        }
        if self.cancelled || self.abort.is_aborted() {
            debug!("[SESSION] Ignoring late event for {}: {:?}", self.id, event);
            return;
        }

        match event {
            FetcherEventKind::DownloadStarted { module } => {
                self.last_download_percent = Some(0);
                self.last_unzip_percent = None;
                self.set_state(InstallState::Downloading);
                self.update_item(|item| {
                    item.module = module;
                    item.progress = DownloadProgress::default();
                });
            }
            FetcherEventKind::DownloadProgress {
                module,
                percent,
                part_percent,
                part_index,
                part_count,
            } => {
                if self.last_download_percent == Some(percent) {
                    return;
                }
                self.last_download_percent = Some(percent);
                self.update_item(|item| {
                    item.module = module;
                    item.progress.total_percent = percent;
                    item.progress.split_part_percent = part_percent;
                    item.progress.split_part_index = part_index;
                    item.progress.split_part_count = part_count;
                });
            }
            FetcherEventKind::DownloadInterrupted => {
                self.update_item(|item| item.progress.interrupted = true);
            }
            FetcherEventKind::PhaseChange {
                phase,
                module_index,
            } => {
                if phase == FetchPhase::InstallFinish {
                    self.ending();
                } else if let Some(index) = module_index {
                    self.update_item(|item| item.module_index = index);
                }
            }
            FetcherEventKind::UnzipStarted { module } => {
                self.last_unzip_percent = Some(0);
                self.set_state(InstallState::Decompressing {
                    percent: 0,
                    entry: None,
                });
                self.update_item(|item| item.module = module);
            }
            FetcherEventKind::UnzipProgress {
                entry_index,
                entry_count,
                entry_name,
            } => {
                let percent = unzip_percent(entry_index, entry_count);
                if self.last_unzip_percent == Some(percent) {
                    return;
                }
                self.last_unzip_percent = Some(percent);
                self.set_state(InstallState::Decompressing {
                    percent,
                    entry: Some(entry_name),
                });
            }
            FetcherEventKind::CopyStarted { module } => {
                if module == FULL_INSTALL_MODULE {
                    self.ending();
                }
            }
            FetcherEventKind::RetryScheduled {
                module,
                retry_count,
                wait_seconds,
            } => {
                debug!(
                    "[SESSION] {} retry {} of '{}' in {}s",
                    self.id, retry_count, module, wait_seconds
                );
                self.set_state(InstallState::DownloadRetry {
                    retry_count,
                    wait_seconds,
                });
                self.update_item(|item| item.progress.interrupted = false);
            }
            FetcherEventKind::RetryStarted { .. } => {
                self.last_download_percent = None;
                self.set_state(InstallState::Downloading);
            }
            FetcherEventKind::Error { message } => {
                warn!("[SESSION] Fetcher error for {}: {}", self.id, message);
                self.error = Some(message);
            }
            FetcherEventKind::Cancelled => {}
        }
    }
}
