//! The install operation.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::incompatible::find_incompatible;
use super::preflight::DiskCheck;
use super::session::SessionTranslator;
use super::swap::swap_into_place;
use super::{InstallError, InstallResult, Orchestrator};
use crate::abort::AbortHandle;
use crate::catalog::{Addon, AddonTrack, Publisher};
use crate::fetcher::{FetchError, FetchRequest, SessionId, UpdateCheckOptions};
use crate::fsutil::remove_path;
use crate::paths::{Location, sanitize_relative};
use crate::prompt::{Answer, Prompt};
use crate::settings::dont_ask_optional_dependency_key;
use crate::state::{AddonId, DownloadItem, InstallState, InstallStatus};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How an install ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Installed.
    Done,
    /// The user declined a prompt before the download started.
    Declined,
    /// The abort signal was observed.
    Aborted,
}

/// Runs blocking filesystem work off the async threads.
async fn blocking<T, F>(work: F) -> Result<T, InstallError>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(work)
        .await
        .map_err(std::io::Error::other)??)
}

/// First path component of a target directory, the folder an addon
/// occupies in the install root.
fn top_level_folder(target_directory: &str) -> Option<String> {
    match sanitize_relative(target_directory).components().next() {
        Some(Component::Normal(name)) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

impl Orchestrator {
    /// Installs or updates an addon and its dependencies.
    ///
    /// Always resolves: errors are returned as `InstallResult::Failure`, and
    /// on `Failure` or `Cancelled` the install directory is unchanged.
    pub async fn install(&self, publisher: &str, addon: &str) -> InstallResult {
        self.install_inner(AddonId::new(publisher, addon), None).await
    }

    fn install_inner(
        &self,
        id: AddonId,
        dependency_of: Option<AddonId>,
    ) -> BoxFuture<'_, InstallResult> {
        Box::pin(async move {
            let (publisher, addon) = match self.find(&id) {
                Ok(found) => found,
                Err(e) => return InstallResult::Failure(e),
            };

            // Reserve the abort slot and the download item before any I/O so
            // capacity and double-install conflicts fail fast.
            let handle = match self.inner.aborts.allocate() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("[INSTALL] Cannot start {}: {}", id, e);
                    return InstallResult::Failure(InstallError::Capacity(e));
                }
            };
            if !self
                .inner
                .store
                .try_insert_download_item(&id, DownloadItem::new(handle.id))
            {
                self.inner.aborts.release(handle.id);
                warn!("[INSTALL] {} is already being installed", id);
                return InstallResult::Failure(InstallError::AlreadyInstalling(id.to_string()));
            }
            self.inner.revert.cancel(&id);

            info!(
                "[INSTALL] Installing {} (slot {}{})",
                id,
                handle.id,
                dependency_of
                    .as_ref()
                    .map(|p| format!(", dependency of {}", p))
                    .unwrap_or_default()
            );

            let outcome = self
                .run_install(&id, publisher, addon, &handle, dependency_of.as_ref())
                .await;
            self.finish(&id, &handle, addon, outcome).await
        })
    }

    /// Releases the session's resources and records the terminal state.
    async fn finish(
        &self,
        id: &AddonId,
        handle: &AbortHandle,
        addon: &Addon,
        outcome: Result<Flow, InstallError>,
    ) -> InstallResult {
        let store = &self.inner.store;

        // The item goes first: a slot is free only once nothing references it.
        store.remove_download_item(id);
        self.inner.aborts.release(handle.id);
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.remove(id);
        }

        match outcome {
            Ok(Flow::Done) => {
                info!("[INSTALL] {} installed", id);
                self.schedule_revert(id);
                InstallResult::Success
            }
            Ok(Flow::Declined) => {
                info!("[INSTALL] {} not installed, user declined", id);
                self.refresh_status(&id.publisher, &id.addon).await;
                InstallResult::Cancelled
            }
            Ok(Flow::Aborted) => {
                info!("[INSTALL] {} cancelled", id);
                store.set_install_state(id, InstallState::DownloadCanceled { at: Utc::now() });
                self.schedule_revert(id);
                InstallResult::Cancelled
            }
            Err(e) => {
                error!("[INSTALL] {} failed: {}", id, e);
                store.set_install_state(
                    id,
                    InstallState::DownloadError {
                        message: e.to_string(),
                    },
                );
                // A failed dependency was already reported by its own install.
                if !matches!(e, InstallError::DependencyFailed { .. }) {
                    self.inner.reporter.capture(&id.to_string(), &e);
                    self.inner
                        .prompter
                        .notify(&Prompt::InstallFailed {
                            addon: addon.name.clone(),
                            message: e.to_string(),
                        })
                        .await;
                }
                self.schedule_revert(id);
                InstallResult::Failure(e)
            }
        }
    }

    fn schedule_revert(&self, id: &AddonId) {
        let this = self.clone();
        let target = id.clone();
        self.inner.revert.schedule(id, async move {
            if this.inner.store.download_item(&target).is_none() {
                this.refresh_status(&target.publisher, &target.addon).await;
            }
        });
    }

    async fn run_install(
        &self,
        id: &AddonId,
        publisher: &Publisher,
        addon: &Addon,
        handle: &AbortHandle,
        dependency_of: Option<&AddonId>,
    ) -> Result<Flow, InstallError> {
        let store = &self.inner.store;
        store.set_install_state(id, InstallState::DownloadPending);

        let install_dir = self.inner.resolver.install_dir(addon);
        if install_dir == self.inner.resolver.root(Location::InstallRoot) {
            return Err(InstallError::InvalidTarget(id.to_string()));
        }

        if !self.confirm_apps_closed(addon).await {
            return Ok(Flow::Declined);
        }
        if handle.signal.is_aborted() {
            return Ok(Flow::Aborted);
        }

        let track = self.selected_track_of(id, addon)?;

        if let Some(flow) = self.install_dependencies(id, publisher, addon, handle).await? {
            return Ok(flow);
        }
        if handle.signal.is_aborted() {
            return Ok(Flow::Aborted);
        }

        if !self.check_incompatible(addon).await? {
            return Ok(Flow::Declined);
        }
        if handle.signal.is_aborted() {
            return Ok(Flow::Aborted);
        }

        let info = self
            .inner
            .fetcher
            .needs_update(&track.url, &install_dir, UpdateCheckOptions::default())
            .await?;
        debug!(
            "[INSTALL] {}: {} byte(s) to write, {} module(s)",
            id,
            info.required_disk_space,
            info.module_count()
        );

        if !self.check_disk_space(addon, &install_dir, info.required_disk_space).await {
            return Ok(Flow::Declined);
        }
        if handle.signal.is_aborted() {
            return Ok(Flow::Aborted);
        }

        let module_count = info.module_count();
        store.update_download_item(id, |item| item.module_count = module_count);
        store.set_install_state(id, InstallState::DownloadPrep);

        let temp_dir = self.inner.resolver.temp(addon)?;
        let result = self
            .download_and_swap(id, track, handle, dependency_of, &temp_dir, &install_dir)
            .await;

        let cleanup = temp_dir.clone();
        if let Err(e) = blocking(move || remove_path(&cleanup)).await {
            warn!("[INSTALL] Could not remove {}: {}", temp_dir.display(), e);
        }

        if result? == Flow::Aborted {
            return Ok(Flow::Aborted);
        }

        self.complete(id, addon, track).await;
        Ok(Flow::Done)
    }

    /// Installs the addon's dependencies that are not up to date.
    ///
    /// Returns `Some(flow)` when the parent must stop.
    async fn install_dependencies(
        &self,
        id: &AddonId,
        publisher: &Publisher,
        addon: &Addon,
        handle: &AbortHandle,
    ) -> Result<Option<Flow>, InstallError> {
        let store = &self.inner.store;

        for dependency in &addon.dependencies {
            let Some((dep_publisher, dep_addon)) =
                self.inner.catalog.resolve_dependency(dependency)
            else {
                return Err(InstallError::UnresolvedDependency {
                    addon: id.to_string(),
                    dependency: dependency.addon.clone(),
                });
            };
            let dep_id = AddonId::new(&dep_publisher.key, &dep_addon.key);

            let status = self
                .determine_addon_install_status(&dep_id.publisher, &dep_id.addon)
                .await;
            if matches!(status, InstallStatus::UpToDate | InstallStatus::GitInstall) {
                debug!("[INSTALL] Dependency {} is {}", dep_id, status);
                continue;
            }

            if dependency.optional && status == InstallStatus::NotInstalled {
                let key = dont_ask_optional_dependency_key(
                    &publisher.key,
                    &addon.key,
                    &dependency.addon,
                );
                if self.inner.settings.get_bool(&key) == Some(true) {
                    debug!("[INSTALL] Skipping optional {} (don't ask again)", dep_id);
                    continue;
                }

                let answer = self
                    .inner
                    .prompter
                    .ask(&Prompt::OptionalDependency {
                        addon: addon.name.clone(),
                        dependency: dep_addon.name.clone(),
                        text: dependency.modal_text.clone(),
                    })
                    .await;
                match answer {
                    Answer::Yes => {}
                    Answer::No => {
                        info!("[INSTALL] Optional dependency {} declined", dep_id);
                        continue;
                    }
                    Answer::Never => {
                        info!("[INSTALL] Optional dependency {} declined for good", dep_id);
                        if let Err(e) = self.inner.settings.set_bool(&key, true) {
                            warn!("[INSTALL] Could not save '{}': {}", key, e);
                        }
                        continue;
                    }
                }
            }

            if handle.signal.is_aborted() {
                return Ok(Some(Flow::Aborted));
            }

            store.set_install_state(
                id,
                InstallState::InstallingDependency {
                    dependency: dep_id.to_string(),
                },
            );

            match self.install_inner(dep_id.clone(), Some(id.clone())).await {
                InstallResult::Success => {
                    store.set_install_state(id, InstallState::DownloadPending);
                }
                InstallResult::Failure(e) => {
                    return Err(InstallError::DependencyFailed {
                        dependency: dep_id.to_string(),
                        source: Box::new(e),
                    });
                }
                InstallResult::Cancelled => {
                    let flow = if handle.signal.is_aborted() {
                        Flow::Aborted
                    } else {
                        Flow::Declined
                    };
                    return Ok(Some(flow));
                }
            }
        }

        Ok(None)
    }

    /// Asks to continue if conflicting packages are installed. Returns false
    /// when the user declines.
    async fn check_incompatible(&self, addon: &Addon) -> Result<bool, InstallError> {
        if addon.incompatible_addons.is_empty() {
            return Ok(true);
        }

        let root = self.inner.resolver.root(Location::InstallRoot).to_path_buf();
        let own = top_level_folder(&addon.target_directory);
        let signatures = addon.incompatible_addons.clone();
        let found = blocking(move || Ok(find_incompatible(&root, own.as_deref(), &signatures))).await?;
        if found.is_empty() {
            return Ok(true);
        }

        info!("[INSTALL] {} incompatible package(s) for {}", found.len(), addon.key);
        Ok(self
            .inner
            .prompter
            .confirm(&Prompt::IncompatibleAddons {
                addon: addon.name.clone(),
                found: found.into_iter().map(|m| (m.folder, m.description)).collect(),
            })
            .await)
    }

    /// Checks free space at the destination and the temp root. Returns
    /// false when space is short and the user declines.
    async fn check_disk_space(&self, addon: &Addon, install_dir: &Path, required: u64) -> bool {
        let temp_root = self.inner.resolver.root(Location::TempRoot);
        let check = DiskCheck {
            required,
            free_in_destination: self.inner.free_space.free_bytes(install_dir).await,
            free_in_temp: self.inner.free_space.free_bytes(temp_root).await,
        };
        if !check.is_insufficient() {
            return true;
        }

        warn!("[INSTALL] Low disk space for {}: {:?}", addon.key, check);
        // Not suppressible.
        self.inner
            .prompter
            .confirm(&Prompt::DiskSpace {
                addon: addon.name.clone(),
                required: check.required,
                free_in_destination: check.free_in_destination,
                free_in_temp: check.free_in_temp,
            })
            .await
    }

    /// Runs the fetcher session and, unless aborted, swaps the result into
    /// the install directory.
    async fn download_and_swap(
        &self,
        id: &AddonId,
        track: &AddonTrack,
        handle: &AbortHandle,
        dependency_of: Option<&AddonId>,
        temp_dir: &Path,
        install_dir: &Path,
    ) -> Result<Flow, InstallError> {
        let session = SessionId::new();
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.insert(id.clone(), session);
        }
        debug!("[INSTALL] {} session {}", id, session);

        // Subscribe before starting so no event is missed.
        let mut events = self.inner.events.subscribe();
        let mut translator =
            SessionTranslator::new(&self.inner.store, id, dependency_of, &handle.signal);

        let request = FetchRequest {
            session,
            url: track.url.clone(),
            temp_dir: temp_dir.to_path_buf(),
            dest_dir: install_dir.to_path_buf(),
            abort: handle.signal.clone(),
            events: self.inner.events.emitter(session),
        };
        let fetch = self.inner.fetcher.install(request);
        tokio::pin!(fetch);

        let finished = loop {
            tokio::select! {
                result = &mut fetch => break Some(result),
                event = events.recv() => match event {
                    Ok(event) if event.session == session => translator.apply(event.kind),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[INSTALL] {} missed {} fetcher event(s)", id, skipped);
                    }
                    Err(RecvError::Closed) => break None,
                },
            }
        };
        let result = match finished {
            Some(result) => result,
            None => fetch.await,
        };
        while let Ok(event) = events.try_recv() {
            if event.session == session {
                translator.apply(event.kind);
            }
        }

        match result {
            Err(FetchError::Cancelled) => return Ok(Flow::Aborted),
            Err(e) if handle.signal.is_aborted() => {
                debug!("[INSTALL] {} aborted with error: {}", id, e);
                return Ok(Flow::Aborted);
            }
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        if translator.cancelled() || handle.signal.is_aborted() {
            return Ok(Flow::Aborted);
        }
        if let Some(message) = translator.take_error() {
            return Err(InstallError::FetcherReported(message));
        }

        let (from, to): (PathBuf, PathBuf) = (temp_dir.to_path_buf(), install_dir.to_path_buf());
        blocking(move || swap_into_place(&from, &to)).await?;
        Ok(Flow::Done)
    }

    /// Post-swap bookkeeping of a successful install.
    async fn complete(&self, id: &AddonId, addon: &Addon, track: &AddonTrack) {
        let store = &self.inner.store;

        for legacy in self.inner.resolver.alternative_install_dirs(addon) {
            let path = legacy.clone();
            match blocking(move || remove_path(&path)).await {
                Ok(()) => debug!("[INSTALL] Cleaned up {}", legacy.display()),
                Err(e) => warn!("[INSTALL] Could not remove {}: {}", legacy.display(), e),
            }
        }

        store.set_installed_track(id, &track.key);
        store.set_install_state(id, InstallState::DownloadDone);

        let Some(service) = &addon.background_service else {
            return;
        };
        if !service.enable_autostart_configuration || !service.autostart_prompt {
            return;
        }
        if self.inner.services.is_autostart_enabled(id).await {
            return;
        }
        let enable = self
            .inner
            .prompter
            .confirm(&Prompt::EnableAutostart {
                addon: addon.name.clone(),
            })
            .await;
        if enable {
            if let Err(e) = self.inner.services.set_autostart(id, true).await {
                warn!("[INSTALL] Could not enable autostart for {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_folder() {
        assert_eq!(top_level_folder("flybywire-a32nx"), Some("flybywire-a32nx".to_string()));
        assert_eq!(top_level_folder("../../vendor/pkg"), Some("vendor".to_string()));
        assert_eq!(top_level_folder(""), None);
    }
}
