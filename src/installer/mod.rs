//! Addon install orchestrator.
//!
//! Drives the lifecycle of an addon: status determination, dependency
//! resolution, incompatibility and disk space checks, the cancellable
//! download session and the atomic swap into the install directory.
//!
//! The orchestrator is the only writer of the [`InstallStateStore`]. It is
//! cheap to clone; clones share the same store, abort registry and timers.

mod error;
mod incompatible;
mod install;
mod preflight;
mod revert;
mod session;
mod status;
mod swap;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::abort::{AbortRegistry, DEFAULT_ABORT_CAPACITY};
use crate::apps::AppStatus;
use crate::catalog::{Addon, Catalog, Publisher};
use crate::disk::FreeSpace;
use crate::fetcher::{EventBus, PackageFetcher, SessionId};
use crate::fsutil::remove_path;
use crate::paths::{DirectoryResolver, Location};
use crate::prompt::{Prompt, Prompter};
use crate::reporting::ErrorReporter;
use crate::service::BackgroundServiceControl;
use crate::settings::Settings;
use crate::state::{AddonId, InstallState, InstallStateStore, InstallStatus};

pub use error::{InstallError, InstallResult, UninstallResult};
pub use incompatible::{IncompatibleMatch, find_incompatible};
pub use preflight::{DiskCheck, SAFETY_MARGIN_BYTES, required_with_margin};
pub use revert::REVERT_DELAY;
pub use session::unzip_percent;

use revert::RevertScheduler;

/// Collaborators the orchestrator works with.
pub struct OrchestratorDeps {
    /// Addon catalog.
    pub catalog: Arc<Catalog>,
    /// Path resolution.
    pub resolver: DirectoryResolver,
    /// Install state store.
    pub store: Arc<InstallStateStore>,
    /// Package fetcher.
    pub fetcher: Arc<dyn PackageFetcher>,
    /// Event bus the fetcher publishes on.
    pub events: EventBus,
    /// User prompts.
    pub prompter: Arc<dyn Prompter>,
    /// External app status.
    pub apps: Arc<dyn AppStatus>,
    /// Persisted settings.
    pub settings: Arc<dyn Settings>,
    /// Background service autostart control.
    pub services: Arc<dyn BackgroundServiceControl>,
    /// Error reporting.
    pub reporter: Arc<dyn ErrorReporter>,
    /// Free space queries.
    pub free_space: Arc<dyn FreeSpace>,
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Number of installs that may run at once.
    pub abort_capacity: usize,
    /// Delay before a finished install reverts to a steady state.
    pub revert_delay: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            abort_capacity: DEFAULT_ABORT_CAPACITY,
            revert_delay: REVERT_DELAY,
        }
    }
}

struct Inner {
    catalog: Arc<Catalog>,
    resolver: DirectoryResolver,
    store: Arc<InstallStateStore>,
    fetcher: Arc<dyn PackageFetcher>,
    events: EventBus,
    prompter: Arc<dyn Prompter>,
    apps: Arc<dyn AppStatus>,
    settings: Arc<dyn Settings>,
    services: Arc<dyn BackgroundServiceControl>,
    reporter: Arc<dyn ErrorReporter>,
    free_space: Arc<dyn FreeSpace>,
    aborts: AbortRegistry,
    revert: RevertScheduler,
    sessions: Mutex<HashMap<AddonId, SessionId>>,
}

/// The addon install orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Creates an orchestrator with default options.
    #[must_use]
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self::with_options(deps, OrchestratorOptions::default())
    }

    /// Creates an orchestrator.
    #[must_use]
    pub fn with_options(deps: OrchestratorDeps, options: OrchestratorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog: deps.catalog,
                resolver: deps.resolver,
                store: deps.store,
                fetcher: deps.fetcher,
                events: deps.events,
                prompter: deps.prompter,
                apps: deps.apps,
                settings: deps.settings,
                services: deps.services,
                reporter: deps.reporter,
                free_space: deps.free_space,
                aborts: AbortRegistry::new(options.abort_capacity),
                revert: RevertScheduler::new(options.revert_delay),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<InstallStateStore> {
        &self.inner.store
    }

    /// Returns the fetcher event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Returns the directory resolver.
    #[must_use]
    pub fn resolver(&self) -> &DirectoryResolver {
        &self.inner.resolver
    }

    /// Returns abort slots currently in use.
    #[must_use]
    pub fn active_abort_ids(&self) -> Vec<usize> {
        self.inner.aborts.in_use()
    }

    fn find(&self, id: &AddonId) -> Result<(&Publisher, &Addon), InstallError> {
        self.inner
            .catalog
            .find_addon(&id.publisher, &id.addon)
            .ok_or_else(|| InstallError::UnknownAddon(id.to_string()))
    }

    /// Returns the install state of an addon, determining it on first use.
    pub async fn install_state(&self, publisher: &str, addon: &str) -> InstallState {
        let id = AddonId::new(publisher, addon);
        if let Some(state) = self.inner.store.install_state(&id) {
            return state;
        }
        let status = self.refresh_status(publisher, addon).await;
        InstallState::from_steady(status).unwrap_or(InstallState::Unknown)
    }

    /// Determines the status of an addon and stores it.
    ///
    /// An addon with an install in flight keeps its current state.
    pub async fn refresh_status(&self, publisher: &str, addon: &str) -> InstallStatus {
        let id = AddonId::new(publisher, addon);
        let status = self.determine_addon_install_status(publisher, addon).await;
        if self.inner.store.download_item(&id).is_some() {
            debug!("[STATUS] {} is installing, not overwriting its state", id);
            return status;
        }
        if let Some(state) = InstallState::from_steady(status) {
            self.inner.store.set_install_state(&id, state);
        }
        status
    }

    /// Sets the selected track of every addon and determines its status.
    ///
    /// The selected track defaults to the installed one, then to the
    /// addon's first track.
    pub async fn initialize(&self) {
        let ids: Vec<AddonId> = self
            .inner
            .catalog
            .addons()
            .map(|(p, a)| AddonId::new(&p.key, &a.key))
            .collect();

        for id in ids {
            if self.inner.store.selected_track(&id).is_none() {
                if let Ok((_, addon)) = self.find(&id) {
                    let dir = self.inner.resolver.install_dir(addon);
                    let installed = self
                        .inner
                        .fetcher
                        .installed_source(&dir)
                        .await
                        .and_then(|source| addon.track_for_source(&source))
                        .or_else(|| addon.default_track())
                        .map(|t| t.key.clone());
                    if let Some(track) = installed {
                        self.inner.store.set_selected_track(&id, &track);
                    }
                }
            }
            let status = self.refresh_status(&id.publisher, &id.addon).await;
            debug!("[STATUS] {} initialized as {}", id, status);
        }
        info!("[INSTALL] Initialized {} addon(s)", self.inner.catalog.addons().count());
    }

    /// Selects the track to install and re-evaluates the addon's status.
    pub async fn select_track(
        &self,
        publisher: &str,
        addon: &str,
        track: &str,
    ) -> Result<InstallStatus, InstallError> {
        let id = AddonId::new(publisher, addon);
        let (_, entry) = self.find(&id)?;
        if entry.track(track).is_none() {
            return Err(InstallError::UnknownTrack {
                addon: id.to_string(),
                track: track.to_string(),
            });
        }

        info!("[INSTALL] {} track -> {}", id, track);
        self.inner.store.set_selected_track(&id, track);
        Ok(self.refresh_status(publisher, addon).await)
    }

    /// Cancels the in-flight install of an addon.
    ///
    /// While the addon waits on a dependency, the dependency's install is
    /// cancelled as well, down the whole chain.
    pub fn cancel(&self, publisher: &str, addon: &str) -> Result<(), InstallError> {
        let id = AddonId::new(publisher, addon);
        let mut current = Some(id.clone());
        let mut seen = HashSet::new();
        let mut tripped = false;

        while let Some(cur) = current.take() {
            if !seen.insert(cur.clone()) {
                break;
            }

            if let Some(item) = self.inner.store.download_item(&cur) {
                match self.inner.aborts.cancel(item.abort_controller_id) {
                    Ok(()) => {
                        info!(
                            "[INSTALL] Cancel requested for {} (slot {})",
                            cur, item.abort_controller_id
                        );
                        tripped = true;
                        let session = self
                            .inner
                            .sessions
                            .lock()
                            .ok()
                            .and_then(|s| s.get(&cur).copied());
                        if let Some(session) = session {
                            self.inner.fetcher.cancel(session);
                        }
                    }
                    Err(e) => warn!("[INSTALL] Cannot cancel {}: {}", cur, e),
                }
            }

            current = match self.inner.store.install_state(&cur) {
                Some(InstallState::InstallingDependency { dependency })
                | Some(InstallState::InstallingDependencyEnding { dependency }) => {
                    AddonId::parse(&dependency)
                }
                _ => None,
            };
        }

        if tripped {
            Ok(())
        } else {
            Err(InstallError::NothingInFlight(id.to_string()))
        }
    }

    /// Returns names of disallowed external apps that are running.
    async fn running_disallowed_apps(&self, addon: &Addon) -> Vec<String> {
        let mut running = Vec::new();
        for reference in &addon.disallowed_running_external_apps {
            let Some(app) = self.inner.catalog.resolve_external_app(reference) else {
                warn!("[INSTALL] Unknown external app '{}' on {}", reference, addon.key);
                continue;
            };
            if self.inner.apps.is_open(app).await {
                running.push(app.name.clone());
            }
        }
        running
    }

    /// Asks to continue if disallowed apps are running. Returns false when
    /// the user declines.
    async fn confirm_apps_closed(&self, addon: &Addon) -> bool {
        let running = self.running_disallowed_apps(addon).await;
        if running.is_empty() {
            return true;
        }
        info!("[INSTALL] {} has running apps: {:?}", addon.key, running);
        self.inner
            .prompter
            .confirm(&Prompt::RunningApps {
                addon: addon.name.clone(),
                apps: running,
            })
            .await
    }

    /// Removes an installed addon.
    pub async fn uninstall(
        &self,
        publisher: &str,
        addon: &str,
    ) -> Result<UninstallResult, InstallError> {
        let id = AddonId::new(publisher, addon);
        let (_, entry) = self.find(&id)?;

        let install_dir = self.inner.resolver.install_dir(entry);
        if install_dir == self.inner.resolver.root(Location::InstallRoot) {
            return Err(InstallError::InvalidTarget(id.to_string()));
        }
        if self.inner.store.download_item(&id).is_some() {
            return Err(InstallError::AlreadyInstalling(id.to_string()));
        }

        let confirmed = self
            .inner
            .prompter
            .confirm(&Prompt::Uninstall {
                addon: entry.name.clone(),
            })
            .await;
        if !confirmed || !self.confirm_apps_closed(entry).await {
            info!("[INSTALL] Uninstall of {} declined", id);
            return Ok(UninstallResult::Cancelled);
        }

        if entry.background_service.is_some()
            && self.inner.services.is_autostart_enabled(&id).await
        {
            self.inner.services.set_autostart(&id, false).await?;
        }

        self.inner.revert.cancel(&id);

        let cache_dir = self.inner.resolver.package_cache_dir(entry);
        info!("[INSTALL] Removing {} from {}", id, install_dir.display());
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            remove_path(&install_dir)?;
            remove_path(&cache_dir)
        })
        .await
        .map_err(std::io::Error::other)??;

        self.inner
            .store
            .set_install_state(&id, InstallState::NotInstalled);
        self.inner.store.clear_installed_track(&id);
        Ok(UninstallResult::Removed)
    }
}
