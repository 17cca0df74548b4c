//! Integration tests for the install orchestrator.
//!
//! These tests drive complete install, cancel and uninstall flows against
//! scripted collaborators:
//! - A fetcher that builds a small tree in the temp directory and can fail,
//!   report an error event, or wait for the abort signal
//! - A prompter with per-prompt answers that records what it was asked
//! - Fake app status, free space and error reporting

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};

use hangar::apps::AppStatus;
use hangar::catalog::{Addon, AddonTrack, Catalog, ExternalApp, Publisher};
use hangar::disk::FreeSpace;
use hangar::fetcher::{
    EventBus, FetchError, FetchPhase, FetchRequest, FetcherEventKind, PackageFetcher,
    UpdateCheckOptions, UpdateInfo,
};
use hangar::installer::{
    InstallError, InstallResult, Orchestrator, OrchestratorDeps, OrchestratorOptions,
    UninstallResult,
};
use hangar::paths::DirectoryResolver;
use hangar::prompt::{Answer, Prompt, Prompter};
use hangar::reporting::ErrorReporter;
use hangar::service::SettingsAutostart;
use hangar::settings::{
    MemorySettings, Settings, autostart_key, dont_ask_optional_dependency_key,
};
use hangar::state::{AddonId, InstallState, InstallStateStore, InstallStatus, StoreEvent};

// ============================================================================
// Fixtures
// ============================================================================

const CATALOG: &str = r#"
[[publishers]]
key = "navigraph"
name = "Navigraph"

[[publishers.addons]]
key = "charts"
name = "Navigraph Charts"
target_directory = "navigraph-charts"

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://charts/stable"

[[publishers.addons.tracks]]
key = "beta"
name = "Beta"
url = "mem://charts/beta"

[[publishers]]
key = "flybywire"
name = "FlyByWire Simulations"

[[publishers.external_apps]]
key = "msfs"
name = "Microsoft Flight Simulator"
kind = { type = "executable", name = "FlightSimulator.exe" }

[[publishers.addons]]
key = "a32nx"
name = "A32NX"
target_directory = "flybywire-aircraft-a320-neo"
alternative_names = ["A32NX"]
disallowed_running_external_apps = ["@flybywire/msfs"]

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://a32nx/stable"

[[publishers.addons.dependencies]]
addon = "@navigraph/charts"
optional = true
modal_text = "Charts are shown on the EFB."

[[publishers.addons]]
key = "simbridge"
name = "SimBridge"
target_directory = "flybywire-simbridge"

[publishers.addons.background_service]
executable_file_base_name = "fbw-simbridge"
enable_autostart_configuration = true
autostart_prompt = true

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://simbridge/stable"

[[publishers.addons]]
key = "kiosk"
name = "Kiosk"
target_directory = "flybywire-kiosk"

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://kiosk/stable"

[[publishers.addons.dependencies]]
addon = "@flybywire/simbridge"

[[publishers.addons]]
key = "liveries"
name = "Livery Pack"
target_directory = "flybywire-liveries"

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://liveries/stable"

[[publishers.addons.incompatible_addons]]
title = "Old Liveries"
creator = "Someone"
package_version = "<2.0.0"
description = "Overwrites the same texture files"

[[publishers.addons]]
key = "legacy"
name = "Legacy"
target_directory = "legacy"
hidden = true

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://legacy/stable"
"#;

/// An addon installed below a directory that is also one of its legacy names.
const NESTED_CATALOG: &str = r#"
[[publishers]]
key = "acme"
name = "Acme"

[[publishers.addons]]
key = "nested"
name = "Nested Panel"
target_directory = "vendor/nested"
alternative_names = ["vendor", "vendor/nested/panel", "vendor/old"]

[[publishers.addons.tracks]]
key = "stable"
name = "Stable"
url = "mem://nested/stable"
"#;

/// Delay before finished installs revert, short enough for tests.
const REVERT: Duration = Duration::from_millis(150);

/// Bytes the scripted fetcher reports as required.
const REQUIRED_BYTES: u64 = 4096;

/// File recording what a scripted install was built from.
const MARKER: &str = ".fake-source";

/// Behaviour of the scripted fetcher for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Succeed,
    Fail(String),
    Report(String),
    Hang,
}

#[derive(Default)]
struct ScriptedFetcher {
    modes: Mutex<HashMap<String, Mode>>,
    versions: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    started: Notify,
}

impl ScriptedFetcher {
    fn set_mode(&self, url: &str, mode: Mode) {
        self.modes.lock().unwrap().insert(url.to_string(), mode);
    }

    fn publish(&self, url: &str, version: u32) {
        self.versions.lock().unwrap().insert(url.to_string(), version);
    }

    fn version(&self, url: &str) -> u32 {
        self.versions.lock().unwrap().get(url).copied().unwrap_or(1)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn module_name(url: &str) -> String {
    url.trim_start_matches("mem://").replace('/', "-")
}

fn read_marker(dir: &Path) -> Option<(String, u32)> {
    let text = fs::read_to_string(dir.join(MARKER)).ok()?;
    let (url, version) = text.split_once('\n')?;
    Some((url.to_string(), version.trim().parse().ok()?))
}

#[async_trait]
impl PackageFetcher for ScriptedFetcher {
    async fn needs_update(
        &self,
        url: &str,
        dest_dir: &Path,
        _options: UpdateCheckOptions,
    ) -> Result<UpdateInfo, FetchError> {
        let current = self.version(url);
        Ok(match read_marker(dest_dir) {
            None => UpdateInfo {
                is_fresh_install: true,
                needs_update: true,
                required_disk_space: REQUIRED_BYTES,
                download_size: REQUIRED_BYTES / 2,
                ..UpdateInfo::default()
            },
            Some((installed, version)) => {
                let changed = installed != url || version != current;
                UpdateInfo {
                    needs_update: changed,
                    base_changed: changed,
                    required_disk_space: if changed { REQUIRED_BYTES } else { 0 },
                    ..UpdateInfo::default()
                }
            }
        })
    }

    async fn install(&self, request: FetchRequest) -> Result<(), FetchError> {
        self.calls.lock().unwrap().push(request.url.clone());
        let mode = self
            .modes
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or(Mode::Succeed);
        let events = &request.events;
        let module = module_name(&request.url);

        events.emit(FetcherEventKind::PhaseChange {
            phase: FetchPhase::DownloadingModule,
            module_index: Some(0),
        });
        events.emit(FetcherEventKind::DownloadStarted {
            module: module.clone(),
        });
        fs::create_dir_all(&request.temp_dir)?;

        match &mode {
            Mode::Fail(message) => return Err(FetchError::Source(message.clone())),
            Mode::Hang => {
                self.started.notify_one();
                while !request.abort.is_aborted() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                events.emit(FetcherEventKind::Cancelled);
                return Err(FetchError::Cancelled);
            }
            Mode::Succeed | Mode::Report(_) => {}
        }

        for percent in [0u8, 25, 50, 75, 100] {
            events.emit(FetcherEventKind::DownloadProgress {
                module: module.clone(),
                percent,
                part_percent: None,
                part_index: None,
                part_count: None,
            });
            tokio::task::yield_now().await;
        }

        events.emit(FetcherEventKind::PhaseChange {
            phase: FetchPhase::InstallingModule,
            module_index: Some(0),
        });
        events.emit(FetcherEventKind::UnzipStarted {
            module: module.clone(),
        });
        let version = self.version(&request.url);
        let files = [
            ("layout.json", format!("{} v{}", request.url, version)),
            ("panel/panel.cfg", format!("[VCockpit01] {}", module)),
        ];
        let count = u32::try_from(files.len()).unwrap();
        for (index, (name, content)) in files.iter().enumerate() {
            events.emit(FetcherEventKind::UnzipProgress {
                entry_index: u32::try_from(index).unwrap(),
                entry_count: count,
                entry_name: format!("{}/{}", module, name),
            });
            let path = request.temp_dir.join(name);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, content)?;
            tokio::task::yield_now().await;
        }
        fs::write(
            request.temp_dir.join(MARKER),
            format!("{}\n{}", request.url, version),
        )?;

        if let Mode::Report(message) = mode {
            events.emit(FetcherEventKind::Error { message });
            return Ok(());
        }

        events.emit(FetcherEventKind::PhaseChange {
            phase: FetchPhase::InstallFinish,
            module_index: None,
        });
        events.emit(FetcherEventKind::CopyStarted {
            module: "full".to_string(),
        });
        Ok(())
    }

    async fn installed_source(&self, dest_dir: &Path) -> Option<String> {
        read_marker(dest_dir).map(|(url, _)| url)
    }
}

fn prompt_kind(prompt: &Prompt) -> &'static str {
    match prompt {
        Prompt::RunningApps { .. } => "apps",
        Prompt::OptionalDependency { .. } => "optional",
        Prompt::IncompatibleAddons { .. } => "incompatible",
        Prompt::DiskSpace { .. } => "disk",
        Prompt::Uninstall { .. } => "uninstall",
        Prompt::EnableAutostart { .. } => "autostart",
        Prompt::InstallFailed { .. } => "failed",
    }
}

/// Answers yes unless a prompt kind was declined.
struct ScriptedPrompter {
    declined: Mutex<HashSet<&'static str>>,
    answer: Mutex<Answer>,
    seen: Mutex<Vec<Prompt>>,
}

impl ScriptedPrompter {
    fn new() -> Self {
        Self {
            declined: Mutex::new(HashSet::new()),
            answer: Mutex::new(Answer::Yes),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn decline(&self, kind: &'static str) {
        self.declined.lock().unwrap().insert(kind);
    }

    fn answer_with(&self, answer: Answer) {
        *self.answer.lock().unwrap() = answer;
    }

    fn seen(&self) -> Vec<Prompt> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.seen().iter().filter(|p| prompt_kind(p) == kind).count()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, prompt: &Prompt) -> bool {
        self.seen.lock().unwrap().push(prompt.clone());
        !self.declined.lock().unwrap().contains(prompt_kind(prompt))
    }

    async fn ask(&self, prompt: &Prompt) -> Answer {
        self.seen.lock().unwrap().push(prompt.clone());
        *self.answer.lock().unwrap()
    }

    async fn notify(&self, prompt: &Prompt) {
        self.seen.lock().unwrap().push(prompt.clone());
    }
}

#[derive(Default)]
struct FakeApps {
    open: AtomicBool,
}

#[async_trait]
impl AppStatus for FakeApps {
    async fn is_open(&self, _app: &ExternalApp) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeFreeSpace {
    free: Mutex<Option<u64>>,
}

#[async_trait]
impl FreeSpace for FakeFreeSpace {
    async fn free_bytes(&self, _path: &Path) -> Option<u64> {
        *self.free.lock().unwrap()
    }
}

#[derive(Default)]
struct RecordingReporter {
    captured: Mutex<Vec<String>>,
}

impl ErrorReporter for RecordingReporter {
    fn capture(&self, addon: &str, _error: &InstallError) {
        self.captured.lock().unwrap().push(addon.to_string());
    }
}

struct Harness {
    tmp: TempDir,
    orchestrator: Orchestrator,
    fetcher: Arc<ScriptedFetcher>,
    prompter: Arc<ScriptedPrompter>,
    apps: Arc<FakeApps>,
    free_space: Arc<FakeFreeSpace>,
    settings: Arc<MemorySettings>,
    reporter: Arc<RecordingReporter>,
}

impl Harness {
    fn new() -> Self {
        Self::build(Catalog::from_toml(CATALOG).unwrap(), 4)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self::build(Catalog::from_toml(CATALOG).unwrap(), capacity)
    }

    fn build(catalog: Catalog, capacity: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("Community")).unwrap();
        let resolver = DirectoryResolver::new(
            tmp.path().join("Community"),
            tmp.path().join("temp"),
            tmp.path().join("cache"),
            tmp.path().join("documents"),
        );

        let fetcher = Arc::new(ScriptedFetcher::default());
        let prompter = Arc::new(ScriptedPrompter::new());
        let apps = Arc::new(FakeApps::default());
        let free_space = Arc::new(FakeFreeSpace::default());
        let settings = Arc::new(MemorySettings::new());
        let reporter = Arc::new(RecordingReporter::default());

        let deps = OrchestratorDeps {
            catalog: Arc::new(catalog),
            resolver,
            store: Arc::new(InstallStateStore::new()),
            fetcher: fetcher.clone(),
            events: EventBus::new(),
            prompter: prompter.clone(),
            apps: apps.clone(),
            settings: settings.clone(),
            services: Arc::new(SettingsAutostart::new(settings.clone())),
            reporter: reporter.clone(),
            free_space: free_space.clone(),
        };
        let orchestrator = Orchestrator::with_options(
            deps,
            OrchestratorOptions {
                abort_capacity: capacity,
                revert_delay: REVERT,
            },
        );

        Self {
            tmp,
            orchestrator,
            fetcher,
            prompter,
            apps,
            free_space,
            settings,
            reporter,
        }
    }

    fn install_root(&self) -> PathBuf {
        self.tmp.path().join("Community")
    }

    fn temp_root(&self) -> PathBuf {
        self.tmp.path().join("temp")
    }

    fn state(&self, id: &AddonId) -> Option<InstallState> {
        self.orchestrator.store().install_state(id)
    }

    async fn wait_for_revert(&self) {
        tokio::time::sleep(REVERT * 4).await;
    }
}

/// Install statuses written for `id`, consecutive repeats collapsed.
fn drain_statuses(rx: &mut broadcast::Receiver<StoreEvent>, id: &AddonId) -> Vec<InstallStatus> {
    let mut statuses: Vec<InstallStatus> = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let StoreEvent::InstallState { id: changed, state } = event {
            if &changed == id && statuses.last() != Some(&state.status()) {
                statuses.push(state.status());
            }
        }
    }
    statuses
}

/// Hash over every file name and content below `dir`.
fn snapshot(dir: &Path) -> String {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let name = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.push((name, fs::read(&path).unwrap()));
            }
        }
    }

    if !dir.exists() {
        return "missing".to_string();
    }
    let mut files = Vec::new();
    walk(dir, dir, &mut files);
    files.sort();

    let mut hasher = Sha256::new();
    for (name, content) in files {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);
    }
    format!("{:x}", hasher.finalize())
}

fn dir_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

fn charts() -> AddonId {
    AddonId::new("navigraph", "charts")
}

fn a32nx() -> AddonId {
    AddonId::new("flybywire", "a32nx")
}

// ============================================================================
// Install Tests
// ============================================================================

mod install_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_fresh_install_state_sequence() {
        let h = Harness::new();
        let id = charts();
        let mut rx = h.orchestrator.store().subscribe();

        let result = h.orchestrator.install("navigraph", "charts").await;
        assert!(result.is_success(), "{:?}", result);

        assert_eq!(
            drain_statuses(&mut rx, &id),
            vec![
                InstallStatus::DownloadPending,
                InstallStatus::DownloadPrep,
                InstallStatus::Downloading,
                InstallStatus::Decompressing,
                InstallStatus::DownloadEnding,
                InstallStatus::DownloadDone,
            ]
        );

        let store = h.orchestrator.store();
        assert_eq!(store.installed_track(&id), Some("stable".to_string()));
        assert!(store.download_item(&id).is_none());
        assert!(h.orchestrator.active_abort_ids().is_empty());

        let layout = h.install_root().join("navigraph-charts").join("layout.json");
        assert_eq!(fs::read_to_string(layout).unwrap(), "mem://charts/stable v1");
        assert_eq!(dir_entries(&h.temp_root()), 0);

        h.wait_for_revert().await;
        assert_eq!(h.state(&id), Some(InstallState::UpToDate));
    }

    #[tokio::test]
    async fn test_progress_is_recorded_on_download_item() {
        let h = Harness::new();
        let id = charts();
        let mut rx = h.orchestrator.store().subscribe();

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StoreEvent::DownloadItem {
                id: changed,
                item: Some(item),
            } = event
            {
                if changed == id && percents.last() != Some(&item.progress.total_percent) {
                    percents.push(item.progress.total_percent);
                }
            }
        }
        assert_eq!(percents, vec![0, 25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_reinstall_is_idempotent() {
        let h = Harness::new();
        let dir = h.install_root().join("navigraph-charts");

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let first = snapshot(&dir);
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());

        assert_eq!(snapshot(&dir), first);
        assert_eq!(dir_entries(&h.install_root()), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_content() {
        let h = Harness::new();
        let id = charts();
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());

        h.fetcher.publish("mem://charts/stable", 2);
        assert_eq!(
            h.orchestrator.refresh_status("navigraph", "charts").await,
            InstallStatus::NeedsUpdate
        );

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let layout = h.install_root().join("navigraph-charts").join("layout.json");
        assert_eq!(fs::read_to_string(layout).unwrap(), "mem://charts/stable v2");

        h.wait_for_revert().await;
        assert_eq!(h.state(&id), Some(InstallState::UpToDate));
    }

    #[tokio::test]
    async fn test_track_switch() {
        let h = Harness::new();
        let id = charts();
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());

        let status = h
            .orchestrator
            .select_track("navigraph", "charts", "beta")
            .await
            .unwrap();
        assert_eq!(status, InstallStatus::TrackSwitch);
        assert_eq!(h.state(&id), Some(InstallState::TrackSwitch));

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let store = h.orchestrator.store();
        assert_eq!(store.installed_track(&id), Some("beta".to_string()));
        assert_eq!(h.fetcher.calls().last().unwrap(), "mem://charts/beta");
        assert_eq!(
            h.orchestrator
                .determine_addon_install_status("navigraph", "charts")
                .await,
            InstallStatus::UpToDate
        );
    }

    #[tokio::test]
    async fn test_select_unknown_track() {
        let h = Harness::new();
        let result = h.orchestrator.select_track("navigraph", "charts", "nightly").await;
        assert!(matches!(result, Err(InstallError::UnknownTrack { .. })));
    }

    #[tokio::test]
    async fn test_unknown_addon_fails() {
        let h = Harness::new();
        let result = h.orchestrator.install("nobody", "nothing").await;
        assert!(matches!(result, InstallResult::Failure(InstallError::UnknownAddon(_))));
        assert!(h.fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_alternative_install_dirs_removed() {
        let h = Harness::new();
        h.prompter.answer_with(Answer::No);
        let legacy = h.install_root().join("A32NX");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("layout.json"), "old").unwrap();

        assert!(h.orchestrator.install("flybywire", "a32nx").await.is_success());
        assert!(!legacy.exists());
        assert!(h.install_root().join("flybywire-aircraft-a320-neo").exists());
    }

    #[tokio::test]
    async fn test_legacy_cleanup_keeps_enclosing_and_inner_dirs() {
        let h = Harness::build(Catalog::from_toml(NESTED_CATALOG).unwrap(), 4);
        let old = h.install_root().join("vendor").join("old");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("layout.json"), "old").unwrap();

        assert!(h.orchestrator.install("acme", "nested").await.is_success());

        let install_dir = h.install_root().join("vendor").join("nested");
        assert!(install_dir.join("layout.json").exists());
        assert!(install_dir.join("panel").join("panel.cfg").exists());
        assert!(!old.exists());

        let id = AddonId::new("acme", "nested");
        assert_eq!(h.orchestrator.store().installed_track(&id), Some("stable".to_string()));
    }

    #[tokio::test]
    async fn test_autostart_prompt_after_install() {
        let h = Harness::new();
        let key = autostart_key("flybywire", "simbridge");

        assert!(h.orchestrator.install("flybywire", "simbridge").await.is_success());
        assert_eq!(h.prompter.count("autostart"), 1);
        assert_eq!(h.settings.get_bool(&key), Some(true));

        // Already enabled: not asked again.
        assert!(h.orchestrator.install("flybywire", "simbridge").await.is_success());
        assert_eq!(h.prompter.count("autostart"), 1);
    }

    #[tokio::test]
    async fn test_autostart_declined() {
        let h = Harness::new();
        h.prompter.decline("autostart");

        assert!(h.orchestrator.install("flybywire", "simbridge").await.is_success());
        assert_eq!(
            h.settings.get_bool(&autostart_key("flybywire", "simbridge")),
            None
        );
    }

    #[tokio::test]
    async fn test_invalid_target_directory() {
        let catalog = Catalog {
            publishers: vec![Publisher {
                key: "rogue".to_string(),
                name: "Rogue".to_string(),
                addons: vec![Addon {
                    key: "escape".to_string(),
                    name: "Escape".to_string(),
                    target_directory: "../..".to_string(),
                    tracks: vec![AddonTrack {
                        key: "stable".to_string(),
                        name: "Stable".to_string(),
                        url: "mem://escape/stable".to_string(),
                        ..AddonTrack::default()
                    }],
                    ..Addon::default()
                }],
                ..Publisher::default()
            }],
        };
        let h = Harness::build(catalog, 2);
        fs::write(h.install_root().join("keep.txt"), "keep").unwrap();

        let result = h.orchestrator.install("rogue", "escape").await;
        assert!(matches!(result, InstallResult::Failure(InstallError::InvalidTarget(_))));
        let removed = h.orchestrator.uninstall("rogue", "escape").await;
        assert!(matches!(removed, Err(InstallError::InvalidTarget(_))));

        assert!(h.fetcher.calls().is_empty());
        assert!(h.install_root().join("keep.txt").exists());
    }
}

// ============================================================================
// Prompt Tests
// ============================================================================

mod prompt_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_optional_dependency_declined() {
        let h = Harness::new();
        h.prompter.answer_with(Answer::No);

        let result = h.orchestrator.install("flybywire", "a32nx").await;
        assert!(result.is_success(), "{:?}", result);
        assert_eq!(h.fetcher.calls(), vec!["mem://a32nx/stable".to_string()]);
        assert_eq!(
            h.prompter.seen()[0],
            Prompt::OptionalDependency {
                addon: "A32NX".to_string(),
                dependency: "Navigraph Charts".to_string(),
                text: Some("Charts are shown on the EFB.".to_string()),
            }
        );
        assert!(!h.install_root().join("navigraph-charts").exists());
    }

    #[tokio::test]
    async fn test_optional_dependency_never_ask_again() {
        let h = Harness::new();
        h.prompter.answer_with(Answer::Never);
        let key = dont_ask_optional_dependency_key("flybywire", "a32nx", "@navigraph/charts");

        assert!(h.orchestrator.install("flybywire", "a32nx").await.is_success());
        assert_eq!(h.settings.get_bool(&key), Some(true));
        assert_eq!(h.prompter.count("optional"), 1);

        assert!(h.orchestrator.install("flybywire", "a32nx").await.is_success());
        assert_eq!(h.prompter.count("optional"), 1);
        assert!(!h.fetcher.calls().contains(&"mem://charts/stable".to_string()));
    }

    #[tokio::test]
    async fn test_optional_dependency_accepted() {
        let h = Harness::new();
        let id = a32nx();
        let mut rx = h.orchestrator.store().subscribe();

        assert!(h.orchestrator.install("flybywire", "a32nx").await.is_success());
        assert_eq!(
            h.fetcher.calls(),
            vec!["mem://charts/stable".to_string(), "mem://a32nx/stable".to_string()]
        );
        assert_eq!(
            drain_statuses(&mut rx, &id),
            vec![
                InstallStatus::DownloadPending,
                InstallStatus::InstallingDependency,
                InstallStatus::InstallingDependencyEnding,
                InstallStatus::DownloadPending,
                InstallStatus::DownloadPrep,
                InstallStatus::Downloading,
                InstallStatus::Decompressing,
                InstallStatus::DownloadEnding,
                InstallStatus::DownloadDone,
            ]
        );
        assert_eq!(
            h.orchestrator.store().installed_track(&charts()),
            Some("stable".to_string())
        );
    }

    #[tokio::test]
    async fn test_disk_space_prompt_declined() {
        let h = Harness::new();
        *h.free_space.free.lock().unwrap() = Some(1000);
        h.prompter.decline("disk");

        let result = h.orchestrator.install("navigraph", "charts").await;
        assert!(result.is_cancelled());
        assert!(h.fetcher.calls().is_empty());
        assert_eq!(
            h.prompter.seen(),
            vec![Prompt::DiskSpace {
                addon: "Navigraph Charts".to_string(),
                required: REQUIRED_BYTES,
                free_in_destination: Some(1000),
                free_in_temp: Some(1000),
            }]
        );
        assert_eq!(h.state(&charts()), Some(InstallState::NotInstalled));
    }

    #[tokio::test]
    async fn test_disk_space_prompt_accepted() {
        let h = Harness::new();
        *h.free_space.free.lock().unwrap() = Some(1000);

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        assert_eq!(h.prompter.count("disk"), 1);
    }

    #[tokio::test]
    async fn test_unknown_free_space_skips_prompt() {
        let h = Harness::new();

        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        assert_eq!(h.prompter.count("disk"), 0);
    }

    #[tokio::test]
    async fn test_running_apps_declined() {
        let h = Harness::new();
        h.apps.open.store(true, Ordering::SeqCst);
        h.prompter.decline("apps");

        let result = h.orchestrator.install("flybywire", "a32nx").await;
        assert!(result.is_cancelled());
        assert!(h.fetcher.calls().is_empty());
        assert_eq!(
            h.prompter.seen(),
            vec![Prompt::RunningApps {
                addon: "A32NX".to_string(),
                apps: vec!["Microsoft Flight Simulator".to_string()],
            }]
        );
        assert_eq!(h.state(&a32nx()), Some(InstallState::NotInstalled));
    }

    #[tokio::test]
    async fn test_incompatible_addons_prompt() {
        let h = Harness::new();
        let old = h.install_root().join("old-liveries");
        fs::create_dir_all(&old).unwrap();
        fs::write(
            old.join("manifest.json"),
            r#"{"title":"Old Liveries","creator":"Someone","package_version":"1.2.0"}"#,
        )
        .unwrap();

        h.prompter.decline("incompatible");
        let result = h.orchestrator.install("flybywire", "liveries").await;
        assert!(result.is_cancelled());
        assert_eq!(
            h.prompter.seen(),
            vec![Prompt::IncompatibleAddons {
                addon: "Livery Pack".to_string(),
                found: vec![(
                    "old-liveries".to_string(),
                    "Overwrites the same texture files".to_string()
                )],
            }]
        );

        h.prompter.declined.lock().unwrap().clear();
        assert!(h.orchestrator.install("flybywire", "liveries").await.is_success());
    }
}

// ============================================================================
// Cancellation Tests
// ============================================================================

mod cancel_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_cancel_then_revert() {
        let h = Harness::new();
        let id = charts();
        h.fetcher.set_mode("mem://charts/stable", Mode::Hang);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.install("navigraph", "charts").await });
        h.fetcher.started.notified().await;

        h.orchestrator.cancel("navigraph", "charts").unwrap();
        let result = task.await.unwrap();
        assert!(result.is_cancelled(), "{:?}", result);

        assert_eq!(
            h.state(&id).map(|s| s.status()),
            Some(InstallStatus::DownloadCanceled)
        );
        assert!(!h.install_root().join("navigraph-charts").exists());
        assert!(h.orchestrator.active_abort_ids().is_empty());
        assert_eq!(dir_entries(&h.temp_root()), 0);

        h.wait_for_revert().await;
        assert_eq!(h.state(&id), Some(InstallState::NotInstalled));
    }

    #[tokio::test]
    async fn test_cancel_without_install() {
        let h = Harness::new();
        let result = h.orchestrator.cancel("navigraph", "charts");
        assert!(matches!(result, Err(InstallError::NothingInFlight(_))));
    }

    #[tokio::test]
    async fn test_cancel_follows_dependency_chain() {
        let h = Harness::new();
        h.fetcher.set_mode("mem://charts/stable", Mode::Hang);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.install("flybywire", "a32nx").await });
        h.fetcher.started.notified().await;
        assert_eq!(
            h.state(&a32nx()),
            Some(InstallState::InstallingDependency {
                dependency: "@navigraph/charts".to_string()
            })
        );

        h.orchestrator.cancel("flybywire", "a32nx").unwrap();
        let result = task.await.unwrap();
        assert!(result.is_cancelled(), "{:?}", result);

        assert_eq!(h.fetcher.calls(), vec!["mem://charts/stable".to_string()]);
        assert_eq!(
            h.state(&a32nx()).map(|s| s.status()),
            Some(InstallStatus::DownloadCanceled)
        );
        assert_eq!(
            h.state(&charts()).map(|s| s.status()),
            Some(InstallStatus::DownloadCanceled)
        );
        assert!(h.orchestrator.active_abort_ids().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_fails_fast() {
        let h = Harness::with_capacity(1);
        h.fetcher.set_mode("mem://charts/stable", Mode::Hang);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.install("navigraph", "charts").await });
        h.fetcher.started.notified().await;

        let result = h.orchestrator.install("flybywire", "simbridge").await;
        assert!(matches!(result, InstallResult::Failure(InstallError::Capacity(_))));
        assert_eq!(h.state(&AddonId::new("flybywire", "simbridge")), None);
        assert_eq!(h.fetcher.calls(), vec!["mem://charts/stable".to_string()]);

        h.orchestrator.cancel("navigraph", "charts").unwrap();
        assert!(task.await.unwrap().is_cancelled());

        // The slot is free again.
        assert!(h.orchestrator.install("flybywire", "simbridge").await.is_success());
    }

    #[tokio::test]
    async fn test_double_install_conflict() {
        let h = Harness::new();
        h.fetcher.set_mode("mem://charts/stable", Mode::Hang);

        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.install("navigraph", "charts").await });
        h.fetcher.started.notified().await;

        let second = h.orchestrator.install("navigraph", "charts").await;
        assert!(matches!(second, InstallResult::Failure(InstallError::AlreadyInstalling(_))));
        let removal = h.orchestrator.uninstall("navigraph", "charts").await;
        assert!(matches!(removal, Err(InstallError::AlreadyInstalling(_))));
        assert_eq!(h.orchestrator.active_abort_ids().len(), 1);

        h.orchestrator.cancel("navigraph", "charts").unwrap();
        assert!(task.await.unwrap().is_cancelled());
        assert_eq!(h.fetcher.calls().len(), 1);
    }
}

// ============================================================================
// Failure Tests
// ============================================================================

mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_failed_update_leaves_install_untouched() {
        let h = Harness::new();
        let id = charts();
        let dir = h.install_root().join("navigraph-charts");
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let before = snapshot(&dir);

        h.fetcher.publish("mem://charts/stable", 2);
        h.fetcher
            .set_mode("mem://charts/stable", Mode::Fail("connection refused".to_string()));
        let result = h.orchestrator.install("navigraph", "charts").await;
        assert!(matches!(result, InstallResult::Failure(InstallError::Fetch(_))));

        assert_eq!(snapshot(&dir), before);
        assert_eq!(dir_entries(&h.install_root()), 1);
        assert_eq!(dir_entries(&h.temp_root()), 0);
        assert_eq!(
            h.state(&id).map(|s| s.status()),
            Some(InstallStatus::DownloadError)
        );
        assert_eq!(h.reporter.captured.lock().unwrap().clone(), vec!["@navigraph/charts"]);
        assert_eq!(h.prompter.count("failed"), 1);

        h.wait_for_revert().await;
        assert_eq!(h.state(&id), Some(InstallState::NeedsUpdate));
    }

    #[tokio::test]
    async fn test_reported_error_is_a_failure() {
        let h = Harness::new();
        let dir = h.install_root().join("navigraph-charts");
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let before = snapshot(&dir);

        h.fetcher.publish("mem://charts/stable", 2);
        h.fetcher
            .set_mode("mem://charts/stable", Mode::Report("checksum mismatch".to_string()));
        let result = h.orchestrator.install("navigraph", "charts").await;
        match result {
            InstallResult::Failure(InstallError::FetcherReported(message)) => {
                assert_eq!(message, "checksum mismatch");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(snapshot(&dir), before);
    }

    #[tokio::test]
    async fn test_cancelled_update_leaves_install_untouched() {
        let h = Harness::new();
        let dir = h.install_root().join("navigraph-charts");
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let before = snapshot(&dir);

        h.fetcher.publish("mem://charts/stable", 2);
        h.fetcher.set_mode("mem://charts/stable", Mode::Hang);
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move { orchestrator.install("navigraph", "charts").await });
        h.fetcher.started.notified().await;
        h.orchestrator.cancel("navigraph", "charts").unwrap();

        assert!(task.await.unwrap().is_cancelled());
        assert_eq!(snapshot(&dir), before);
    }

    #[tokio::test]
    async fn test_dependency_failure_propagates() {
        let h = Harness::new();
        h.fetcher
            .set_mode("mem://simbridge/stable", Mode::Fail("404".to_string()));

        let result = h.orchestrator.install("flybywire", "kiosk").await;
        match result {
            InstallResult::Failure(InstallError::DependencyFailed { dependency, source }) => {
                assert_eq!(dependency, "@flybywire/simbridge");
                assert!(matches!(*source, InstallError::Fetch(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(h.fetcher.calls(), vec!["mem://simbridge/stable".to_string()]);
        assert_eq!(
            h.reporter.captured.lock().unwrap().clone(),
            vec!["@flybywire/simbridge"]
        );
        assert_eq!(h.prompter.count("failed"), 1);
        assert_eq!(
            h.state(&AddonId::new("flybywire", "kiosk")).map(|s| s.status()),
            Some(InstallStatus::DownloadError)
        );
        assert!(h.orchestrator.active_abort_ids().is_empty());
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_concurrent_installs_do_not_cross_talk() {
        let h = Harness::new();
        let charts_id = charts();
        let simbridge_id = AddonId::new("flybywire", "simbridge");
        let mut rx = h.orchestrator.store().subscribe();

        let (first, second) = tokio::join!(
            h.orchestrator.install("navigraph", "charts"),
            h.orchestrator.install("flybywire", "simbridge"),
        );
        assert!(first.is_success(), "{:?}", first);
        assert!(second.is_success(), "{:?}", second);

        let expected: HashMap<AddonId, &str> = [
            (charts_id.clone(), "charts-stable"),
            (simbridge_id.clone(), "simbridge-stable"),
        ]
        .into_iter()
        .collect();

        let mut seen_items = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StoreEvent::DownloadItem {
                    id,
                    item: Some(item),
                } if !item.module.is_empty() => {
                    assert_eq!(item.module, expected[&id], "module of {}", id);
                    seen_items += 1;
                }
                StoreEvent::InstallState {
                    id,
                    state: InstallState::Decompressing {
                        entry: Some(entry), ..
                    },
                } => {
                    assert!(entry.starts_with(expected[&id]), "{} got {}", id, entry);
                }
                _ => {}
            }
        }
        assert!(seen_items > 0);

        let layout = |dir: &str| {
            fs::read_to_string(h.install_root().join(dir).join("layout.json")).unwrap()
        };
        assert_eq!(layout("navigraph-charts"), "mem://charts/stable v1");
        assert_eq!(layout("flybywire-simbridge"), "mem://simbridge/stable v1");
    }
}

// ============================================================================
// Status Tests
// ============================================================================

mod status_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_initialize_sets_default_tracks() {
        let h = Harness::new();
        h.orchestrator.initialize().await;

        let store = h.orchestrator.store();
        assert_eq!(store.selected_track(&charts()), Some("stable".to_string()));
        assert_eq!(h.state(&charts()), Some(InstallState::NotInstalled));
        assert_eq!(
            h.state(&AddonId::new("flybywire", "legacy")),
            Some(InstallState::Hidden)
        );
    }

    #[tokio::test]
    async fn test_install_state_determined_lazily() {
        let h = Harness::new();
        assert_eq!(h.state(&charts()), None);
        assert_eq!(
            h.orchestrator.install_state("navigraph", "charts").await,
            InstallState::NotInstalled
        );
        assert_eq!(h.state(&charts()), Some(InstallState::NotInstalled));
    }

    #[tokio::test]
    async fn test_removed_directory_clears_installed_track() {
        let h = Harness::new();
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        fs::remove_dir_all(h.install_root().join("navigraph-charts")).unwrap();

        assert_eq!(
            h.orchestrator.refresh_status("navigraph", "charts").await,
            InstallStatus::NotInstalled
        );
        assert_eq!(h.orchestrator.store().installed_track(&charts()), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_git_install_detected_and_satisfies_dependency() {
        let h = Harness::new();
        let repo = h.tmp.path().join("charts-repo");
        fs::create_dir_all(repo.join(".git")).unwrap();
        fs::create_dir_all(repo.join("build")).unwrap();
        std::os::unix::fs::symlink(repo.join("build"), h.install_root().join("navigraph-charts"))
            .unwrap();

        assert_eq!(
            h.orchestrator
                .determine_addon_install_status("navigraph", "charts")
                .await,
            InstallStatus::GitInstall
        );

        assert!(h.orchestrator.install("flybywire", "a32nx").await.is_success());
        assert_eq!(h.fetcher.calls(), vec!["mem://a32nx/stable".to_string()]);
        assert_eq!(h.prompter.count("optional"), 0);
    }
}

// ============================================================================
// Uninstall Tests
// ============================================================================

mod uninstall_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_uninstall_removes_install() {
        let h = Harness::new();
        let id = charts();
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        let cache = h.tmp.path().join("cache").join("charts");
        fs::create_dir_all(&cache).unwrap();

        let result = h.orchestrator.uninstall("navigraph", "charts").await.unwrap();
        assert_eq!(result, UninstallResult::Removed);
        assert!(!h.install_root().join("navigraph-charts").exists());
        assert!(!cache.exists());
        assert_eq!(h.state(&id), Some(InstallState::NotInstalled));
        assert_eq!(h.orchestrator.store().installed_track(&id), None);
    }

    #[tokio::test]
    async fn test_uninstall_declined() {
        let h = Harness::new();
        assert!(h.orchestrator.install("navigraph", "charts").await.is_success());
        h.prompter.decline("uninstall");

        let result = h.orchestrator.uninstall("navigraph", "charts").await.unwrap();
        assert_eq!(result, UninstallResult::Cancelled);
        assert!(h.install_root().join("navigraph-charts").exists());
    }

    #[tokio::test]
    async fn test_uninstall_disables_autostart() {
        let h = Harness::new();
        let key = autostart_key("flybywire", "simbridge");
        assert!(h.orchestrator.install("flybywire", "simbridge").await.is_success());
        assert_eq!(h.settings.get_bool(&key), Some(true));

        let result = h.orchestrator.uninstall("flybywire", "simbridge").await.unwrap();
        assert_eq!(result, UninstallResult::Removed);
        assert_eq!(h.settings.get_bool(&key), Some(false));
    }
}
