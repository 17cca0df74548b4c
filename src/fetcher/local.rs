//! Package fetcher for local package sources.
//!
//! A source is a directory (plain path or `file://` URL) holding a
//! `modules.json` that lists a base archive and module archives, each a zip
//! file with its sha256 digest. An install directory records what it was
//! built from in `install.json`; module hashes drive the delta decision.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{
    EventEmitter, FetchError, FetchPhase, FetchRequest, FetcherEventKind, PackageFetcher,
    UpdateCheckOptions, UpdateInfo,
};
use crate::abort::AbortSignal;
use crate::fsutil::{copy_dir_recursive, dir_size, remove_path};
use crate::paths::join_sanitized;

/// Source manifest file name.
pub const SOURCE_MANIFEST_FILE: &str = "modules.json";

/// Install manifest file name.
pub const INSTALL_MANIFEST_FILE: &str = "install.json";

/// Source manifest cache expiration (5 minutes).
const CACHE_EXPIRATION_SECS: u64 = 300;

/// Download copy chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Attempts per module before a transient error becomes fatal.
const MAX_RETRIES: u32 = 3;

/// Longest uninterrupted sleep during a retry backoff.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Staging directory for downloaded archives inside the temp directory.
const STAGING_DIR: &str = ".hangar-download";

/// Maximum source manifest size (1MB).
const MAX_MANIFEST_SIZE: u64 = 1_048_576;

/// One archive in a package source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// Module name.
    pub name: String,
    /// Archive file name relative to the source directory.
    pub archive: String,
    /// Lowercase hex sha256 of the archive.
    pub hash: String,
    /// Directory the module extracts to, relative to the install root.
    #[serde(default)]
    pub directory: String,
}

/// The `modules.json` of a package source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    /// Base archive, extracted at the install root.
    pub base: ModuleEntry,
    /// Module archives.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

/// A module recorded in an install manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InstalledModule {
    hash: String,
    directory: String,
}

/// The `install.json` written into every install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InstallManifest {
    source: String,
    base_hash: String,
    modules: BTreeMap<String, InstalledModule>,
}

/// What an install has to do.
#[derive(Debug, Clone)]
struct InstallPlan {
    full: bool,
    fetch: Vec<ModuleEntry>,
    remove: Vec<String>,
    info: UpdateInfo,
}

struct CachedManifest {
    manifest: SourceManifest,
    cached_at: Instant,
}

type ManifestCache = Arc<RwLock<HashMap<String, CachedManifest>>>;

/// Fetcher for directory-based package sources.
#[derive(Clone)]
pub struct LocalFetcher {
    cache: ManifestCache,
    retry_delay: Duration,
}

impl Default for LocalFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFetcher {
    /// Creates a fetcher with a one second base retry delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl PackageFetcher for LocalFetcher {
    async fn needs_update(
        &self,
        url: &str,
        dest_dir: &Path,
        options: UpdateCheckOptions,
    ) -> Result<UpdateInfo, FetchError> {
        let cache = Arc::clone(&self.cache);
        let url = url.to_string();
        let dest_dir = dest_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let manifest = load_source_manifest(&cache, &url, options.force_cache_bust)?;
            let plan = plan_install(&url, &manifest, &dest_dir)?;
            Ok(plan.info)
        })
        .await
        .map_err(|e| FetchError::Source(format!("update check task failed: {e}")))?
    }

    async fn install(&self, request: FetchRequest) -> Result<(), FetchError> {
        let cache = Arc::clone(&self.cache);
        let retry_delay = self.retry_delay;
        let events = request.events.clone();

        let result = tokio::task::spawn_blocking(move || install_blocking(&cache, &request, retry_delay))
            .await
            .map_err(|e| FetchError::Source(format!("install task failed: {e}")))
            .and_then(|r| r);

        match &result {
            Err(FetchError::Cancelled) => events.emit(FetcherEventKind::Cancelled),
            Err(e) => events.emit(FetcherEventKind::Error {
                message: e.to_string(),
            }),
            Ok(()) => {}
        }
        result
    }

    async fn installed_source(&self, dest_dir: &Path) -> Option<String> {
        let dest_dir = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || read_install_manifest(&dest_dir).map(|m| m.source))
            .await
            .ok()
            .flatten()
    }
}

/// Resolves a source URL to a local directory.
fn source_dir(url: &str) -> Result<PathBuf, FetchError> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if url.contains("://") {
        return Err(FetchError::Source(format!("unsupported source URL '{url}'")));
    }
    Ok(PathBuf::from(url))
}

fn load_source_manifest(
    cache: &ManifestCache,
    url: &str,
    force_cache_bust: bool,
) -> Result<SourceManifest, FetchError> {
    if !force_cache_bust {
        if let Ok(entries) = cache.read() {
            if let Some(cached) = entries.get(url) {
                if cached.cached_at.elapsed() < Duration::from_secs(CACHE_EXPIRATION_SECS) {
                    debug!("[FETCH] Using cached manifest for {}", url);
                    return Ok(cached.manifest.clone());
                }
            }
        }
    }

    let path = source_dir(url)?.join(SOURCE_MANIFEST_FILE);
    let metadata = fs::metadata(&path)
        .map_err(|e| FetchError::Source(format!("{}: {e}", path.display())))?;
    if metadata.len() > MAX_MANIFEST_SIZE {
        return Err(FetchError::Manifest("source manifest too large".to_string()));
    }
    let text = fs::read_to_string(&path)
        .map_err(|e| FetchError::Source(format!("{}: {e}", path.display())))?;
    let manifest: SourceManifest =
        serde_json::from_str(&text).map_err(|e| FetchError::Manifest(e.to_string()))?;

    if let Ok(mut entries) = cache.write() {
        entries.insert(
            url.to_string(),
            CachedManifest {
                manifest: manifest.clone(),
                cached_at: Instant::now(),
            },
        );
    }
    Ok(manifest)
}

fn read_install_manifest(dest_dir: &Path) -> Option<InstallManifest> {
    let text = fs::read_to_string(dest_dir.join(INSTALL_MANIFEST_FILE)).ok()?;
    match serde_json::from_str(&text) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(
                "[FETCH] Ignoring unreadable install manifest in {}: {}",
                dest_dir.display(),
                e
            );
            None
        }
    }
}

fn same_source(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Compares a source manifest with what is installed in `dest_dir`.
fn plan_install(url: &str, source: &SourceManifest, dest_dir: &Path) -> Result<InstallPlan, FetchError> {
    let installed = read_install_manifest(dest_dir);
    let mut info = UpdateInfo::default();

    let full = match &installed {
        None => {
            info.is_fresh_install = true;
            true
        }
        Some(m) => !same_source(&m.source, url) || m.base_hash != source.base.hash,
    };

    let mut fetch = Vec::new();
    let mut remove = Vec::new();

    if full {
        info.base_changed = installed.is_some();
        fetch.push(source.base.clone());
        for module in &source.modules {
            let was_installed = installed
                .as_ref()
                .is_some_and(|m| m.modules.contains_key(&module.name));
            if was_installed {
                info.updated_modules.push(module.name.clone());
            } else {
                info.added_modules.push(module.name.clone());
            }
            fetch.push(module.clone());
        }
    } else if let Some(installed) = &installed {
        for module in &source.modules {
            match installed.modules.get(&module.name) {
                None => {
                    info.added_modules.push(module.name.clone());
                    fetch.push(module.clone());
                }
                Some(current) if current.hash != module.hash => {
                    info.updated_modules.push(module.name.clone());
                    fetch.push(module.clone());
                }
                Some(_) => {}
            }
        }
        for name in installed.modules.keys() {
            if !source.modules.iter().any(|m| &m.name == name) {
                info.removed_modules.push(name.clone());
                remove.push(name.clone());
            }
        }
    }

    info.needs_update = full || !fetch.is_empty() || !remove.is_empty();

    let base = source_dir(url)?;
    let mut download_size = 0u64;
    let mut unpacked_size = 0u64;
    for module in &fetch {
        let archive = join_sanitized(&base, &module.archive);
        download_size += fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        unpacked_size += archive_unpacked_size(&archive).unwrap_or(0);
    }
    let carried_over = if full || (fetch.is_empty() && remove.is_empty()) {
        0
    } else {
        dir_size(dest_dir).unwrap_or(0)
    };

    info.download_size = download_size;
    info.required_disk_space = download_size + unpacked_size + carried_over;

    Ok(InstallPlan {
        full,
        fetch,
        remove,
        info,
    })
}

fn archive_unpacked_size(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut total = 0u64;
    for i in 0..archive.len() {
        total += archive.by_index(i).ok()?.size();
    }
    Some(total)
}

fn check_abort(abort: &AbortSignal) -> Result<(), FetchError> {
    if abort.is_aborted() {
        Err(FetchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleeps for `wait`, returning early with `Cancelled` once aborted.
fn sleep_unless_aborted(abort: &AbortSignal, wait: Duration) -> Result<(), FetchError> {
    let deadline = Instant::now() + wait;
    loop {
        check_abort(abort)?;
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(());
        }
        std::thread::sleep(left.min(ABORT_POLL_INTERVAL));
    }
}

fn install_blocking(
    cache: &ManifestCache,
    request: &FetchRequest,
    retry_delay: Duration,
) -> Result<(), FetchError> {
    let events = &request.events;
    info!(
        "[FETCH] Session {} installing {} into {}",
        request.session,
        request.url,
        request.temp_dir.display()
    );

    events.emit(FetcherEventKind::PhaseChange {
        phase: FetchPhase::CheckingUpdate,
        module_index: None,
    });
    let source = load_source_manifest(cache, &request.url, true)?;
    let plan = plan_install(&request.url, &source, &request.dest_dir)?;
    check_abort(&request.abort)?;

    fs::create_dir_all(&request.temp_dir)?;
    if !plan.full && request.dest_dir.is_dir() {
        debug!("[FETCH] Carrying over current install for delta update");
        copy_dir_recursive(&request.dest_dir, &request.temp_dir)?;
        let installed = read_install_manifest(&request.dest_dir);
        let stale = plan
            .remove
            .iter()
            .chain(plan.fetch.iter().map(|m| &m.name))
            .filter_map(|name| installed.as_ref()?.modules.get(name))
            .map(|m| m.directory.clone())
            .filter(|dir| !dir.is_empty());
        for dir in stale {
            remove_path(&join_sanitized(&request.temp_dir, &dir))?;
        }
    }

    let source_root = source_dir(&request.url)?;
    let staging = request.temp_dir.join(STAGING_DIR);
    fs::create_dir_all(&staging)?;

    for (index, module) in plan.fetch.iter().enumerate() {
        check_abort(&request.abort)?;
        let module_index = u32::try_from(index).unwrap_or(u32::MAX);
        events.emit(FetcherEventKind::PhaseChange {
            phase: FetchPhase::DownloadingModule,
            module_index: Some(module_index),
        });

        let archive = download_with_retry(
            &join_sanitized(&source_root, &module.archive),
            &staging,
            module,
            request,
            retry_delay,
        )?;

        events.emit(FetcherEventKind::PhaseChange {
            phase: FetchPhase::InstallingModule,
            module_index: Some(module_index),
        });
        let target = join_sanitized(&request.temp_dir, &module.directory);
        extract_module(&archive, &target, module, &request.abort, events)?;
        remove_path(&archive)?;
    }

    check_abort(&request.abort)?;
    events.emit(FetcherEventKind::PhaseChange {
        phase: FetchPhase::InstallFinish,
        module_index: None,
    });
    events.emit(FetcherEventKind::CopyStarted {
        module: "full".to_string(),
    });
    remove_path(&staging)?;

    let manifest = InstallManifest {
        source: request.url.clone(),
        base_hash: source.base.hash.clone(),
        modules: source
            .modules
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    InstalledModule {
                        hash: m.hash.clone(),
                        directory: m.directory.clone(),
                    },
                )
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| FetchError::Manifest(e.to_string()))?;
    fs::write(request.temp_dir.join(INSTALL_MANIFEST_FILE), json)?;

    info!("[FETCH] Session {} finished", request.session);
    Ok(())
}

fn download_with_retry(
    archive: &Path,
    staging: &Path,
    module: &ModuleEntry,
    request: &FetchRequest,
    retry_delay: Duration,
) -> Result<PathBuf, FetchError> {
    let events = &request.events;
    let mut retry_count = 0u32;

    loop {
        events.emit(FetcherEventKind::DownloadStarted {
            module: module.name.clone(),
        });

        match download_archive(archive, staging, module, &request.abort, events) {
            Ok(path) => return Ok(path),
            Err(FetchError::Io(e)) if retry_count < MAX_RETRIES && is_transient(&e) => {
                retry_count += 1;
                let wait = retry_delay * 2u32.pow(retry_count - 1);
                warn!(
                    "[FETCH] Download of '{}' interrupted ({}), retry {} in {:?}",
                    module.name, e, retry_count, wait
                );
                events.emit(FetcherEventKind::DownloadInterrupted);
                events.emit(FetcherEventKind::RetryScheduled {
                    module: module.name.clone(),
                    retry_count,
                    wait_seconds: wait.as_secs(),
                });
                sleep_unless_aborted(&request.abort, wait)?;
                events.emit(FetcherEventKind::RetryStarted {
                    module: module.name.clone(),
                    retry_count,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Copies an archive into staging, hashing it on the way.
fn download_archive(
    archive: &Path,
    staging: &Path,
    module: &ModuleEntry,
    abort: &AbortSignal,
    events: &EventEmitter,
) -> Result<PathBuf, FetchError> {
    let mut input = File::open(archive)
        .map_err(|e| FetchError::Source(format!("{}: {e}", archive.display())))?;
    let total = input.metadata()?.len();
    let target = staging.join(format!("{}.zip", module.name));
    let mut output = File::create(&target).map_err(map_write_error)?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    let mut last_percent = None;

    loop {
        check_abort(abort)?;
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        output.write_all(&buffer[..n]).map_err(map_write_error)?;
        copied += n as u64;

        let percent = if total == 0 {
            100
        } else {
            u8::try_from(copied * 100 / total).unwrap_or(100)
        };
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            events.emit(FetcherEventKind::DownloadProgress {
                module: module.name.clone(),
                percent,
                part_percent: None,
                part_index: None,
                part_count: None,
            });
        }
    }
    output.flush().map_err(map_write_error)?;

    let digest = format!("{:x}", hasher.finalize());
    if !digest.eq_ignore_ascii_case(&module.hash) {
        return Err(FetchError::Corrupt(format!(
            "hash mismatch for module '{}': expected {}, got {}",
            module.name, module.hash, digest
        )));
    }
    Ok(target)
}

fn map_write_error(error: io::Error) -> FetchError {
    if error.kind() == io::ErrorKind::StorageFull {
        FetchError::NoSpace
    } else {
        FetchError::Io(error)
    }
}

fn extract_module(
    archive: &Path,
    target: &Path,
    module: &ModuleEntry,
    abort: &AbortSignal,
    events: &EventEmitter,
) -> Result<(), FetchError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| FetchError::Corrupt(format!("module '{}': {e}", module.name)))?;

    events.emit(FetcherEventKind::UnzipStarted {
        module: module.name.clone(),
    });
    fs::create_dir_all(target)?;

    let entry_count = u32::try_from(zip.len()).unwrap_or(u32::MAX);
    for i in 0..zip.len() {
        check_abort(abort)?;
        let mut entry = zip
            .by_index(i)
            .map_err(|e| FetchError::Corrupt(format!("module '{}': {e}", module.name)))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!("[FETCH] Skipping unsafe archive entry '{}'", entry.name());
            continue;
        };
        events.emit(FetcherEventKind::UnzipProgress {
            entry_index: u32::try_from(i).unwrap_or(u32::MAX),
            entry_count,
            entry_name: entry.name().to_string(),
        });

        let outpath = target.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath).map_err(map_write_error)?;
            io::copy(&mut entry, &mut outfile).map_err(map_write_error)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(name: &str, hash: &str, directory: &str) -> ModuleEntry {
        ModuleEntry {
            name: name.to_string(),
            archive: format!("{name}.zip"),
            hash: hash.to_string(),
            directory: directory.to_string(),
        }
    }

    fn write_install_manifest(dir: &Path, source: &str, base: &str, modules: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        let manifest = InstallManifest {
            source: source.to_string(),
            base_hash: base.to_string(),
            modules: modules
                .iter()
                .map(|(n, h)| {
                    (
                        n.to_string(),
                        InstalledModule {
                            hash: h.to_string(),
                            directory: n.to_string(),
                        },
                    )
                })
                .collect(),
        };
        fs::write(
            dir.join(INSTALL_MANIFEST_FILE),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_source_dir() {
        assert_eq!(source_dir("file:///srv/pkg").unwrap(), PathBuf::from("/srv/pkg"));
        assert_eq!(source_dir("/srv/pkg").unwrap(), PathBuf::from("/srv/pkg"));
        assert!(source_dir("https://cdn.example.com/pkg").is_err());
    }

    #[test]
    fn test_plan_fresh_install() {
        let tmp = tempfile::tempdir().unwrap();
        let source = SourceManifest {
            base: entry("base", "b1", ""),
            modules: vec![entry("models", "m1", "models")],
        };
        let plan = plan_install("/srv/pkg", &source, &tmp.path().join("missing")).unwrap();
        assert!(plan.full);
        assert!(plan.info.is_fresh_install);
        assert!(plan.info.needs_update);
        assert_eq!(plan.info.added_modules, vec!["models".to_string()]);
        assert_eq!(plan.fetch.len(), 2);
    }

    #[test]
    fn test_plan_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        write_install_manifest(tmp.path(), "/srv/pkg", "b1", &[("models", "m1")]);
        let source = SourceManifest {
            base: entry("base", "b1", ""),
            modules: vec![entry("models", "m1", "models")],
        };
        let plan = plan_install("/srv/pkg/", &source, tmp.path()).unwrap();
        assert!(!plan.full);
        assert!(!plan.info.needs_update);
        assert!(plan.fetch.is_empty());
    }

    #[test]
    fn test_plan_delta() {
        let tmp = tempfile::tempdir().unwrap();
        write_install_manifest(
            tmp.path(),
            "/srv/pkg",
            "b1",
            &[("models", "m1"), ("legacy", "l1")],
        );
        let source = SourceManifest {
            base: entry("base", "b1", ""),
            modules: vec![entry("models", "m2", "models"), entry("sounds", "s1", "sounds")],
        };
        let plan = plan_install("/srv/pkg", &source, tmp.path()).unwrap();
        assert!(!plan.full);
        assert!(plan.info.needs_update);
        assert_eq!(plan.info.updated_modules, vec!["models".to_string()]);
        assert_eq!(plan.info.added_modules, vec!["sounds".to_string()]);
        assert_eq!(plan.info.removed_modules, vec!["legacy".to_string()]);
    }

    #[test]
    fn test_plan_other_source_is_full() {
        let tmp = tempfile::tempdir().unwrap();
        write_install_manifest(tmp.path(), "/srv/stable", "b1", &[("models", "m1")]);
        let source = SourceManifest {
            base: entry("base", "b1", ""),
            modules: vec![entry("models", "m1", "models")],
        };
        let plan = plan_install("/srv/dev", &source, tmp.path()).unwrap();
        assert!(plan.full);
        assert!(!plan.info.is_fresh_install);
        assert!(plan.info.base_changed);
        assert_eq!(plan.info.updated_modules, vec!["models".to_string()]);
    }

    #[test]
    fn test_backoff_sleep_stops_on_abort() {
        let abort = AbortSignal::new();
        let trip = abort.clone();
        let tripper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trip.abort();
        });

        let started = Instant::now();
        let result = sleep_unless_aborted(&abort, Duration::from_secs(10));
        tripper.join().unwrap();

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_sleep_completes() {
        let abort = AbortSignal::new();
        assert!(sleep_unless_aborted(&abort, Duration::from_millis(10)).is_ok());
    }
}
