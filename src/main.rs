//! Hangar - Main entry point.
//!
//! Usage: hangar [OPTIONS] <COMMAND> [ARGS]
//!
//! Commands:
//!   list                          List addons and their status
//!   status <publisher/addon>      Show the status of an addon
//!   install <publisher/addon>     Install or update an addon
//!   uninstall <publisher/addon>   Remove an addon
//!
//! Options:
//!   --track <KEY>      Track to install (install only)
//!   --yes, -y          Answer yes to every prompt
//!   --verbose          Log to stderr
//!   --config <PATH>    Use another config file
//!   --version, -v      Show version

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use hangar::apps::SystemAppStatus;
use hangar::catalog::Catalog;
use hangar::config::{Config, expand_path};
use hangar::disk::SystemFreeSpace;
use hangar::fetcher::{EventBus, LocalFetcher};
use hangar::installer::{InstallResult, Orchestrator, OrchestratorDeps, UninstallResult};
use hangar::logging::{self, LogTarget};
use hangar::prompt::ConsolePrompter;
use hangar::reporting::TracingReporter;
use hangar::service::SettingsAutostart;
use hangar::settings::{FileSettings, Settings};
use hangar::state::{AddonId, InstallState, InstallStateStore, StoreEvent};

/// Package version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "Usage: hangar [--yes] [--verbose] [--config PATH] \
                     <list | status ADDON | install ADDON [--track KEY] | uninstall ADDON>";

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    target: Option<String>,
    track: Option<String>,
    assume_yes: bool,
    verbose: bool,
    config: Option<PathBuf>,
    version: bool,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-v" => parsed.version = true,
            "--yes" | "-y" => parsed.assume_yes = true,
            "--verbose" => parsed.verbose = true,
            "--track" => {
                parsed.track = Some(iter.next().ok_or("--track needs a value")?.clone());
            }
            "--config" => {
                let path = iter.next().ok_or("--config needs a value")?;
                parsed.config = Some(expand_path(path));
            }
            flag if flag.starts_with('-') => return Err(format!("Unknown option: {}", flag)),
            value if parsed.command.is_none() => parsed.command = Some(value.to_string()),
            value if parsed.target.is_none() => parsed.target = Some(value.to_string()),
            value => return Err(format!("Unexpected argument: {}", value)),
        }
    }

    Ok(parsed)
}

fn describe(state: &InstallState) -> String {
    match state {
        InstallState::Decompressing { percent, .. } => {
            format!("{} {}%", state.status(), percent)
        }
        InstallState::InstallingDependency { dependency }
        | InstallState::InstallingDependencyEnding { dependency } => {
            format!("{} {}", state.status(), dependency)
        }
        InstallState::DownloadRetry {
            retry_count,
            wait_seconds,
        } => format!("{} (attempt {}, in {}s)", state.status(), retry_count, wait_seconds),
        InstallState::DownloadError { message } => format!("{}: {}", state.status(), message),
        _ => state.status().to_string(),
    }
}

/// Prints store changes until the channel closes.
fn spawn_observer(store: &InstallStateStore) -> tokio::task::JoinHandle<()> {
    let mut events = store.subscribe();
    tokio::spawn(async move {
        let mut last_percent = None;
        loop {
            match events.recv().await {
                Ok(StoreEvent::InstallState { id, state }) => {
                    eprintln!("[{}] {}", id, describe(&state));
                }
                Ok(StoreEvent::DownloadItem {
                    id,
                    item: Some(item),
                }) => {
                    let percent = item.progress.total_percent;
                    if last_percent != Some(percent) && percent % 10 == 0 {
                        last_percent = Some(percent);
                        eprintln!(
                            "[{}] {} {}/{} {}%",
                            id,
                            item.module,
                            item.module_index + 1,
                            item.module_count.max(1),
                            percent
                        );
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn build(config: &Config) -> Result<Orchestrator, String> {
    let catalog = Catalog::load_merged(&config.catalog, config.catalog_override.as_deref())
        .map_err(|e| format!("Cannot load catalog {}: {}", config.catalog.display(), e))?;

    let settings: Arc<dyn Settings> = Arc::new(FileSettings::open(Config::settings_path()));
    Ok(Orchestrator::new(OrchestratorDeps {
        catalog: Arc::new(catalog),
        resolver: config.resolver(),
        store: Arc::new(InstallStateStore::new()),
        fetcher: Arc::new(LocalFetcher::new()),
        events: EventBus::new(),
        prompter: Arc::new(ConsolePrompter::new(config.assume_yes)),
        apps: Arc::new(SystemAppStatus::new()),
        settings: settings.clone(),
        services: Arc::new(SettingsAutostart::new(settings)),
        reporter: Arc::new(TracingReporter),
        free_space: Arc::new(SystemFreeSpace),
    }))
}

fn target(args: &Args) -> Result<AddonId, String> {
    let text = args.target.as_deref().ok_or(USAGE)?;
    AddonId::parse(text).ok_or_else(|| format!("Expected publisher/addon, got '{}'", text))
}

async fn run(args: Args, orchestrator: Orchestrator) -> Result<ExitCode, String> {
    let command = args.command.as_deref().unwrap_or("list");

    match command {
        "list" => {
            orchestrator.initialize().await;
            for (publisher, addon) in orchestrator.catalog().addons() {
                let id = AddonId::new(&publisher.key, &addon.key);
                let state = orchestrator.install_state(&id.publisher, &id.addon).await;
                let track = orchestrator.store().selected_track(&id).unwrap_or_default();
                println!("{:<32} {:<12} {}", id, track, describe(&state));
            }
            Ok(ExitCode::SUCCESS)
        }
        "status" => {
            let id = target(&args)?;
            let status = orchestrator.refresh_status(&id.publisher, &id.addon).await;
            println!("{}: {}", id, status);
            Ok(ExitCode::SUCCESS)
        }
        "install" => {
            let id = target(&args)?;
            if let Some(track) = &args.track {
                orchestrator
                    .select_track(&id.publisher, &id.addon, track)
                    .await
                    .map_err(|e| e.to_string())?;
            }

            let observer = spawn_observer(orchestrator.store());
            let install = orchestrator.install(&id.publisher, &id.addon);
            tokio::pin!(install);
            let result = loop {
                tokio::select! {
                    result = &mut install => break result,
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("Cancelling {}...", id);
                        if let Err(e) = orchestrator.cancel(&id.publisher, &id.addon) {
                            eprintln!("{}", e);
                        }
                    }
                }
            };
            observer.abort();

            match result {
                InstallResult::Success => {
                    println!("{} installed", id);
                    Ok(ExitCode::SUCCESS)
                }
                InstallResult::Cancelled => {
                    println!("{} not installed", id);
                    Ok(ExitCode::from(2))
                }
                InstallResult::Failure(e) => Err(format!("{} failed: {}", id, e)),
            }
        }
        "uninstall" => {
            let id = target(&args)?;
            match orchestrator
                .uninstall(&id.publisher, &id.addon)
                .await
                .map_err(|e| e.to_string())?
            {
                UninstallResult::Removed => println!("{} removed", id),
                UninstallResult::Cancelled => println!("{} kept", id),
            }
            Ok(ExitCode::SUCCESS)
        }
        other => Err(format!("Unknown command: {}\n{}", other, USAGE)),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::FAILURE;
        }
    };

    if args.version {
        println!("hangar v{}", VERSION);
        return ExitCode::SUCCESS;
    }

    let loaded = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.assume_yes |= args.assume_yes;
    if args.verbose {
        config.log_config.target = LogTarget::Stderr;
    }

    if let Err(e) = logging::init(&config.log_config) {
        eprintln!("Warning: logging disabled: {}", e);
    }

    let orchestrator = match build(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args, orchestrator)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
