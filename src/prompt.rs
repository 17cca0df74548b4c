//! Confirmation prompts.
//!
//! The orchestrator describes what it needs confirmed with a `Prompt`; how
//! the question is presented is up to the `Prompter` implementation.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use tracing::debug;

/// A question or notice for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Apps that must be closed are running.
    RunningApps {
        /// Addon being installed or removed.
        addon: String,
        /// Names of the running apps.
        apps: Vec<String>,
    },
    /// Install an optional dependency?
    OptionalDependency {
        /// Addon that declares the dependency.
        addon: String,
        /// Dependency display name.
        dependency: String,
        /// Publisher-provided explanation.
        text: Option<String>,
    },
    /// Conflicting third-party packages were found.
    IncompatibleAddons {
        /// Addon being installed.
        addon: String,
        /// Conflicting package folders with their explanation.
        found: Vec<(String, String)>,
    },
    /// Not enough free space.
    DiskSpace {
        /// Addon being installed.
        addon: String,
        /// Bytes needed.
        required: u64,
        /// Free bytes at the install destination.
        free_in_destination: Option<u64>,
        /// Free bytes at the temp root.
        free_in_temp: Option<u64>,
    },
    /// Remove an addon?
    Uninstall {
        /// Addon being removed.
        addon: String,
    },
    /// Enable autostart of a background service?
    EnableAutostart {
        /// Addon owning the service.
        addon: String,
    },
    /// An install failed.
    InstallFailed {
        /// Addon that failed.
        addon: String,
        /// Error message.
        message: String,
    },
}

impl Prompt {
    /// Returns the text shown for this prompt.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::RunningApps { addon, apps } => format!(
                "{} cannot be changed while these are running: {}. Continue anyway?",
                addon,
                apps.join(", ")
            ),
            Self::OptionalDependency {
                addon,
                dependency,
                text,
            } => {
                let mut msg = format!("{} can use {}. Install it as well?", addon, dependency);
                if let Some(text) = text {
                    msg.push('\n');
                    msg.push_str(text);
                }
                msg
            }
            Self::IncompatibleAddons { addon, found } => {
                let list = found
                    .iter()
                    .map(|(folder, why)| {
                        if why.is_empty() {
                            format!("  - {}", folder)
                        } else {
                            format!("  - {}: {}", folder, why)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Packages incompatible with {} were found:\n{}\nContinue anyway?",
                    addon, list
                )
            }
            Self::DiskSpace {
                addon,
                required,
                free_in_destination,
                free_in_temp,
            } => format!(
                "Installing {} needs {} but only {} (destination) / {} (temp) are free. Continue anyway?",
                addon,
                format_bytes(*required),
                free_in_destination.map_or_else(|| "?".to_string(), format_bytes),
                free_in_temp.map_or_else(|| "?".to_string(), format_bytes),
            ),
            Self::Uninstall { addon } => format!("Remove {}?", addon),
            Self::EnableAutostart { addon } => {
                format!("Start the {} background service automatically at login?", addon)
            }
            Self::InstallFailed { addon, message } => {
                format!("Installing {} failed: {}", addon, message)
            }
        }
    }

    /// Returns true if declining must not be remembered.
    #[must_use]
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::DiskSpace { .. } | Self::RunningApps { .. })
    }
}

/// Formats a byte count with binary units.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Answer to a prompt that offers "don't ask again".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Proceed.
    Yes,
    /// Decline this time.
    No,
    /// Decline and stop asking.
    Never,
}

/// Presents prompts to the user.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Asks for confirmation. Returns true to proceed.
    async fn confirm(&self, prompt: &Prompt) -> bool;

    /// Asks a question the user may silence for good.
    async fn ask(&self, prompt: &Prompt) -> Answer {
        if self.confirm(prompt).await {
            Answer::Yes
        } else {
            Answer::No
        }
    }

    /// Shows a notice that needs no answer.
    async fn notify(&self, prompt: &Prompt);
}

/// Prompter that asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompter {
    assume_yes: bool,
}

impl ConsolePrompter {
    /// Creates a console prompter. With `assume_yes` every prompt is
    /// answered yes without asking.
    #[must_use]
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn confirm(&self, prompt: &Prompt) -> bool {
        let message = prompt.message();
        if self.assume_yes {
            debug!("[PROMPT] Auto-confirming: {}", message);
            eprintln!("{} [y/N] y", message);
            return true;
        }

        tokio::task::spawn_blocking(move || {
            eprint!("{} [y/N] ", message);
            let _ = io::stderr().flush();
            let mut answer = String::new();
            if io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }

    async fn ask(&self, prompt: &Prompt) -> Answer {
        let message = prompt.message();
        if self.assume_yes {
            eprintln!("{} [y/N/never] y", message);
            return Answer::Yes;
        }

        tokio::task::spawn_blocking(move || {
            eprint!("{} [y/N/never] ", message);
            let _ = io::stderr().flush();
            let mut answer = String::new();
            if io::stdin().lock().read_line(&mut answer).is_err() {
                return Answer::No;
            }
            parse_answer(&answer)
        })
        .await
        .unwrap_or(Answer::No)
    }

    async fn notify(&self, prompt: &Prompt) {
        eprintln!("{}", prompt.message());
    }
}

fn parse_answer(input: &str) -> Answer {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => Answer::Yes,
        "never" => Answer::Never,
        _ => Answer::No,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GiB");
    }

    #[test]
    fn test_disk_space_is_mandatory() {
        let prompt = Prompt::DiskSpace {
            addon: "A32NX".to_string(),
            required: 10,
            free_in_destination: Some(1),
            free_in_temp: None,
        };
        assert!(prompt.is_mandatory());
        assert!(prompt.message().contains("?"));
        assert!(!Prompt::Uninstall { addon: "x".into() }.is_mandatory());
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("Y\n"), Answer::Yes);
        assert_eq!(parse_answer(" never "), Answer::Never);
        assert_eq!(parse_answer(""), Answer::No);
    }

    #[test]
    fn test_optional_dependency_message() {
        let prompt = Prompt::OptionalDependency {
            addon: "A32NX".to_string(),
            dependency: "Charts".to_string(),
            text: Some("Adds charts to the EFB.".to_string()),
        };
        let msg = prompt.message();
        assert!(msg.contains("Charts"));
        assert!(msg.ends_with("Adds charts to the EFB."));
    }
}
