//! Free disk space queries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Reports free space on the volume holding a path.
#[async_trait]
pub trait FreeSpace: Send + Sync {
    /// Returns free bytes, or `None` when it cannot be determined.
    async fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// Queries the operating system's disk tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFreeSpace;

/// Returns `path` or its closest existing ancestor.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

/// Parses the output of `df -Pk`, returning available bytes.
#[cfg_attr(windows, allow(dead_code))]
fn parse_df_output(output: &str) -> Option<u64> {
    // Header line, then one line per filesystem; the fourth column is
    // available 1024-byte blocks.
    let line = output.lines().nth(1)?;
    let available = line.split_whitespace().nth(3)?;
    available.parse::<u64>().ok().map(|kb| kb.saturating_mul(1024))
}

#[async_trait]
impl FreeSpace for SystemFreeSpace {
    async fn free_bytes(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;

        #[cfg(windows)]
        let output = {
            let drive = target
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().trim_end_matches(':').to_string())?;
            Command::new("powershell")
                .args([
                    "-NoProfile",
                    "-Command",
                    &format!("(Get-PSDrive -Name '{}').Free", drive),
                ])
                .output()
                .await
        };

        #[cfg(not(windows))]
        let output = Command::new("df").arg("-Pk").arg(&target).output().await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                warn!("[DISK] Free space query exited with {}", o.status);
                return None;
            }
            Err(e) => {
                warn!("[DISK] Free space query failed: {}", e);
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);

        #[cfg(windows)]
        let free = stdout.trim().parse::<u64>().ok();
        #[cfg(not(windows))]
        let free = parse_df_output(&stdout);

        debug!("[DISK] Free at {}: {:?}", target.display(), free);
        free
    }
}
