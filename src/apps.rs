//! External app status.
//!
//! Reports whether an external application (a simulator, a helper service)
//! is currently running.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::catalog::{ExternalApp, ExternalAppKind};

/// Timeout for TCP port probes.
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Reports the running state of external apps.
#[async_trait]
pub trait AppStatus: Send + Sync {
    /// Returns true if the app is running.
    async fn is_open(&self, app: &ExternalApp) -> bool;
}

/// Checks processes and localhost ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAppStatus;

impl SystemAppStatus {
    /// Creates a new checker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn process_running(name: &str) -> bool {
        #[cfg(windows)]
        let output = Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {}", name), "/NH"])
            .output()
            .await;

        #[cfg(not(windows))]
        let output = Command::new("pgrep").args(["-x", name]).output().await;

        match output {
            #[cfg(windows)]
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .to_lowercase()
                .contains(&name.to_lowercase()),
            #[cfg(not(windows))]
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("[APPS] Could not query processes for '{}': {}", name, e);
                false
            }
        }
    }

    async fn port_open(port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        matches!(
            tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl AppStatus for SystemAppStatus {
    async fn is_open(&self, app: &ExternalApp) -> bool {
        let open = match &app.kind {
            ExternalAppKind::Executable { name } => Self::process_running(name).await,
            ExternalAppKind::Tcp { port } => Self::port_open(*port).await,
        };
        debug!("[APPS] '{}' open: {}", app.key, open);
        open
    }
}
