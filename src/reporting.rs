//! Error reporting.

use tracing::error;

use crate::installer::InstallError;

/// Receives install failures for out-of-band reporting.
///
/// Reporting is fire-and-forget and never changes the outcome of an install.
pub trait ErrorReporter: Send + Sync {
    /// Records a failure.
    fn capture(&self, addon: &str, error: &InstallError);
}

/// Reporter that writes failures to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, addon: &str, error: &InstallError) {
        error!("[REPORT] Install of {} failed: {}", addon, error);
    }
}
