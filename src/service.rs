//! Background service autostart control.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::settings::{Settings, SettingsError, autostart_key};
use crate::state::AddonId;

/// Controls whether an addon's background service starts at login.
#[async_trait]
pub trait BackgroundServiceControl: Send + Sync {
    /// Returns true if autostart is enabled for the addon's service.
    async fn is_autostart_enabled(&self, addon: &AddonId) -> bool;

    /// Enables or disables autostart for the addon's service.
    async fn set_autostart(&self, addon: &AddonId, enabled: bool) -> Result<(), SettingsError>;
}

/// Autostart flags kept in the settings store.
///
/// The platform launcher reads these flags at login.
pub struct SettingsAutostart {
    settings: Arc<dyn Settings>,
}

impl SettingsAutostart {
    /// Creates a controller over the given settings.
    #[must_use]
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BackgroundServiceControl for SettingsAutostart {
    async fn is_autostart_enabled(&self, addon: &AddonId) -> bool {
        self.settings
            .get_bool(&autostart_key(&addon.publisher, &addon.addon))
            .unwrap_or(false)
    }

    async fn set_autostart(&self, addon: &AddonId, enabled: bool) -> Result<(), SettingsError> {
        info!("[SERVICE] Autostart for {}: {}", addon, enabled);
        self.settings
            .set_bool(&autostart_key(&addon.publisher, &addon.addon), enabled)
    }
}
