//! Install state store.
//!
//! Holds the per-addon install state, download items and track pointers.
//! Only the orchestrator writes; any number of readers may query. Values
//! are replaced wholesale, so a reader never sees a half-written entry.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{AddonId, DownloadItem, InstallState};

/// Capacity of the change notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change notification sent to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Install state replaced.
    InstallState {
        /// Addon.
        id: AddonId,
        /// New state.
        state: InstallState,
    },
    /// Download item created, updated (`Some`) or removed (`None`).
    DownloadItem {
        /// Addon.
        id: AddonId,
        /// New item.
        item: Option<DownloadItem>,
    },
    /// Selected track changed.
    SelectedTrack {
        /// Addon.
        id: AddonId,
        /// Track key.
        track: Option<String>,
    },
    /// Installed track changed.
    InstalledTrack {
        /// Addon.
        id: AddonId,
        /// Track key.
        track: Option<String>,
    },
}

/// Keyed state container shared between the orchestrator and observers.
#[derive(Debug)]
pub struct InstallStateStore {
    install_states: RwLock<HashMap<AddonId, InstallState>>,
    download_items: RwLock<HashMap<AddonId, DownloadItem>>,
    selected_tracks: RwLock<HashMap<AddonId, String>>,
    installed_tracks: RwLock<HashMap<AddonId, String>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for InstallStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            install_states: RwLock::new(HashMap::new()),
            download_items: RwLock::new(HashMap::new()),
            selected_tracks: RwLock::new(HashMap::new()),
            installed_tracks: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Returns the install state of an addon, if one was recorded.
    #[must_use]
    pub fn install_state(&self, id: &AddonId) -> Option<InstallState> {
        self.install_states
            .read()
            .ok()
            .and_then(|states| states.get(id).cloned())
    }

    /// Replaces the install state of an addon.
    pub fn set_install_state(&self, id: &AddonId, state: InstallState) {
        debug!("[STATE] {} -> {:?}", id, state);
        match self.install_states.write() {
            Ok(mut states) => {
                states.insert(id.clone(), state.clone());
            }
            Err(_) => {
                warn!("[STATE] Install state lock poisoned, dropping write for {}", id);
                return;
            }
        }
        self.publish(StoreEvent::InstallState {
            id: id.clone(),
            state,
        });
    }

    /// Returns the in-flight download item of an addon.
    #[must_use]
    pub fn download_item(&self, id: &AddonId) -> Option<DownloadItem> {
        self.download_items
            .read()
            .ok()
            .and_then(|items| items.get(id).cloned())
    }

    /// Inserts a download item unless one already exists.
    ///
    /// Returns false when the addon already has an in-flight install.
    pub fn try_insert_download_item(&self, id: &AddonId, item: DownloadItem) -> bool {
        let inserted = match self.download_items.write() {
            Ok(mut items) => {
                if items.contains_key(id) {
                    false
                } else {
                    items.insert(id.clone(), item.clone());
                    true
                }
            }
            Err(_) => false,
        };
        if inserted {
            self.publish(StoreEvent::DownloadItem {
                id: id.clone(),
                item: Some(item),
            });
        }
        inserted
    }

    /// Replaces the download item of an addon with an updated copy.
    ///
    /// Returns the new item, or `None` if the addon has no download item.
    pub fn update_download_item<F>(&self, id: &AddonId, update: F) -> Option<DownloadItem>
    where
        F: FnOnce(&mut DownloadItem),
    {
        let updated = {
            let mut items = self.download_items.write().ok()?;
            let mut item = items.get(id)?.clone();
            update(&mut item);
            items.insert(id.clone(), item.clone());
            item
        };
        self.publish(StoreEvent::DownloadItem {
            id: id.clone(),
            item: Some(updated.clone()),
        });
        Some(updated)
    }

    /// Removes the download item of an addon and returns it.
    pub fn remove_download_item(&self, id: &AddonId) -> Option<DownloadItem> {
        let removed = self.download_items.write().ok()?.remove(id);
        if removed.is_some() {
            self.publish(StoreEvent::DownloadItem {
                id: id.clone(),
                item: None,
            });
        }
        removed
    }

    /// Returns all in-flight download items.
    #[must_use]
    pub fn download_items(&self) -> Vec<(AddonId, DownloadItem)> {
        self.download_items
            .read()
            .map(|items| items.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Returns the selected track key of an addon.
    #[must_use]
    pub fn selected_track(&self, id: &AddonId) -> Option<String> {
        self.selected_tracks
            .read()
            .ok()
            .and_then(|tracks| tracks.get(id).cloned())
    }

    /// Sets the selected track key of an addon.
    pub fn set_selected_track(&self, id: &AddonId, track: &str) {
        if let Ok(mut tracks) = self.selected_tracks.write() {
            tracks.insert(id.clone(), track.to_string());
        }
        self.publish(StoreEvent::SelectedTrack {
            id: id.clone(),
            track: Some(track.to_string()),
        });
    }

    /// Returns the installed track key of an addon.
    #[must_use]
    pub fn installed_track(&self, id: &AddonId) -> Option<String> {
        self.installed_tracks
            .read()
            .ok()
            .and_then(|tracks| tracks.get(id).cloned())
    }

    /// Sets the installed track key of an addon.
    pub fn set_installed_track(&self, id: &AddonId, track: &str) {
        if let Ok(mut tracks) = self.installed_tracks.write() {
            tracks.insert(id.clone(), track.to_string());
        }
        self.publish(StoreEvent::InstalledTrack {
            id: id.clone(),
            track: Some(track.to_string()),
        });
    }

    /// Clears the installed track of an addon.
    pub fn clear_installed_track(&self, id: &AddonId) {
        let removed = self
            .installed_tracks
            .write()
            .ok()
            .and_then(|mut tracks| tracks.remove(id));
        if removed.is_some() {
            self.publish(StoreEvent::InstalledTrack {
                id: id.clone(),
                track: None,
            });
        }
    }
}
