//! Install status determination.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::{InstallError, Orchestrator};
use crate::catalog::{Addon, AddonTrack};
use crate::fetcher::UpdateCheckOptions;
use crate::fsutil::path_exists;
use crate::state::{AddonId, InstallStatus};

/// Returns true if `dir` is a symlink into a git checkout.
fn is_git_checkout_link(dir: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(dir) else {
        return false;
    };
    if !metadata.file_type().is_symlink() {
        return false;
    }
    let Ok(target) = fs::canonicalize(dir) else {
        return false;
    };
    target.ancestors().any(|p| p.join(".git").exists())
}

impl Orchestrator {
    /// Returns the selected track of an addon, falling back to the
    /// installed track and then to the first track.
    pub(super) fn selected_track_of<'a>(
        &self,
        id: &AddonId,
        addon: &'a Addon,
    ) -> Result<&'a AddonTrack, InstallError> {
        let store = &self.inner.store;
        if let Some(key) = store.selected_track(id) {
            return addon.track(&key).ok_or_else(|| InstallError::UnknownTrack {
                addon: id.to_string(),
                track: key,
            });
        }
        store
            .installed_track(id)
            .and_then(|key| addon.track(&key))
            .or_else(|| addon.default_track())
            .ok_or_else(|| InstallError::NoTrack(id.to_string()))
    }

    /// Determines the install status of an addon from disk and the fetcher.
    ///
    /// Also refreshes the addon's installed track from its install
    /// manifest. Never fails: errors are logged and yield `Unknown`.
    pub async fn determine_addon_install_status(
        &self,
        publisher: &str,
        addon: &str,
    ) -> InstallStatus {
        let id = AddonId::new(publisher, addon);
        let Some((_, entry)) = self.inner.catalog.find_addon(publisher, addon) else {
            warn!("[STATUS] Unknown addon {}", id);
            return InstallStatus::Unknown;
        };

        if entry.hidden {
            return InstallStatus::Hidden;
        }

        match self.check_status(&id, entry).await {
            Ok(status) => {
                debug!("[STATUS] {} is {}", id, status);
                status
            }
            Err(e) => {
                warn!("[STATUS] Could not determine status of {}: {}", id, e);
                InstallStatus::Unknown
            }
        }
    }

    async fn check_status(&self, id: &AddonId, addon: &Addon) -> Result<InstallStatus, InstallError> {
        let store = &self.inner.store;
        let install_dir = self.inner.resolver.install_dir(addon);

        if !path_exists(&install_dir) {
            store.clear_installed_track(id);
            return Ok(InstallStatus::NotInstalled);
        }

        let dir = install_dir.clone();
        let git = tokio::task::spawn_blocking(move || is_git_checkout_link(&dir))
            .await
            .map_err(std::io::Error::other)?;
        if git {
            return Ok(InstallStatus::GitInstall);
        }

        let installed = self
            .inner
            .fetcher
            .installed_source(&install_dir)
            .await
            .and_then(|source| addon.track_for_source(&source))
            .map(|t| t.key.clone());
        match &installed {
            Some(track) => store.set_installed_track(id, track),
            None => store.clear_installed_track(id),
        }

        let selected = self.selected_track_of(id, addon)?;
        let info = self
            .inner
            .fetcher
            .needs_update(
                &selected.url,
                &install_dir,
                UpdateCheckOptions {
                    force_cache_bust: true,
                },
            )
            .await?;

        if installed.as_deref().is_some_and(|key| key != selected.key) {
            return Ok(InstallStatus::TrackSwitch);
        }

        Ok(if info.is_fresh_install {
            InstallStatus::NotInstalled
        } else if info.needs_update {
            InstallStatus::NeedsUpdate
        } else {
            InstallStatus::UpToDate
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_dir_is_not_git_link() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        assert!(!is_git_checkout_link(tmp.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_into_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(repo.join("build").join("package")).unwrap();

        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(repo.join("build").join("package"), &link).unwrap();
        assert!(is_git_checkout_link(&link));

        let elsewhere = tmp.path().join("plain");
        std::fs::create_dir_all(&elsewhere).unwrap();
        let link2 = tmp.path().join("link2");
        std::os::unix::fs::symlink(&elsewhere, &link2).unwrap();
        assert!(!is_git_checkout_link(&link2));
    }
}
