//! Moves a finished install into place.
//!
//! The new tree is first moved next to the destination, the old install is
//! renamed to a backup, and the staged tree is renamed onto the destination.
//! Any failure before the last rename leaves the destination untouched; a
//! failure of the last rename restores the backup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fsutil::{copy_dir_recursive, path_exists, remove_path};

/// Returns a unique hidden sibling of `dest`.
fn sibling(dest: &Path, suffix: &str) -> io::Result<PathBuf> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "install path has no parent"))?;
    let name = dest
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "install path has no name"))?
        .to_string_lossy();

    loop {
        let id = Uuid::new_v4().simple().to_string();
        let candidate = parent.join(format!(".{}.{}-{}", name, suffix, &id[..8]));
        if !path_exists(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Moves `from` to `to`, copying when a rename is not possible
/// (different volumes).
fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    debug!("[SWAP] Rename failed, copying {} -> {}", from.display(), to.display());
    if let Err(e) = copy_dir_recursive(from, to) {
        let _ = remove_path(to);
        return Err(e);
    }
    remove_path(from)
}

/// Replaces `dest` with the tree built in `temp`.
pub(super) fn swap_into_place(temp: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = sibling(dest, "staging")?;
    move_dir(temp, &staging)?;

    let backup = if path_exists(dest) {
        let backup = sibling(dest, "backup")?;
        if let Err(e) = fs::rename(dest, &backup) {
            let _ = remove_path(&staging);
            return Err(e);
        }
        Some(backup)
    } else {
        None
    };

    if let Err(e) = fs::rename(&staging, dest) {
        warn!("[SWAP] Could not move new install into {}: {}", dest.display(), e);
        if let Some(backup) = &backup {
            if let Err(restore) = fs::rename(backup, dest) {
                warn!("[SWAP] Could not restore {}: {}", dest.display(), restore);
            }
        }
        let _ = remove_path(&staging);
        return Err(e);
    }

    if let Some(backup) = backup {
        if let Err(e) = remove_path(&backup) {
            warn!("[SWAP] Could not delete backup {}: {}", backup.display(), e);
        }
    }

    info!("[SWAP] Installed into {}", dest.display());
    Ok(())
}
