//! Detection of third-party packages that conflict with an addon.
//!
//! Every directory in the install root may carry a `manifest.json` with
//! `title`, `creator` and `package_version`. A package matches an
//! incompatibility entry when every field the entry specifies matches.

use std::fs;
use std::path::Path;

use semver::{Version, VersionReq};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog::IncompatibleAddon;

/// Package manifest file name.
const PACKAGE_MANIFEST_FILE: &str = "manifest.json";

/// Maximum package manifest size (256KB).
const MAX_MANIFEST_SIZE: u64 = 256 * 1024;

/// Fields read from a package manifest.
#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    creator: Option<String>,
    #[serde(default)]
    package_version: Option<String>,
}

/// A conflicting package found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompatibleMatch {
    /// Folder name of the package.
    pub folder: String,
    /// Explanation from the catalog.
    pub description: String,
}

fn read_manifest(dir: &Path) -> Option<PackageManifest> {
    let path = dir.join(PACKAGE_MANIFEST_FILE);
    let metadata = fs::metadata(&path).ok()?;
    if metadata.len() > MAX_MANIFEST_SIZE {
        warn!("[INCOMPAT] Ignoring oversized manifest {}", path.display());
        return None;
    }
    let text = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            debug!("[INCOMPAT] Unreadable manifest {}: {}", path.display(), e);
            None
        }
    }
}

fn version_matches(range: &str, version: Option<&str>) -> bool {
    let Ok(req) = VersionReq::parse(range) else {
        warn!("[INCOMPAT] Invalid version range '{}'", range);
        return false;
    };
    version
        .and_then(|v| Version::parse(v.trim()).ok())
        .is_some_and(|v| req.matches(&v))
}

fn matches(entry: &IncompatibleAddon, folder: &str, manifest: &PackageManifest) -> bool {
    if entry.title.is_none()
        && entry.creator.is_none()
        && entry.package_version.is_none()
        && entry.folder.is_none()
    {
        return false;
    }

    if let Some(expected) = &entry.folder {
        if !expected.eq_ignore_ascii_case(folder) {
            return false;
        }
    }
    if let Some(title) = &entry.title {
        if manifest.title.as_deref() != Some(title.as_str()) {
            return false;
        }
    }
    if let Some(creator) = &entry.creator {
        if manifest.creator.as_deref() != Some(creator.as_str()) {
            return false;
        }
    }
    if let Some(range) = &entry.package_version {
        if !version_matches(range, manifest.package_version.as_deref()) {
            return false;
        }
    }
    true
}

/// Scans `root` for packages matching any of `signatures`.
///
/// The directory named `own_folder` (the addon itself) is skipped.
pub fn find_incompatible(
    root: &Path,
    own_folder: Option<&str>,
    signatures: &[IncompatibleAddon],
) -> Vec<IncompatibleMatch> {
    if signatures.is_empty() {
        return Vec::new();
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("[INCOMPAT] Cannot read {}: {}", root.display(), e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let folder = entry.file_name().to_string_lossy().into_owned();
        if own_folder == Some(folder.as_str()) {
            continue;
        }
        let manifest = read_manifest(&path).unwrap_or_default();

        if let Some(signature) = signatures.iter().find(|s| matches(s, &folder, &manifest)) {
            debug!("[INCOMPAT] '{}' matches an incompatibility entry", folder);
            found.push(IncompatibleMatch {
                folder,
                description: signature.description.clone(),
            });
        }
    }

    found.sort_by(|a, b| a.folder.cmp(&b.folder));
    found
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn package(root: &Path, folder: &str, manifest: &str) {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PACKAGE_MANIFEST_FILE), manifest).unwrap();
    }

    fn signature(title: &str, creator: &str, range: Option<&str>) -> IncompatibleAddon {
        IncompatibleAddon {
            title: Some(title.to_string()),
            creator: Some(creator.to_string()),
            package_version: range.map(String::from),
            folder: None,
            description: "Replaces the same sound files".to_string(),
        }
    }

    #[test]
    fn test_matches_title_creator_and_range() {
        let tmp = tempfile::tempdir().unwrap();
        package(
            tmp.path(),
            "old-sound-pack",
            r#"{"title":"Sound Pack","creator":"Someone","package_version":"1.4.0"}"#,
        );
        package(
            tmp.path(),
            "new-sound-pack",
            r#"{"title":"Sound Pack","creator":"Someone","package_version":"2.0.0"}"#,
        );

        let found = find_incompatible(
            tmp.path(),
            None,
            &[signature("Sound Pack", "Someone", Some("<2.0.0"))],
        );
        assert_eq!(
            found,
            vec![IncompatibleMatch {
                folder: "old-sound-pack".to_string(),
                description: "Replaces the same sound files".to_string(),
            }]
        );
    }

    #[test]
    fn test_skips_own_folder_and_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        package(tmp.path(), "mine", r#"{"title":"Sound Pack","creator":"Someone"}"#);

        let sigs = [signature("Sound Pack", "Someone", None)];
        assert!(find_incompatible(tmp.path(), Some("mine"), &sigs).is_empty());
        assert!(find_incompatible(&tmp.path().join("missing"), None, &sigs).is_empty());
    }

    #[test]
    fn test_folder_only_signature() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("Legacy-Mod")).unwrap();

        let sig = IncompatibleAddon {
            title: None,
            creator: None,
            package_version: None,
            folder: Some("legacy-mod".to_string()),
            description: String::new(),
        };
        assert_eq!(find_incompatible(tmp.path(), None, &[sig]).len(), 1);
    }

    #[test]
    fn test_empty_signature_never_matches() {
        let sig = IncompatibleAddon {
            title: None,
            creator: None,
            package_version: None,
            folder: None,
            description: String::new(),
        };
        assert!(!matches(&sig, "anything", &PackageManifest::default()));
    }
}
