//! Directory resolution for addons.
//!
//! Maps an addon and a location kind to an absolute path. Addon-controlled
//! path segments are sanitised so a resolved path never leaves its root.

use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::catalog::Addon;

/// Maximum attempts at finding an unused temp directory name.
const MAX_TEMP_ATTEMPTS: usize = 64;

/// Named location an addon path can be resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Where addons are installed.
    InstallRoot,
    /// Scratch space for in-flight installs.
    TempRoot,
    /// Downloaded package artifacts.
    PackageCache,
    /// Per-addon user documents.
    Documents,
}

/// Resolves addon paths against configured roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryResolver {
    install_root: PathBuf,
    temp_root: PathBuf,
    package_cache_root: PathBuf,
    documents_root: PathBuf,
}

impl DirectoryResolver {
    /// Creates a resolver over the given roots.
    #[must_use]
    pub fn new(
        install_root: PathBuf,
        temp_root: PathBuf,
        package_cache_root: PathBuf,
        documents_root: PathBuf,
    ) -> Self {
        Self {
            install_root,
            temp_root,
            package_cache_root,
            documents_root,
        }
    }

    /// Returns the root directory of a location.
    #[must_use]
    pub fn root(&self, location: Location) -> &Path {
        match location {
            Location::InstallRoot => &self.install_root,
            Location::TempRoot => &self.temp_root,
            Location::PackageCache => &self.package_cache_root,
            Location::Documents => &self.documents_root,
        }
    }

    /// Resolves the addon's directory inside `location`.
    #[must_use]
    pub fn resolve(&self, addon: &Addon, location: Location) -> PathBuf {
        match location {
            Location::InstallRoot => join_sanitized(&self.install_root, &addon.target_directory),
            Location::TempRoot => join_sanitized(&self.temp_root, &addon.key),
            Location::PackageCache => join_sanitized(&self.package_cache_root, &addon.key),
            Location::Documents => join_sanitized(&self.documents_root, &addon.target_directory),
        }
    }

    /// Returns the install directory of an addon.
    #[must_use]
    pub fn install_dir(&self, addon: &Addon) -> PathBuf {
        self.resolve(addon, Location::InstallRoot)
    }

    /// Returns the package cache directory of an addon.
    #[must_use]
    pub fn package_cache_dir(&self, addon: &Addon) -> PathBuf {
        self.resolve(addon, Location::PackageCache)
    }

    /// Returns the documents directory of an addon.
    #[must_use]
    pub fn documents_dir(&self, addon: &Addon) -> PathBuf {
        self.resolve(addon, Location::Documents)
    }

    /// Returns the install directories of the addon's legacy names.
    ///
    /// Names that sanitise to the root itself, or to a directory that
    /// contains or lies inside the current install directory, are skipped.
    #[must_use]
    pub fn alternative_install_dirs(&self, addon: &Addon) -> Vec<PathBuf> {
        let current = self.install_dir(addon);
        addon
            .alternative_names
            .iter()
            .map(|name| join_sanitized(&self.install_root, name))
            .filter(|p| {
                p != &self.install_root && !current.starts_with(p) && !p.starts_with(&current)
            })
            .collect()
    }

    /// Returns a temp directory path that does not exist yet.
    ///
    /// Concurrent installs each get their own directory. The directory is
    /// not created.
    pub fn temp(&self, addon: &Addon) -> std::io::Result<PathBuf> {
        let base = sanitize_relative(&addon.key);
        let base = base.to_string_lossy();
        let base = if base.is_empty() {
            "addon".to_string()
        } else {
            base.replace(std::path::MAIN_SEPARATOR, "-")
        };

        for _ in 0..MAX_TEMP_ATTEMPTS {
            let suffix = Uuid::new_v4().simple().to_string();
            let candidate = self
                .temp_root
                .join(format!("{}-current-install-{}", base, &suffix[..12]));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not find an unused temp directory name",
        ))
    }
}

/// Reduces an addon-controlled path to a relative path that cannot escape
/// the directory it is joined to.
///
/// Root and prefix components are dropped, `.` is ignored and `..` only
/// removes a segment added earlier; leading `..` runs are stripped.
#[must_use]
pub fn sanitize_relative(segment: &str) -> PathBuf {
    let normalized = segment.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                if let Some(part) = part.to_str() {
                    parts.push(part);
                }
            }
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    parts.iter().collect()
}

/// Joins a sanitised addon-controlled segment onto `root`.
#[must_use]
pub fn join_sanitized(root: &Path, segment: &str) -> PathBuf {
    root.join(sanitize_relative(segment))
}
