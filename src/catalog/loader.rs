//! Catalog loading from installed packages.
//!
//! The registry never materializes catalogs itself; it asks a
//! [`CatalogLoader`]. [`DirectoryCatalogLoader`] is the filesystem-backed
//! implementation: every package is a directory holding a `package.toml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::manifest::{MANIFEST_FILE, PackageManifest, is_valid_pkg_name};
use crate::catalog::model::{CatalogBundled, CatalogInstalled, CatalogLocal};

/// Materializes local catalogs from packages.
pub trait CatalogLoader: Send + Sync {
    /// Enumerate every usable catalog, bundled ones included. Called once at
    /// registry startup.
    fn load_all(&self) -> Vec<CatalogLocal>;

    /// Materialize the catalog shipped by `pkg_name`. `None` when the package
    /// does not exist (any more) or cannot be loaded.
    fn load(&self, pkg_name: &str) -> Option<CatalogLocal>;
}

/// Kinds of package loading errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// Package directory has no package.toml.
    MissingManifest,
    /// package.toml could not be read or parsed.
    UnreadableManifest,
    /// package.toml parsed but failed validation.
    InvalidManifest,
    /// Directory name and manifest `pkg` disagree.
    PackageMismatch { expected: String, actual: String },
}

/// Error when loading a package into a catalog.
#[derive(Debug, Clone)]
pub struct LoadError {
    /// Package that failed to load.
    pub pkg_name: String,
    pub kind: LoadErrorKind,
    /// Human-readable error message.
    pub message: String,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pkg_name, self.message)
    }
}

impl std::error::Error for LoadError {}

/// Whether a package directory was installed through the package manager or
/// side-loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    SystemWide,
    Locally,
}

/// Loads catalogs from two package directories plus a fixed set of bundled
/// catalogs.
#[derive(Debug, Clone)]
pub struct DirectoryCatalogLoader {
    bundled: Vec<CatalogBundled>,
    system_dir: PathBuf,
    local_dir: PathBuf,
}

impl DirectoryCatalogLoader {
    pub fn new(bundled: Vec<CatalogBundled>, system_dir: PathBuf, local_dir: PathBuf) -> Self {
        Self {
            bundled,
            system_dir,
            local_dir,
        }
    }

    pub fn system_dir(&self) -> &Path {
        &self.system_dir
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Load a single package directory.
    ///
    /// The directory name must match the manifest's `pkg`.
    pub fn load_package_dir(
        package_dir: &Path,
        kind: InstallKind,
    ) -> Result<CatalogInstalled, LoadError> {
        let dir_name = package_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let error = |kind: LoadErrorKind, message: String| LoadError {
            pkg_name: dir_name.clone(),
            kind,
            message,
        };

        if !package_dir.join(MANIFEST_FILE).exists() {
            return Err(error(
                LoadErrorKind::MissingManifest,
                format!("Missing {}", MANIFEST_FILE),
            ));
        }

        let manifest = PackageManifest::read_from(package_dir)
            .map_err(|e| error(LoadErrorKind::UnreadableManifest, format!("{:#}", e)))?;

        manifest
            .validate()
            .map_err(|e| error(LoadErrorKind::InvalidManifest, e))?;

        if manifest.pkg != dir_name {
            return Err(error(
                LoadErrorKind::PackageMismatch {
                    expected: dir_name.clone(),
                    actual: manifest.pkg.clone(),
                },
                format!(
                    "Manifest declares package '{}' but directory is '{}'",
                    manifest.pkg, dir_name
                ),
            ));
        }

        let package = manifest.to_installed_package();
        Ok(match kind {
            InstallKind::SystemWide => CatalogInstalled::SystemWide(package),
            InstallKind::Locally => CatalogInstalled::Locally {
                package,
                install_dir: package_dir.to_path_buf(),
            },
        })
    }

    /// Scan a packages directory, skipping (and logging) anything unloadable.
    ///
    /// Returns an empty list if the directory does not exist.
    fn discover(dir: &Path, kind: InstallKind) -> Vec<CatalogLocal> {
        if !dir.exists() {
            tracing::debug!("Packages directory does not exist: {:?}", dir);
            return Vec::new();
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to read packages directory {:?}: {}", dir, e);
                return Vec::new();
            }
        };

        let mut catalogs = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let package_dir = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !package_dir.is_dir() {
                continue;
            }

            match Self::load_package_dir(&package_dir, kind) {
                Ok(installed) => {
                    tracing::debug!(
                        pkg_name = %installed.pkg_name(),
                        kind = ?kind,
                        "Discovered package"
                    );
                    catalogs.push(CatalogLocal::Installed(installed));
                }
                Err(e) => {
                    tracing::warn!(
                        pkg_name = %e.pkg_name,
                        kind = ?e.kind,
                        "Skipping package: {}",
                        e.message
                    );
                }
            }
        }

        // read_dir order is platform dependent
        catalogs.sort_by(|a, b| a.pkg_name().cmp(&b.pkg_name()));
        catalogs
    }
}

impl CatalogLoader for DirectoryCatalogLoader {
    fn load_all(&self) -> Vec<CatalogLocal> {
        let mut catalogs: Vec<CatalogLocal> = self
            .bundled
            .iter()
            .cloned()
            .map(CatalogLocal::Bundled)
            .collect();
        catalogs.extend(Self::discover(&self.system_dir, InstallKind::SystemWide));
        catalogs.extend(Self::discover(&self.local_dir, InstallKind::Locally));
        catalogs
    }

    fn load(&self, pkg_name: &str) -> Option<CatalogLocal> {
        if !is_valid_pkg_name(pkg_name) {
            tracing::warn!(pkg_name = %pkg_name, "Refusing to load invalid package name");
            return None;
        }

        let candidates = [
            (self.system_dir.join(pkg_name), InstallKind::SystemWide),
            (self.local_dir.join(pkg_name), InstallKind::Locally),
        ];

        for (package_dir, kind) in candidates {
            if !package_dir.is_dir() {
                continue;
            }
            match Self::load_package_dir(&package_dir, kind) {
                Ok(installed) => return Some(CatalogLocal::Installed(installed)),
                Err(e) => {
                    tracing::warn!(
                        pkg_name = %pkg_name,
                        kind = ?e.kind,
                        "Failed to load package: {}",
                        e.message
                    );
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{Catalog, StaticSource};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_package(dir: &Path, pkg: &str, source_id: i64, code: i64) -> PathBuf {
        let package_dir = dir.join(pkg);
        fs::create_dir_all(&package_dir).unwrap();
        let manifest = format!(
            r#"pkg = "{pkg}"
name = "Catalog {source_id}"
description = "Test catalog"
version = "1.{code}"
code = {code}
lang = "en"
source_id = {source_id}
"#
        );
        fs::write(package_dir.join(MANIFEST_FILE), manifest).unwrap();
        package_dir
    }

    fn loader(root: &Path) -> DirectoryCatalogLoader {
        let bundled = CatalogBundled::new(
            "Files on disk",
            Arc::new(StaticSource::new(0, "Local source", "all")),
        );
        DirectoryCatalogLoader::new(vec![bundled], root.join("system"), root.join("local"))
    }

    #[test]
    fn test_load_all_puts_bundled_first() {
        let temp_dir = TempDir::new().unwrap();
        let loader = loader(temp_dir.path());
        write_package(loader.system_dir(), "com.b", 2, 1);
        write_package(loader.system_dir(), "com.a", 1, 1);
        write_package(loader.local_dir(), "com.c", 3, 1);

        let catalogs = loader.load_all();
        assert_eq!(catalogs.len(), 4);
        assert!(catalogs[0].is_bundled());
        assert_eq!(catalogs[1].pkg_name(), Some("com.a"));
        assert_eq!(catalogs[2].pkg_name(), Some("com.b"));

        let local = catalogs[3].as_installed().unwrap();
        assert_eq!(local.pkg_name(), "com.c");
        assert_eq!(local.install_dir(), Some(loader.local_dir().join("com.c").as_path()));
    }

    #[test]
    fn test_load_all_without_directories() {
        let temp_dir = TempDir::new().unwrap();
        let catalogs = loader(temp_dir.path()).load_all();
        assert_eq!(catalogs.len(), 1);
    }

    #[test]
    fn test_load_all_skips_broken_packages() {
        let temp_dir = TempDir::new().unwrap();
        let loader = loader(temp_dir.path());
        write_package(loader.system_dir(), "com.good", 5, 1);
        fs::create_dir_all(loader.system_dir().join("com.empty")).unwrap();
        let bad = loader.system_dir().join("com.bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(MANIFEST_FILE), "not toml [[[").unwrap();

        let catalogs = loader.load_all();
        assert_eq!(catalogs.len(), 2);
        assert_eq!(catalogs[1].source_id(), 5);
    }

    #[test]
    fn test_load_single_package() {
        let temp_dir = TempDir::new().unwrap();
        let loader = loader(temp_dir.path());
        write_package(loader.system_dir(), "com.foo", 42, 2);

        let catalog = loader.load("com.foo").unwrap();
        assert_eq!(catalog.source_id(), 42);
        assert_eq!(catalog.as_installed().unwrap().version_code(), 2);
        assert!(loader.load("com.missing").is_none());
    }

    #[test]
    fn test_load_prefers_system_wide() {
        let temp_dir = TempDir::new().unwrap();
        let loader = loader(temp_dir.path());
        write_package(loader.system_dir(), "com.foo", 42, 2);
        write_package(loader.local_dir(), "com.foo", 42, 1);

        let catalog = loader.load("com.foo").unwrap();
        assert!(matches!(
            catalog.as_installed(),
            Some(CatalogInstalled::SystemWide(_))
        ));
    }

    #[test]
    fn test_package_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let package_dir = write_package(temp_dir.path(), "com.foo", 1, 1);
        let renamed = temp_dir.path().join("com.other");
        fs::rename(&package_dir, &renamed).unwrap();

        let err = DirectoryCatalogLoader::load_package_dir(&renamed, InstallKind::SystemWide)
            .unwrap_err();
        assert_eq!(
            err.kind,
            LoadErrorKind::PackageMismatch {
                expected: "com.other".to_string(),
                actual: "com.foo".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_manifest_error() {
        let temp_dir = TempDir::new().unwrap();
        let package_dir = temp_dir.path().join("com.empty");
        fs::create_dir_all(&package_dir).unwrap();

        let err = DirectoryCatalogLoader::load_package_dir(&package_dir, InstallKind::Locally)
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::MissingManifest);
        assert_eq!(err.to_string(), "com.empty: Missing package.toml");
    }
}
