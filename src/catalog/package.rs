//! Package manager primitives.
//!
//! [`PackageInstaller`] is the install/uninstall capability the installer
//! drives. [`DirectoryPackageManager`] implements it on top of a packages
//! directory: a package file is a gzip-compressed tar archive containing a
//! `package.toml`, installed by extracting it into `<packages>/<pkg_name>`.

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

use crate::catalog::manifest::{MANIFEST_FILE, PackageManifest, is_valid_pkg_name};

/// Install and uninstall primitives of the package manager.
pub trait PackageInstaller: Send + Sync {
    /// Install the package file for `pkg_name`. `Ok(false)` means the
    /// package manager rejected the package.
    fn install(&self, file: &Path, pkg_name: &str) -> Result<bool>;

    /// Uninstall `pkg_name`. `Ok(false)` means nothing was uninstalled.
    fn uninstall(&self, pkg_name: &str) -> Result<bool>;
}

/// Directory-backed package manager.
#[derive(Debug, Clone)]
pub struct DirectoryPackageManager {
    packages_dir: PathBuf,
}

impl DirectoryPackageManager {
    pub fn new(packages_dir: PathBuf) -> Self {
        Self { packages_dir }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    fn staging_dir(&self, pkg_name: &str) -> PathBuf {
        self.packages_dir.join(format!(".staging-{}", pkg_name))
    }
}

impl PackageInstaller for DirectoryPackageManager {
    fn install(&self, file: &Path, pkg_name: &str) -> Result<bool> {
        if !is_valid_pkg_name(pkg_name) {
            tracing::warn!(pkg_name = %pkg_name, "Rejecting install of invalid package name");
            return Ok(false);
        }

        fs::create_dir_all(&self.packages_dir).with_context(|| {
            format!("Failed to create packages directory: {:?}", self.packages_dir)
        })?;

        let staging = self.staging_dir(pkg_name);
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("Failed to clear staging directory: {:?}", staging))?;
        }

        let result = install_from_staging(file, pkg_name, &staging, &self.packages_dir);
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn uninstall(&self, pkg_name: &str) -> Result<bool> {
        if !is_valid_pkg_name(pkg_name) {
            return Ok(false);
        }

        let target_dir = self.packages_dir.join(pkg_name);
        if !target_dir.is_dir() {
            return Ok(false);
        }

        fs::remove_dir_all(&target_dir)
            .with_context(|| format!("Failed to remove package directory: {:?}", target_dir))?;
        tracing::info!(pkg_name = %pkg_name, "Package uninstalled");
        Ok(true)
    }
}

fn install_from_staging(
    file: &Path,
    pkg_name: &str,
    staging: &Path,
    packages_dir: &Path,
) -> Result<bool> {
    let extracted = extract_package_archive(file, staging)?;

    if !extracted.join(MANIFEST_FILE).exists() {
        tracing::warn!(pkg_name = %pkg_name, "Package archive has no {}", MANIFEST_FILE);
        return Ok(false);
    }

    let manifest = match PackageManifest::read_from(&extracted) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(pkg_name = %pkg_name, "Package manifest unreadable: {:#}", e);
            return Ok(false);
        }
    };
    if let Err(e) = manifest.validate() {
        tracing::warn!(pkg_name = %pkg_name, "Package manifest invalid: {}", e);
        return Ok(false);
    }
    if manifest.pkg != pkg_name {
        tracing::warn!(
            pkg_name = %pkg_name,
            declared = %manifest.pkg,
            "Package archive declares a different package"
        );
        return Ok(false);
    }

    let target_dir = packages_dir.join(pkg_name);
    if target_dir.is_dir() {
        replace_in_place(&extracted, &target_dir)
            .with_context(|| format!("Failed to update package: {:?}", target_dir))?;
    } else {
        fs::rename(&extracted, &target_dir)
            .with_context(|| format!("Failed to move package into place: {:?}", target_dir))?;
    }

    tracing::info!(
        pkg_name = %pkg_name,
        version = %manifest.version,
        code = manifest.code,
        "Package installed"
    );
    Ok(true)
}

/// Extract a tar.gz archive into `target_dir`.
///
/// Returns the package root: the single top-level directory if the archive
/// has exactly one, otherwise `target_dir` itself.
pub fn extract_package_archive(archive_path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let tar_gz = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open package file: {:?}", archive_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz));

    fs::create_dir_all(target_dir)?;
    archive
        .unpack(target_dir)
        .context("Failed to extract package archive")?;

    let entries: Vec<_> = fs::read_dir(target_dir)?
        .filter_map(|e| e.ok())
        .collect();

    if entries.len() == 1 && entries[0].path().is_dir() {
        Ok(entries[0].path())
    } else {
        Ok(target_dir.to_path_buf())
    }
}

/// Swap the contents of an installed package for the staged ones.
///
/// The package directory itself stays put, so watchers never see the
/// package disappear. The manifest is moved last and its rename marks the
/// update as complete.
fn replace_in_place(staged: &Path, target_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(target_dir)? {
        let entry = entry?;
        if entry.file_name() == MANIFEST_FILE {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    for entry in fs::read_dir(staged)? {
        let entry = entry?;
        if entry.file_name() == MANIFEST_FILE {
            continue;
        }
        fs::rename(entry.path(), target_dir.join(entry.file_name()))?;
    }

    fs::rename(staged.join(MANIFEST_FILE), target_dir.join(MANIFEST_FILE))?;
    Ok(())
}

/// Build a package archive from a directory. Used by tests and tooling that
/// publish packages.
pub fn pack_directory(source_dir: &Path, archive_path: &Path) -> Result<()> {
    if !source_dir.join(MANIFEST_FILE).exists() {
        bail!("{:?} does not contain {}", source_dir, MANIFEST_FILE);
    }

    let file = fs::File::create(archive_path)
        .with_context(|| format!("Failed to create archive: {:?}", archive_path))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", source_dir)
        .context("Failed to add package files to archive")?;
    builder.into_inner()?.finish()?;
    Ok(())
}
