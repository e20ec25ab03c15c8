//! Package manifest parsing and validation.
//!
//! Every installable package carries a `package.toml` at its root describing
//! the package and the single source it exposes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::model::{InstalledPackage, StaticSource};

/// File name of the manifest inside a package.
pub const MANIFEST_FILE: &str = "package.toml";

/// Package manifest from a package.toml file.
///
/// Required fields: pkg, name, version, code, lang, source_id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Package name, the installable unit identity (e.g. "com.foo")
    pub pkg: String,

    /// Display name of the catalog
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Human-readable version
    pub version: String,

    /// Monotonic version code used for update detection
    pub code: i64,

    pub lang: String,

    /// Identity of the source exposed by this package
    pub source_id: i64,

    #[serde(default)]
    pub nsfw: bool,
}

impl PackageManifest {
    /// Parse a manifest from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse package.toml")
    }

    /// Read and parse the manifest at the root of `package_dir`.
    pub fn read_from(package_dir: &Path) -> Result<Self> {
        let path = package_dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    /// Validate the manifest fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.pkg.trim().is_empty() {
            return Err("Package name cannot be empty".to_string());
        }

        if !is_valid_pkg_name(&self.pkg) {
            return Err(format!(
                "Invalid package name '{}': only alphanumerics, '.', '_' and '-' are allowed",
                self.pkg
            ));
        }

        if self.name.trim().is_empty() {
            return Err("Catalog name cannot be empty".to_string());
        }

        if self.version.trim().is_empty() {
            return Err("Version cannot be empty".to_string());
        }

        if self.code < 0 {
            return Err(format!("Invalid version code {}", self.code));
        }

        Ok(())
    }

    /// Build the installed-package metadata this manifest describes.
    pub fn to_installed_package(&self) -> InstalledPackage {
        InstalledPackage {
            name: self.name.clone(),
            description: self.description.clone(),
            pkg_name: self.pkg.clone(),
            version_name: self.version.clone(),
            version_code: self.code,
            source: Arc::new(StaticSource::new(self.source_id, &self.name, &self.lang)),
        }
    }
}

/// Package names double as directory and file names, so path separators and
/// anything that could escape the packages directory are rejected.
pub fn is_valid_pkg_name(pkg: &str) -> bool {
    !pkg.is_empty()
        && pkg != "."
        && pkg != ".."
        && pkg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::Source;
    use tempfile::TempDir;

    const VALID: &str = r#"
pkg = "com.foo"
name = "Foo"
description = "Foo catalog"
version = "1.0"
code = 3
lang = "en"
source_id = 42
"#;

    #[test]
    fn test_parse_valid_manifest() {
        let manifest = PackageManifest::parse(VALID).unwrap();
        assert_eq!(manifest.pkg, "com.foo");
        assert_eq!(manifest.code, 3);
        assert_eq!(manifest.source_id, 42);
        assert!(!manifest.nsfw);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_with_unknown_fields() {
        let toml = format!("{VALID}\nfuture_field = \"ignored\"\n");
        let manifest = PackageManifest::parse(&toml).unwrap();
        assert_eq!(manifest.name, "Foo");
    }

    #[test]
    fn test_parse_missing_required_field() {
        let result = PackageManifest::parse("pkg = \"com.foo\"\nname = \"Foo\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_path_like_pkg() {
        let mut manifest = PackageManifest::parse(VALID).unwrap();
        manifest.pkg = "../escape".to_string();
        let err = manifest.validate().unwrap_err();
        assert!(err.contains("Invalid package name"));
    }

    #[test]
    fn test_validate_empty_name() {
        let mut manifest = PackageManifest::parse(VALID).unwrap();
        manifest.name = "  ".to_string();
        assert!(manifest.validate().unwrap_err().contains("name cannot be empty"));
    }

    #[test]
    fn test_read_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(MANIFEST_FILE), VALID).unwrap();

        let manifest = PackageManifest::read_from(temp_dir.path()).unwrap();
        let package = manifest.to_installed_package();
        assert_eq!(package.pkg_name, "com.foo");
        assert_eq!(package.source.id(), 42);
        assert_eq!(package.source.lang(), "en");
    }

    #[test]
    fn test_is_valid_pkg_name() {
        assert!(is_valid_pkg_name("com.foo"));
        assert!(is_valid_pkg_name("org.example.source-ext_en"));
        assert!(!is_valid_pkg_name(""));
        assert!(!is_valid_pkg_name(".."));
        assert!(!is_valid_pkg_name("com/foo"));
        assert!(!is_valid_pkg_name("com foo"));
    }
}
