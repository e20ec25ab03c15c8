//! Catalog data model.
//!
//! A catalog is a content source pluggable into the host. Local catalogs are
//! either bundled with the host or installed from a package; remote catalogs
//! are metadata-only descriptors of packages available for installation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The content provider a catalog exposes. Opaque to the registry apart
/// from its identity.
pub trait Source: Send + Sync + fmt::Debug {
    /// Stable identity of the source, independent of the package shipping it.
    fn id(&self) -> i64;

    /// Display name of the source.
    fn name(&self) -> &str;

    /// Language code of the content (e.g. "en", "all").
    fn lang(&self) -> &str;
}

/// Attributes shared by every kind of catalog.
pub trait Catalog {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn source_id(&self) -> i64;
}

/// A source described by static metadata, used for bundled catalogs and for
/// sources materialized from a package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSource {
    pub id: i64,
    pub name: String,
    pub lang: String,
}

impl StaticSource {
    pub fn new(id: i64, name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            lang: lang.into(),
        }
    }
}

impl Source for StaticSource {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lang(&self) -> &str {
        &self.lang
    }
}

/// A catalog shipped inside the host. Always present.
#[derive(Debug, Clone)]
pub struct CatalogBundled {
    pub name: String,
    pub description: String,
    pub source: Arc<dyn Source>,
}

impl CatalogBundled {
    pub fn new(description: impl Into<String>, source: Arc<dyn Source>) -> Self {
        Self {
            name: source.name().to_string(),
            description: description.into(),
            source,
        }
    }
}

impl Catalog for CatalogBundled {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn source_id(&self) -> i64 {
        self.source.id()
    }
}

/// Package metadata common to both installation kinds.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub description: String,
    pub pkg_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub source: Arc<dyn Source>,
}

/// A catalog materialized from an installed package.
#[derive(Debug, Clone)]
pub enum CatalogInstalled {
    /// Installed through the package manager.
    SystemWide(InstalledPackage),
    /// Side-loaded into an app-private directory.
    Locally {
        package: InstalledPackage,
        install_dir: PathBuf,
    },
}

impl CatalogInstalled {
    pub fn package(&self) -> &InstalledPackage {
        match self {
            CatalogInstalled::SystemWide(package) => package,
            CatalogInstalled::Locally { package, .. } => package,
        }
    }

    pub fn pkg_name(&self) -> &str {
        &self.package().pkg_name
    }

    pub fn version_name(&self) -> &str {
        &self.package().version_name
    }

    pub fn version_code(&self) -> i64 {
        self.package().version_code
    }

    /// Directory the package was side-loaded into, if any.
    pub fn install_dir(&self) -> Option<&Path> {
        match self {
            CatalogInstalled::SystemWide(_) => None,
            CatalogInstalled::Locally { install_dir, .. } => Some(install_dir),
        }
    }
}

impl Catalog for CatalogInstalled {
    fn name(&self) -> &str {
        &self.package().name
    }

    fn description(&self) -> &str {
        &self.package().description
    }

    fn source_id(&self) -> i64 {
        self.package().source.id()
    }
}

/// A locally usable catalog: bundled or installed.
#[derive(Debug, Clone)]
pub enum CatalogLocal {
    Bundled(CatalogBundled),
    Installed(CatalogInstalled),
}

impl CatalogLocal {
    pub fn source(&self) -> &Arc<dyn Source> {
        match self {
            CatalogLocal::Bundled(bundled) => &bundled.source,
            CatalogLocal::Installed(installed) => &installed.package().source,
        }
    }

    pub fn as_installed(&self) -> Option<&CatalogInstalled> {
        match self {
            CatalogLocal::Installed(installed) => Some(installed),
            CatalogLocal::Bundled(_) => None,
        }
    }

    /// Package name for installed catalogs. Bundled catalogs have none.
    pub fn pkg_name(&self) -> Option<&str> {
        self.as_installed().map(CatalogInstalled::pkg_name)
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self, CatalogLocal::Bundled(_))
    }
}

impl Catalog for CatalogLocal {
    fn name(&self) -> &str {
        match self {
            CatalogLocal::Bundled(bundled) => bundled.name(),
            CatalogLocal::Installed(installed) => installed.name(),
        }
    }

    fn description(&self) -> &str {
        match self {
            CatalogLocal::Bundled(bundled) => bundled.description(),
            CatalogLocal::Installed(installed) => installed.description(),
        }
    }

    fn source_id(&self) -> i64 {
        self.source().id()
    }
}

impl From<CatalogBundled> for CatalogLocal {
    fn from(bundled: CatalogBundled) -> Self {
        CatalogLocal::Bundled(bundled)
    }
}

impl From<CatalogInstalled> for CatalogLocal {
    fn from(installed: CatalogInstalled) -> Self {
        CatalogLocal::Installed(installed)
    }
}

/// A package advertised by the remote index, available for installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRemote {
    pub name: String,
    pub description: String,
    pub source_id: i64,
    pub pkg_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub lang: String,
    pub pkg_url: String,
    pub icon_url: String,
    pub nsfw: bool,
}

impl Catalog for CatalogRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn source_id(&self) -> i64 {
        self.source_id
    }
}
