use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::model::{CatalogBundled, StaticSource};
use crate::utils::paths::{
    get_config_path, get_downloads_dir, get_local_packages_dir, get_packages_dir,
};

/// Default repository serving `index.json`, `apk/` and `icon/`.
pub const DEFAULT_REPOSITORY_URL: &str = "https://catalogs.cathost.dev/repo";

/// Remote repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Base URL of the repository
    #[serde(default = "default_repository_url")]
    pub url: String,
}

fn default_repository_url() -> String {
    DEFAULT_REPOSITORY_URL.to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: default_repository_url(),
        }
    }
}

/// Package directory overrides. Unset entries resolve under the app dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

impl PackagesConfig {
    pub fn system_dir(&self) -> Result<PathBuf> {
        self.system_dir.clone().map_or_else(get_packages_dir, Ok)
    }

    pub fn local_dir(&self) -> Result<PathBuf> {
        self.local_dir.clone().map_or_else(get_local_packages_dir, Ok)
    }

    pub fn download_dir(&self) -> Result<PathBuf> {
        self.download_dir.clone().map_or_else(get_downloads_dir, Ok)
    }
}

/// A catalog shipped with the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledCatalogConfig {
    pub source_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "all".to_string()
}

impl BundledCatalogConfig {
    pub fn to_catalog(&self) -> CatalogBundled {
        CatalogBundled::new(
            self.description.clone(),
            Arc::new(StaticSource::new(self.source_id, &self.name, &self.lang)),
        )
    }
}

fn default_bundled() -> Vec<BundledCatalogConfig> {
    vec![BundledCatalogConfig {
        source_id: 0,
        name: "Local source".to_string(),
        description: "Content stored on this machine".to_string(),
        lang: default_lang(),
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default = "default_bundled")]
    pub bundled: Vec<BundledCatalogConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            packages: PackagesConfig::default(),
            bundled: default_bundled(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;

        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", config_path))?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path()?;

        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn bundled_catalogs(&self) -> Vec<CatalogBundled> {
        self.bundled.iter().map(BundledCatalogConfig::to_catalog).collect()
    }
}
