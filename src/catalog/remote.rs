//! Cached copy of the remote catalog directory.
//!
//! The repository publishes `index.json`, a JSON array describing every
//! package it serves. [`RemoteCatalogCache`] persists the last fetched list,
//! exposes it as an observable value and throttles re-fetching.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::catalog::model::CatalogRemote;
use crate::storage::RemoteCatalogStore;

/// Non-forced refreshes closer together than this are skipped.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const INDEX_FILE: &str = "index.json";

pub type RemoteSnapshot = Arc<Vec<CatalogRemote>>;

/// One entry of the repository index, as served.
#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    name: String,
    pkg: String,
    version: String,
    code: i64,
    lang: String,
    apk: String,
    id: i64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    nsfw: Option<bool>,
}

impl IndexEntry {
    fn into_catalog(self, base_url: &str) -> CatalogRemote {
        let icon = match self.apk.strip_suffix(".apk") {
            Some(stem) => format!("{}.png", stem),
            None => format!("{}.png", self.apk),
        };
        CatalogRemote {
            pkg_url: format!("{}/apk/{}", base_url, self.apk),
            icon_url: format!("{}/icon/{}", base_url, icon),
            name: self.name,
            description: self.description,
            source_id: self.id,
            pkg_name: self.pkg,
            version_name: self.version,
            version_code: self.code,
            lang: self.lang,
            nsfw: self.nsfw.unwrap_or(false),
        }
    }
}

/// Parse a repository index, deriving download and icon URLs from `base_url`.
pub fn parse_index(content: &str, base_url: &str) -> Result<Vec<CatalogRemote>> {
    let entries: Vec<IndexEntry> =
        serde_json::from_str(content).context("Failed to parse repository index")?;
    let base_url = base_url.trim_end_matches('/');
    Ok(entries
        .into_iter()
        .map(|entry| entry.into_catalog(base_url))
        .collect())
}

struct RemoteInner {
    client: reqwest::Client,
    base_url: String,
    store: Arc<dyn RemoteCatalogStore>,
    min_refresh_interval: Duration,
    last_checked_at: Mutex<Option<Instant>>,
    // Numbers fetches in the order they started
    started: AtomicU64,
    // Last fetch written to the store. Held across the write and the publish.
    applied: tokio::sync::Mutex<u64>,
    snapshots: watch::Sender<RemoteSnapshot>,
}

/// Handle to the remote catalog cache. Clones share state.
#[derive(Clone)]
pub struct RemoteCatalogCache {
    inner: Arc<RemoteInner>,
}

impl RemoteCatalogCache {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn RemoteCatalogStore>,
    ) -> Self {
        Self::with_min_refresh_interval(client, base_url, store, MIN_REFRESH_INTERVAL)
    }

    pub fn with_min_refresh_interval(
        client: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn RemoteCatalogStore>,
        min_refresh_interval: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let (snapshots, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(RemoteInner {
                client,
                base_url,
                store,
                min_refresh_interval,
                last_checked_at: Mutex::new(None),
                started: AtomicU64::new(0),
                applied: tokio::sync::Mutex::new(0),
                snapshots,
            }),
        }
    }

    pub fn index_url(&self) -> String {
        format!("{}/{}", self.inner.base_url, INDEX_FILE)
    }

    /// Publish the persisted list, then start an unconditional background
    /// refresh. Refresh failures are logged, not returned.
    pub async fn initialize(&self) -> Result<JoinHandle<()>> {
        self.load_persisted().await?;

        let cache = self.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = cache.refresh(true).await {
                warn!("Background catalog refresh failed: {:#}", e);
            }
        }))
    }

    /// Publish the last persisted list without touching the network.
    pub async fn load_persisted(&self) -> Result<RemoteSnapshot> {
        let store = Arc::clone(&self.inner.store);
        let persisted = tokio::task::spawn_blocking(move || store.find_all())
            .await
            .context("Catalog store task failed")??;
        debug!(count = persisted.len(), "Loaded persisted remote catalogs");

        let snapshot = Arc::new(persisted);
        self.inner.snapshots.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Current remote list.
    pub fn catalogs(&self) -> RemoteSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    /// Subscribe to list changes. The receiver starts with the current list.
    pub fn observe(&self) -> watch::Receiver<RemoteSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Fetch the repository index and replace the cached list.
    ///
    /// Without `force`, does nothing if the previous attempt was less than
    /// the minimum refresh interval ago. The attempt time is recorded before
    /// fetching, so a failing remote is not retried in a tight loop. On
    /// failure the previous list is kept.
    ///
    /// The published list is the one read back from the store, so memory and
    /// disk agree on order and on which duplicate won. A fetch that finishes
    /// after a later-started one has been applied is discarded.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        let Some(generation) = self.begin_refresh(force) else {
            debug!("Skipping catalog refresh, checked recently");
            return Ok(());
        };

        let catalogs = self.fetch_index().await?;

        let mut applied = self.inner.applied.lock().await;
        if *applied > generation {
            debug!(generation, applied = *applied, "Discarding superseded catalog refresh");
            return Ok(());
        }

        let store = Arc::clone(&self.inner.store);
        let persisted = tokio::task::spawn_blocking(move || {
            store.replace_all(&catalogs)?;
            store.find_all()
        })
        .await
        .context("Catalog store task failed")??;
        *applied = generation;

        debug!(count = persisted.len(), generation, "Remote catalogs refreshed");
        self.inner.snapshots.send_replace(Arc::new(persisted));
        Ok(())
    }

    /// Check the throttle and record the attempt in one step. Returns the
    /// attempt's generation when it may proceed.
    fn begin_refresh(&self, force: bool) -> Option<u64> {
        let mut last = self
            .inner
            .last_checked_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if !force
            && let Some(checked) = *last
            && now.duration_since(checked) < self.inner.min_refresh_interval
        {
            return None;
        }
        *last = Some(now);
        Some(self.inner.started.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn fetch_index(&self) -> Result<Vec<CatalogRemote>> {
        let url = self.index_url();
        debug!(url = %url, "Fetching repository index");

        let response = match self.inner.client.get(&url).send().await {
            Ok(r) => {
                debug!(status = %r.status(), "Received HTTP response");
                r
            }
            Err(e) => {
                warn!(error = %e, url = %url, "Failed to fetch repository index");
                return Err(e).with_context(|| format!("Failed to fetch {}", url));
            }
        };

        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                url = %url,
                "Repository index returned non-success status"
            );
            anyhow::bail!("Failed to fetch repository index: HTTP {}", response.status());
        }

        let content = response
            .text()
            .await
            .context("Failed to read repository index")?;
        debug!(content_length = content.len(), "Received repository index");

        parse_index(&content, &self.inner.base_url)
    }
}
