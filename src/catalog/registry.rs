//! Registry of locally usable catalogs.
//!
//! The registry owns the authoritative list of bundled and installed
//! catalogs together with a `source_id` index. Package events arrive through
//! an [`InstallEventBridge`] and are funnelled into a channel drained by a
//! single writer task, so events for one package are applied in delivery
//! order. Every mutation publishes a new immutable snapshot.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::events::{InstallEventBridge, InstallListener};
use crate::catalog::loader::CatalogLoader;
use crate::catalog::model::{Catalog, CatalogLocal};

/// Immutable view of the registry contents. Bundled catalogs come first.
pub type CatalogSnapshot = Arc<Vec<CatalogLocal>>;

#[derive(Debug)]
enum RegistryEvent {
    Installed(String),
    Uninstalled(String),
}

/// Forwards bridge callbacks into the registry's event channel. Runs on
/// whatever thread the event source uses and never blocks.
struct RegistryListener {
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl InstallListener for RegistryListener {
    fn on_installed(&self, pkg_name: &str) {
        let _ = self.tx.send(RegistryEvent::Installed(pkg_name.to_string()));
    }

    fn on_uninstalled(&self, pkg_name: &str) {
        let _ = self.tx.send(RegistryEvent::Uninstalled(pkg_name.to_string()));
    }
}

struct RegistryState {
    catalogs: CatalogSnapshot,
    by_source_id: HashMap<i64, CatalogLocal>,
}

impl RegistryState {
    fn from_catalogs(loaded: Vec<CatalogLocal>) -> Self {
        let mut catalogs: Vec<CatalogLocal> = Vec::with_capacity(loaded.len());
        let mut by_source_id = HashMap::with_capacity(loaded.len());

        for catalog in loaded {
            let source_id = catalog.source_id();
            if by_source_id.contains_key(&source_id) {
                tracing::warn!(source_id, "Duplicate source id at startup, keeping the latest");
                catalogs.retain(|c| c.source_id() != source_id);
            }
            by_source_id.insert(source_id, catalog.clone());
            catalogs.push(catalog);
        }

        // Stable, so the loader's relative order survives
        catalogs.sort_by_key(|c| !c.is_bundled());

        Self {
            catalogs: Arc::new(catalogs),
            by_source_id,
        }
    }
}

struct RegistryInner {
    loader: Arc<dyn CatalogLoader>,
    state: RwLock<RegistryState>,
    snapshots: watch::Sender<CatalogSnapshot>,
}

/// Handle to the catalog registry. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct CatalogRegistry {
    inner: Arc<RegistryInner>,
}

impl CatalogRegistry {
    /// Enumerate catalogs through the loader and subscribe to package events.
    pub async fn initialize(
        loader: Arc<dyn CatalogLoader>,
        bridge: &InstallEventBridge,
    ) -> Result<Self> {
        let registry = Self::load(loader).await?;
        registry.listen(bridge)?;
        Ok(registry)
    }

    /// Enumerate catalogs without subscribing to package events.
    pub async fn load(loader: Arc<dyn CatalogLoader>) -> Result<Self> {
        let enumerate = Arc::clone(&loader);
        let loaded = tokio::task::spawn_blocking(move || enumerate.load_all())
            .await
            .context("Catalog enumeration task failed")?;

        let state = RegistryState::from_catalogs(loaded);
        tracing::info!(count = state.catalogs.len(), "Catalog registry initialized");

        let (snapshots, _) = watch::channel(Arc::clone(&state.catalogs));
        Ok(Self {
            inner: Arc::new(RegistryInner {
                loader,
                state: RwLock::new(state),
                snapshots,
            }),
        })
    }

    /// Register with the bridge and spawn the single writer task that applies
    /// package events. The task ends once the bridge drops the listener or
    /// every registry handle is gone.
    pub fn listen(&self, bridge: &InstallEventBridge) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge.register(Arc::new(RegistryListener { tx }))?;

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let registry = CatalogRegistry { inner };
                match event {
                    RegistryEvent::Installed(pkg_name) => {
                        registry.handle_installed(&pkg_name).await;
                    }
                    RegistryEvent::Uninstalled(pkg_name) => {
                        registry.handle_uninstalled(&pkg_name).await;
                    }
                }
            }
            tracing::debug!("Catalog registry event loop stopped");
        }))
    }

    /// Look up a catalog by source id.
    pub fn get(&self, source_id: i64) -> Option<CatalogLocal> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_source_id
            .get(&source_id)
            .cloned()
    }

    /// Current snapshot of all local catalogs.
    pub fn catalogs(&self) -> CatalogSnapshot {
        Arc::clone(
            &self
                .inner
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .catalogs,
        )
    }

    /// Subscribe to snapshots. The receiver holds the latest snapshot right
    /// away and is notified on every replacement.
    pub fn observe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Load `pkg_name` and put it into the registry, replacing any catalog
    /// with the same source id. Returns whether the registry changed.
    ///
    /// Load failures are logged and leave the registry untouched.
    pub async fn handle_installed(&self, pkg_name: &str) -> bool {
        match self.load_package(pkg_name).await {
            Some(catalog @ CatalogLocal::Installed(_)) => {
                let source_id = catalog.source_id();
                self.replace(catalog);
                tracing::info!(pkg_name = %pkg_name, source_id, "Catalog installed");
                true
            }
            Some(CatalogLocal::Bundled(_)) => {
                tracing::warn!(
                    pkg_name = %pkg_name,
                    "Loader returned a bundled catalog for a package, ignoring"
                );
                false
            }
            None => {
                tracing::warn!(pkg_name = %pkg_name, "Installed package could not be loaded");
                false
            }
        }
    }

    /// Remove the installed catalog shipped by `pkg_name`. No-op (returns
    /// false) when no installed catalog matches.
    ///
    /// The package is loaded once more first. If it still loads, because it
    /// was replaced in the meantime or remains in another packages
    /// directory, the entry is refreshed instead of dropped.
    pub async fn handle_uninstalled(&self, pkg_name: &str) -> bool {
        if !self.tracks(pkg_name) {
            tracing::debug!(pkg_name = %pkg_name, "Uninstalled package was not tracked");
            return false;
        }

        if let Some(catalog @ CatalogLocal::Installed(_)) = self.load_package(pkg_name).await {
            let source_id = catalog.source_id();
            self.replace(catalog);
            tracing::info!(
                pkg_name = %pkg_name,
                source_id,
                "Removed package still loads, refreshed instead"
            );
            return true;
        }

        let mut state = self.write_state();
        let removed: Vec<i64> = state
            .catalogs
            .iter()
            .filter(|c| c.pkg_name() == Some(pkg_name))
            .map(|c| c.source_id())
            .collect();
        if removed.is_empty() {
            return false;
        }

        let catalogs: Vec<CatalogLocal> = state
            .catalogs
            .iter()
            .filter(|c| c.pkg_name() != Some(pkg_name))
            .cloned()
            .collect();
        for source_id in &removed {
            state.by_source_id.remove(source_id);
        }
        self.publish(&mut state, catalogs);

        tracing::info!(pkg_name = %pkg_name, source_ids = ?removed, "Catalog uninstalled");
        true
    }

    fn tracks(&self, pkg_name: &str) -> bool {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .catalogs
            .iter()
            .any(|c| c.pkg_name() == Some(pkg_name))
    }

    async fn load_package(&self, pkg_name: &str) -> Option<CatalogLocal> {
        let loader = Arc::clone(&self.inner.loader);
        let pkg = pkg_name.to_string();
        match tokio::task::spawn_blocking(move || loader.load(&pkg)).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(pkg_name = %pkg_name, "Catalog loader failed: {}", e);
                None
            }
        }
    }

    /// Insert `catalog`, dropping entries that share its source id or its
    /// package.
    fn replace(&self, catalog: CatalogLocal) {
        let source_id = catalog.source_id();
        let pkg_name = catalog.pkg_name().map(str::to_string);
        let mut state = self.write_state();

        let (kept, dropped): (Vec<CatalogLocal>, Vec<CatalogLocal>) = state
            .catalogs
            .iter()
            .cloned()
            .partition(|c| c.source_id() != source_id && c.pkg_name() != pkg_name.as_deref());
        for old in &dropped {
            state.by_source_id.remove(&old.source_id());
        }

        let mut catalogs = kept;
        catalogs.push(catalog.clone());
        state.by_source_id.insert(source_id, catalog);
        self.publish(&mut state, catalogs);
    }

    /// Swap in the new list and notify observers. Called with the write lock
    /// held and after the index is updated, so an observer reacting to the
    /// snapshot always resolves `get` consistently.
    fn publish(
        &self,
        state: &mut RwLockWriteGuard<'_, RegistryState>,
        catalogs: Vec<CatalogLocal>,
    ) {
        state.catalogs = Arc::new(catalogs);
        self.inner.snapshots.send_replace(Arc::clone(&state.catalogs));
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::events::PackageEvent;
    use crate::catalog::loader::DirectoryCatalogLoader;
    use crate::catalog::manifest::MANIFEST_FILE;
    use crate::catalog::model::{CatalogBundled, CatalogInstalled, InstalledPackage, StaticSource};
    use crate::catalog::package::{DirectoryPackageManager, PackageInstaller, pack_directory};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeLoader {
        startup: Vec<CatalogLocal>,
        packages: Mutex<HashMap<String, CatalogLocal>>,
    }

    impl FakeLoader {
        fn with_bundled(source_id: i64) -> Self {
            Self {
                startup: vec![bundled(source_id)],
                ..Default::default()
            }
        }

        fn put(&self, pkg_name: &str, source_id: i64, version_code: i64) {
            self.packages.lock().unwrap().insert(
                pkg_name.to_string(),
                installed(pkg_name, source_id, version_code),
            );
        }

        fn forget(&self, pkg_name: &str) {
            self.packages.lock().unwrap().remove(pkg_name);
        }
    }

    impl CatalogLoader for FakeLoader {
        fn load_all(&self) -> Vec<CatalogLocal> {
            self.startup.clone()
        }

        fn load(&self, pkg_name: &str) -> Option<CatalogLocal> {
            self.packages.lock().unwrap().get(pkg_name).cloned()
        }
    }

    fn bundled(source_id: i64) -> CatalogLocal {
        CatalogLocal::Bundled(CatalogBundled::new(
            "Bundled",
            Arc::new(StaticSource::new(source_id, "Local source", "all")),
        ))
    }

    fn installed(pkg_name: &str, source_id: i64, version_code: i64) -> CatalogLocal {
        CatalogLocal::Installed(CatalogInstalled::SystemWide(InstalledPackage {
            name: format!("Catalog {source_id}"),
            description: String::new(),
            pkg_name: pkg_name.to_string(),
            version_name: format!("1.{version_code}"),
            version_code,
            source: Arc::new(StaticSource::new(source_id, "Source", "en")),
        }))
    }

    async fn next_snapshot(rx: &mut watch::Receiver<CatalogSnapshot>) -> CatalogSnapshot {
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("timed out waiting for snapshot")
            .unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_install_then_uninstall_event_roundtrip() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        loader.put("com.foo", 2, 1);
        let bridge = InstallEventBridge::detached();
        let registry = CatalogRegistry::initialize(loader.clone(), &bridge)
            .await
            .unwrap();
        let mut rx = registry.observe();
        assert_eq!(rx.borrow().len(), 1);

        bridge.dispatch(PackageEvent::added("com.foo"));
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].is_bundled());
        assert_eq!(registry.get(2).unwrap().pkg_name(), Some("com.foo"));

        loader.forget("com.foo");
        bridge.dispatch(PackageEvent::removed("com.foo"));
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.len(), 1);
        assert!(registry.get(2).is_none());
        assert!(registry.get(1).is_some());
    }

    #[tokio::test]
    async fn test_update_replaces_same_source_id() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();

        loader.put("com.foo", 2, 1);
        assert!(registry.handle_installed("com.foo").await);
        loader.put("com.foo", 2, 5);
        assert!(registry.handle_installed("com.foo").await);

        let snapshot = registry.catalogs();
        assert_eq!(snapshot.len(), 2);
        let current = registry.get(2).unwrap();
        assert_eq!(current.as_installed().unwrap().version_code(), 5);
    }

    #[tokio::test]
    async fn test_different_package_same_source_id_wins() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();

        loader.put("com.foo", 7, 1);
        loader.put("com.foo.fork", 7, 1);
        registry.handle_installed("com.foo").await;
        registry.handle_installed("com.foo.fork").await;

        let snapshot = registry.catalogs();
        let with_id: Vec<_> = snapshot.iter().filter(|c| c.source_id() == 7).collect();
        assert_eq!(with_id.len(), 1);
        assert_eq!(registry.get(7).unwrap().pkg_name(), Some("com.foo.fork"));
        let installed_count = snapshot.iter().filter(|c| !c.is_bundled()).count();
        assert_eq!(installed_count, 1);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_state() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();
        let before = registry.catalogs();

        assert!(!registry.handle_installed("com.gone").await);
        assert!(Arc::ptr_eq(&before, &registry.catalogs()));
    }

    #[tokio::test]
    async fn test_uninstall_unknown_package_is_noop() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        loader.put("com.foo", 2, 1);
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();
        registry.handle_installed("com.foo").await;
        let before = registry.catalogs();

        assert!(!registry.handle_uninstalled("com.unknown").await);
        assert!(Arc::ptr_eq(&before, &registry.catalogs()));

        loader.forget("com.foo");
        assert!(registry.handle_uninstalled("com.foo").await);
        assert!(!registry.handle_uninstalled("com.foo").await);
        assert_eq!(registry.catalogs().len(), 1);
    }

    #[tokio::test]
    async fn test_removal_of_package_that_still_loads_refreshes() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        loader.put("com.foo", 2, 1);
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();
        registry.handle_installed("com.foo").await;

        // Replaced on disk before the removal notice was handled
        loader.put("com.foo", 2, 3);
        assert!(registry.handle_uninstalled("com.foo").await);

        assert_eq!(registry.catalogs().len(), 2);
        assert_eq!(registry.get(2).unwrap().as_installed().unwrap().version_code(), 3);
    }

    #[tokio::test]
    async fn test_reinstall_with_new_source_id_drops_old_entry() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();

        loader.put("com.foo", 2, 1);
        registry.handle_installed("com.foo").await;
        loader.put("com.foo", 3, 2);
        registry.handle_installed("com.foo").await;

        assert_eq!(registry.catalogs().len(), 2);
        assert!(registry.get(2).is_none());
        assert_eq!(registry.get(3).unwrap().pkg_name(), Some("com.foo"));
    }

    #[tokio::test]
    async fn test_startup_deduplicates_and_orders_bundled_first() {
        let loader = Arc::new(FakeLoader {
            startup: vec![
                installed("com.a", 10, 1),
                bundled(1),
                installed("com.b", 10, 2),
                installed("com.c", 11, 1),
            ],
            ..Default::default()
        });
        let registry = CatalogRegistry::load(loader).await.unwrap();

        let snapshot = registry.catalogs();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot[0].is_bundled());
        assert_eq!(registry.get(10).unwrap().pkg_name(), Some("com.b"));
    }

    #[tokio::test]
    async fn test_observer_sees_consistent_index() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        for i in 0..20 {
            loader.put(&format!("com.pkg{i}"), 100 + i, 1);
        }
        let bridge = InstallEventBridge::detached();
        let registry = CatalogRegistry::initialize(loader.clone(), &bridge)
            .await
            .unwrap();
        let mut rx = registry.observe();

        for i in 0..20 {
            bridge.dispatch(PackageEvent::added(format!("com.pkg{i}")));
        }

        loop {
            let snapshot = next_snapshot(&mut rx).await;
            for catalog in snapshot.iter() {
                assert!(registry.get(catalog.source_id()).is_some());
            }
            if snapshot.len() == 21 {
                break;
            }
        }
    }

    fn package_archive(root: &Path, pkg: &str, source_id: i64, code: i64) -> PathBuf {
        let dir = root.join(format!("src-{pkg}-{code}"));
        fs::create_dir_all(dir.join("assets")).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                r#"pkg = "{pkg}"
name = "Catalog {source_id}"
version = "1.{code}"
code = {code}
lang = "en"
source_id = {source_id}
"#
            ),
        )
        .unwrap();
        fs::write(dir.join("assets").join("icon.png"), format!("v{code}")).unwrap();
        let archive = root.join(format!("{pkg}-{code}.apk"));
        pack_directory(&dir, &archive).unwrap();
        archive
    }

    #[tokio::test]
    async fn test_package_directory_changes_reach_the_registry() {
        let temp_dir = TempDir::new().unwrap();
        let system_dir = temp_dir.path().join("system");
        let local_dir = temp_dir.path().join("local");
        let loader = Arc::new(DirectoryCatalogLoader::new(
            Vec::new(),
            system_dir.clone(),
            local_dir.clone(),
        ));
        let manager = DirectoryPackageManager::new(system_dir.clone());
        let bridge = InstallEventBridge::new(vec![system_dir, local_dir]);
        let registry = CatalogRegistry::initialize(loader, &bridge).await.unwrap();
        let mut rx = registry.observe();
        assert!(rx.borrow().is_empty());

        let v1 = package_archive(temp_dir.path(), "com.foo", 42, 1);
        assert!(manager.install(&v1, "com.foo").unwrap());
        while next_snapshot(&mut rx).await.is_empty() {}
        assert_eq!(registry.get(42).unwrap().as_installed().unwrap().version_code(), 1);

        // The catalog stays visible for the whole update
        let v2 = package_archive(temp_dir.path(), "com.foo", 42, 2);
        assert!(manager.install(&v2, "com.foo").unwrap());
        loop {
            let snapshot = next_snapshot(&mut rx).await;
            assert_eq!(snapshot.len(), 1);
            let version = snapshot[0].as_installed().unwrap().version_code();
            if version == 2 {
                break;
            }
        }

        assert!(manager.uninstall("com.foo").unwrap());
        while !next_snapshot(&mut rx).await.is_empty() {}
        assert!(registry.get(42).is_none());

        bridge.unregister();
    }

    #[tokio::test]
    async fn test_unregistered_bridge_stops_updates() {
        let loader = Arc::new(FakeLoader::with_bundled(1));
        loader.put("com.foo", 2, 1);
        let bridge = InstallEventBridge::detached();
        let registry = CatalogRegistry::load(loader.clone()).await.unwrap();
        let handle = registry.listen(&bridge).unwrap();

        bridge.unregister();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("event loop should stop")
            .unwrap();

        bridge.dispatch(PackageEvent::added("com.foo"));
        assert_eq!(registry.catalogs().len(), 1);
    }
}
