//! Bridge from package-manager notifications to an [`InstallListener`].
//!
//! The package manager in this crate is directory based, so the OS-level
//! event source is a `notify` watcher on the package directories. A direct
//! child directory appearing means a package was added, one disappearing
//! means it was removed. A package's manifest being written or moved into
//! place means the package was updated in place, reported as added.
//! Delivery is at-most-once, with no retry or buffering.

use anyhow::{Context, Result};
use notify::event::{DataChange, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::catalog::manifest::{MANIFEST_FILE, is_valid_pkg_name};

/// Receives package lifecycle notifications.
pub trait InstallListener: Send + Sync {
    fn on_installed(&self, pkg_name: &str);
    fn on_uninstalled(&self, pkg_name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageAction {
    Added,
    Removed,
}

/// A raw package event. The package name may be missing from the payload,
/// in which case the event is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEvent {
    pub action: PackageAction,
    pub pkg_name: Option<String>,
}

impl PackageEvent {
    pub fn added(pkg_name: impl Into<String>) -> Self {
        Self {
            action: PackageAction::Added,
            pkg_name: Some(pkg_name.into()),
        }
    }

    pub fn removed(pkg_name: impl Into<String>) -> Self {
        Self {
            action: PackageAction::Removed,
            pkg_name: Some(pkg_name.into()),
        }
    }
}

type SharedListener = Arc<Mutex<Option<Arc<dyn InstallListener>>>>;

/// Adapter turning package directory changes into listener calls.
pub struct InstallEventBridge {
    watched_dirs: Vec<PathBuf>,
    listener: SharedListener,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl InstallEventBridge {
    /// Bridge that watches the given package directories once registered.
    pub fn new(watched_dirs: Vec<PathBuf>) -> Self {
        Self {
            watched_dirs,
            listener: Arc::new(Mutex::new(None)),
            watcher: Mutex::new(None),
        }
    }

    /// Bridge without an OS subscription. Events reach the listener only
    /// through [`InstallEventBridge::dispatch`].
    pub fn detached() -> Self {
        Self::new(Vec::new())
    }

    /// Store the listener and subscribe to package directory changes.
    ///
    /// Registering again replaces the previous listener and subscription.
    pub fn register(&self, listener: Arc<dyn InstallListener>) -> Result<()> {
        self.unregister();
        set_listener(&self.listener, Some(listener));

        if self.watched_dirs.is_empty() {
            return Ok(());
        }

        // notify may report canonical paths, so match against both forms
        let mut roots = Vec::new();
        for dir in &self.watched_dirs {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create packages directory: {:?}", dir))?;
            roots.push(dir.clone());
            if let Ok(canonical) = dir.canonicalize()
                && canonical != *dir
            {
                roots.push(canonical);
            }
        }

        let shared = Arc::clone(&self.listener);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for package_event in translate_fs_event(&event, &roots) {
                        deliver(&shared, package_event);
                    }
                }
                Err(e) => tracing::warn!("Package watcher error: {}", e),
            },
            Config::default(),
        )
        .context("Failed to create package watcher")?;

        // Recursive so in-place updates of a package's manifest are seen
        for dir in &self.watched_dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            tracing::debug!(dir = ?dir, "Watching packages directory");
        }

        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }
        Ok(())
    }

    /// Clear the listener and drop the OS subscription.
    pub fn unregister(&self) {
        if let Ok(mut slot) = self.watcher.lock() {
            slot.take();
        }
        set_listener(&self.listener, None);
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    /// Deliver an event to the registered listener, if any.
    pub fn dispatch(&self, event: PackageEvent) {
        deliver(&self.listener, event);
    }
}

impl Drop for InstallEventBridge {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn set_listener(shared: &SharedListener, listener: Option<Arc<dyn InstallListener>>) {
    match shared.lock() {
        Ok(mut slot) => *slot = listener,
        Err(poisoned) => *poisoned.into_inner() = listener,
    }
}

fn deliver(shared: &SharedListener, event: PackageEvent) {
    let Some(pkg_name) = event.pkg_name else {
        tracing::debug!(action = ?event.action, "Dropping package event without package name");
        return;
    };

    // Clone out so the listener runs without the lock held
    let listener = match shared.lock() {
        Ok(slot) => slot.clone(),
        Err(_) => return,
    };
    let Some(listener) = listener else {
        return;
    };

    match event.action {
        PackageAction::Added => listener.on_installed(&pkg_name),
        PackageAction::Removed => listener.on_uninstalled(&pkg_name),
    }
}

/// Map a filesystem event to package events.
///
/// Direct children of a watched root are packages. Below that, only a
/// package's manifest appearing or being rewritten counts, as an update of
/// that package. Everything else is a file inside a package and is ignored.
pub fn translate_fs_event(event: &Event, roots: &[PathBuf]) -> Vec<PackageEvent> {
    let rewrites_content = matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Data(DataChange::Any | DataChange::Content))
    );
    let action_for = |index: usize| -> Option<PackageAction> {
        match event.kind {
            EventKind::Create(_) => Some(PackageAction::Added),
            EventKind::Remove(_) => Some(PackageAction::Removed),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(PackageAction::Added),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(PackageAction::Removed),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(if index == 0 {
                PackageAction::Removed
            } else {
                PackageAction::Added
            }),
            _ if rewrites_content => Some(PackageAction::Added),
            _ => None,
        }
    };

    event
        .paths
        .iter()
        .enumerate()
        .filter_map(|(index, path)| {
            let action = action_for(index)?;
            let pkg_name = match classify(path, roots)? {
                PathRole::Package(name) if !rewrites_content => Some(name),
                PathRole::Manifest(name) if action == PackageAction::Added => Some(name),
                // A manifest going away mid-update is not an uninstall
                PathRole::Manifest(_) => return None,
                _ => None,
            };
            Some(PackageEvent { action, pkg_name })
        })
        .collect()
}

enum PathRole {
    /// `<root>/<pkg>`
    Package(String),
    /// `<root>/<pkg>/package.toml`
    Manifest(String),
    /// A hidden or invalid name at either level
    Unnamed,
}

/// Place of `path` relative to the watched roots. `None` for anything that
/// is neither a package directory nor a package manifest.
fn classify(path: &Path, roots: &[PathBuf]) -> Option<PathRole> {
    let is_root = |dir: &Path| roots.iter().any(|root| root == dir);
    let parent = path.parent()?;

    let (package_dir, manifest) = if is_root(parent) {
        (path, false)
    } else if path.file_name()? == MANIFEST_FILE && parent.parent().is_some_and(is_root) {
        (parent, true)
    } else {
        return None;
    };

    let name = package_dir.file_name()?.to_str().unwrap_or_default();
    // Staging directories and editor droppings are not packages
    if name.starts_with('.') || !is_valid_pkg_name(name) {
        return Some(PathRole::Unnamed);
    }
    let name = name.to_string();
    Some(if manifest {
        PathRole::Manifest(name)
    } else {
        PathRole::Package(name)
    })
}
