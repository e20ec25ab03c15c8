pub mod events;
pub mod installer;
pub mod loader;
pub mod manifest;
pub mod model;
pub mod package;
pub mod registry;
pub mod remote;
pub mod updates;

pub use events::{InstallEventBridge, InstallListener, PackageAction, PackageEvent};
pub use installer::{InstallStep, InstallSteps, Installer};
pub use loader::{CatalogLoader, DirectoryCatalogLoader, InstallKind, LoadError, LoadErrorKind};
pub use manifest::PackageManifest;
pub use model::{
    Catalog, CatalogBundled, CatalogInstalled, CatalogLocal, CatalogRemote, InstalledPackage,
    Source, StaticSource,
};
pub use package::{DirectoryPackageManager, PackageInstaller};
pub use registry::{CatalogRegistry, CatalogSnapshot};
pub use remote::{MIN_REFRESH_INTERVAL, RemoteCatalogCache, RemoteSnapshot};
pub use updates::{CatalogUpdate, find_installable, find_updates};
