//! Local versus remote comparisons.

use std::collections::{HashMap, HashSet};

use crate::catalog::model::{Catalog, CatalogInstalled, CatalogLocal, CatalogRemote};

/// An installed catalog with a newer version available remotely.
#[derive(Debug, Clone)]
pub struct CatalogUpdate {
    pub installed: CatalogInstalled,
    pub available: CatalogRemote,
}

/// Installed catalogs whose remote counterpart (matched by package name)
/// carries a greater version code.
pub fn find_updates(local: &[CatalogLocal], remote: &[CatalogRemote]) -> Vec<CatalogUpdate> {
    let by_pkg: HashMap<&str, &CatalogRemote> =
        remote.iter().map(|r| (r.pkg_name.as_str(), r)).collect();

    local
        .iter()
        .filter_map(CatalogLocal::as_installed)
        .filter_map(|installed| {
            let available = by_pkg.get(installed.pkg_name())?;
            (available.version_code > installed.version_code()).then(|| CatalogUpdate {
                installed: installed.clone(),
                available: (*available).clone(),
            })
        })
        .collect()
}

/// Remote catalogs whose source is not available locally.
pub fn find_installable(local: &[CatalogLocal], remote: &[CatalogRemote]) -> Vec<CatalogRemote> {
    let present: HashSet<i64> = local.iter().map(|c| c.source_id()).collect();
    remote
        .iter()
        .filter(|r| !present.contains(&r.source_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{CatalogBundled, InstalledPackage, StaticSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn installed(pkg: &str, source_id: i64, code: i64) -> CatalogLocal {
        CatalogLocal::Installed(CatalogInstalled::SystemWide(InstalledPackage {
            name: pkg.to_string(),
            description: String::new(),
            pkg_name: pkg.to_string(),
            version_name: format!("1.{code}"),
            version_code: code,
            source: Arc::new(StaticSource::new(source_id, pkg, "en")),
        }))
    }

    fn remote(pkg: &str, source_id: i64, code: i64) -> CatalogRemote {
        CatalogRemote {
            name: pkg.to_string(),
            description: String::new(),
            source_id,
            pkg_name: pkg.to_string(),
            version_name: format!("1.{code}"),
            version_code: code,
            lang: "en".to_string(),
            pkg_url: format!("https://repo.test/apk/{pkg}.apk"),
            icon_url: format!("https://repo.test/icon/{pkg}.png"),
            nsfw: false,
        }
    }

    #[test]
    fn test_find_updates_only_newer_versions() {
        let local = vec![
            installed("com.a", 1, 1),
            installed("com.b", 2, 5),
            installed("com.c", 3, 1),
        ];
        let remotes = vec![remote("com.a", 1, 2), remote("com.b", 2, 5)];

        let updates = find_updates(&local, &remotes);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].installed.pkg_name(), "com.a");
        assert_eq!(updates[0].available.version_code, 2);
    }

    #[test]
    fn test_find_installable_skips_present_sources() {
        let bundled = CatalogLocal::Bundled(CatalogBundled::new(
            "",
            Arc::new(StaticSource::new(0, "Local source", "all")),
        ));
        let local = vec![bundled, installed("com.a", 1, 1)];
        let remotes = vec![remote("com.a", 1, 1), remote("com.b", 2, 1), remote("com.zero", 0, 1)];

        let installable = find_installable(&local, &remotes);
        assert_eq!(installable, vec![remote("com.b", 2, 1)]);
    }
}
