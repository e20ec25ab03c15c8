use crate::catalog::model::CatalogRemote;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Persistence for the remote catalog list.
///
/// `replace_all` must be atomic: readers see either the old or the new set,
/// never a mix.
pub trait RemoteCatalogStore: Send + Sync {
    fn find_all(&self) -> Result<Vec<CatalogRemote>>;
    fn replace_all(&self, catalogs: &[CatalogRemote]) -> Result<()>;
}

/// SQLite-backed catalog store.
pub struct CatalogDatabase {
    conn: Mutex<Connection>,
}

impl CatalogDatabase {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {db_path:?}"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn init_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS remote_catalogs (
            source_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            pkg_name TEXT NOT NULL,
            version_name TEXT NOT NULL,
            version_code INTEGER NOT NULL,
            lang TEXT NOT NULL,
            pkg_url TEXT NOT NULL,
            icon_url TEXT NOT NULL,
            nsfw INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )
    .context("Failed to create remote_catalogs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_remote_catalogs_lang_name ON remote_catalogs(lang, name)",
        [],
    )
    .context("Failed to create remote_catalogs index")?;

    Ok(())
}

fn catalog_from_row(row: &rusqlite::Row) -> rusqlite::Result<CatalogRemote> {
    let nsfw: i32 = row.get(9)?;
    Ok(CatalogRemote {
        source_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        pkg_name: row.get(3)?,
        version_name: row.get(4)?,
        version_code: row.get(5)?,
        lang: row.get(6)?,
        pkg_url: row.get(7)?,
        icon_url: row.get(8)?,
        nsfw: nsfw != 0,
    })
}

impl RemoteCatalogStore for CatalogDatabase {
    fn find_all(&self) -> Result<Vec<CatalogRemote>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source_id, name, description, pkg_name, version_name, version_code,
                    lang, pkg_url, icon_url, nsfw
             FROM remote_catalogs ORDER BY lang, name",
        )?;

        let rows = stmt.query_map([], catalog_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn replace_all(&self, catalogs: &[CatalogRemote]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to start catalog transaction")?;

        tx.execute("DELETE FROM remote_catalogs", [])?;

        {
            // A repeated source_id in one listing keeps the last entry
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO remote_catalogs
                    (source_id, name, description, pkg_name, version_name, version_code,
                     lang, pkg_url, icon_url, nsfw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            for catalog in catalogs {
                let nsfw_int: i32 = if catalog.nsfw { 1 } else { 0 };
                stmt.execute(params![
                    catalog.source_id,
                    catalog.name,
                    catalog.description,
                    catalog.pkg_name,
                    catalog.version_name,
                    catalog.version_code,
                    catalog.lang,
                    catalog.pkg_url,
                    catalog.icon_url,
                    nsfw_int,
                ])?;
            }
        }

        tx.commit().context("Failed to commit catalog transaction")?;
        tracing::debug!(count = catalogs.len(), "Persisted remote catalogs");
        Ok(())
    }
}
