pub mod database;

pub use database::{CatalogDatabase, RemoteCatalogStore};
