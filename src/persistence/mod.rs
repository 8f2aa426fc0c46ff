//! Snapshot persistence and reload recovery.

pub mod manager;
pub mod snapshot;
pub mod sqlite;
pub mod store;

pub use manager::{PersistenceManager, Recovery};
pub use snapshot::PersistedSnapshot;
pub use sqlite::SqliteStore;
pub use store::{KeyValueStore, MemoryStore};

use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::error::Result;

/// Store selected by configuration: SQLite when a path is set, memory
/// otherwise.
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn KeyValueStore>> {
    match &config.db_path {
        Some(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
