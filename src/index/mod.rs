//! Index subsystem.
//!
//! An `IndexDriver` builds persistent indexes by draining a table's
//! key/value iterator (value tuple plus an opaque row locator) and later
//! answers equality lookups with the locators that match. The locator
//! encoding belongs to the originating table; drivers treat it as bytes.

mod disk;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::ExecuteResult;
use crate::sql::Value;

pub use disk::DiskIndexDriver;

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unknown index driver: {0}")]
    UnknownDriver(String),

    #[error("index not found: {db}/{table}/{id}")]
    NotFound { db: String, table: String, id: String },

    #[error("index already exists: {db}/{table}/{id}")]
    AlreadyExists { db: String, table: String, id: String },

    #[error("index build failed: {0}")]
    Build(String),
}

/// A (value tuple, locator) pair drained from a table while building.
pub type KeyValuePair = (Vec<Value>, Vec<u8>);

/// Descriptor persisted with every index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub db: String,
    pub table: String,
    pub id: String,
    pub columns: Vec<String>,
    pub expression_hashes: Vec<String>,
    pub driver: String,
}

impl IndexMeta {
    pub fn new(db: &str, table: &str, id: &str, columns: Vec<String>, driver: &str) -> Self {
        let expression_hashes = columns
            .iter()
            .map(|c| expression_hash(table, c))
            .collect();
        Self {
            db: db.to_string(),
            table: table.to_string(),
            id: id.to_string(),
            columns,
            expression_hashes,
            driver: driver.to_string(),
        }
    }
}

/// Stable hash for an indexed column expression.
pub fn expression_hash(table: &str, column: &str) -> String {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    column.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Iterator over the locators matching one key lookup.
pub struct LocatorIter {
    locators: std::vec::IntoIter<Vec<u8>>,
}

impl LocatorIter {
    pub fn new(locators: Vec<Vec<u8>>) -> Self {
        Self {
            locators: locators.into_iter(),
        }
    }

    pub fn next_locator(&mut self) -> Option<Vec<u8>> {
        self.locators.next()
    }
}

impl Iterator for LocatorIter {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.locators.next()
    }
}

/// A materialized, queryable index.
pub trait Index: Send + Sync {
    fn meta(&self) -> &IndexMeta;

    /// All locators whose value tuple equals `key`.
    fn values(&self, key: &[Value]) -> IndexResult<LocatorIter>;
}

/// A pluggable index storage backend.
pub trait IndexDriver: Send + Sync {
    /// Driver name, used in `CREATE INDEX ... USING <driver>`.
    fn id(&self) -> &'static str;

    /// Persist an index by draining the pairs. Must be atomic: on return
    /// the index is fully stored, on error nothing is visible. Duplicate
    /// (value, locator) pairs collapse to one.
    fn save(
        &self,
        meta: &IndexMeta,
        pairs: &mut dyn Iterator<Item = ExecuteResult<KeyValuePair>>,
    ) -> IndexResult<()>;

    fn load(&self, db: &str, table: &str, id: &str) -> IndexResult<Arc<dyn Index>>;

    fn delete(&self, db: &str, table: &str, id: &str) -> IndexResult<()>;

    /// Metadata of every stored index for a database.
    fn list(&self, db: &str) -> IndexResult<Vec<IndexMeta>>;
}

/// Registry of drivers plus loaded indexes. Index creation is serialized;
/// readers get snapshot handles and never block behind a writer.
pub struct IndexRegistry {
    drivers: HashMap<String, Arc<dyn IndexDriver>>,
    loaded: RwLock<HashMap<(String, String, String), Arc<dyn Index>>>,
    create_lock: Mutex<()>,
    default_driver: String,
}

impl IndexRegistry {
    /// A registry with the disk driver rooted at `index_dir`.
    pub fn new(index_dir: impl AsRef<Path>) -> Self {
        let disk: Arc<dyn IndexDriver> = Arc::new(DiskIndexDriver::new(index_dir));
        let default_driver = disk.id().to_string();
        let mut drivers = HashMap::new();
        drivers.insert(default_driver.clone(), disk);
        Self {
            drivers,
            loaded: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            default_driver,
        }
    }

    pub fn default_driver(&self) -> &str {
        &self.default_driver
    }

    fn driver(&self, name: &str) -> IndexResult<&Arc<dyn IndexDriver>> {
        self.drivers
            .get(name)
            .ok_or_else(|| IndexError::UnknownDriver(name.to_string()))
    }

    /// Build and register an index from a table's key/value iterator.
    pub fn create(
        &self,
        meta: IndexMeta,
        pairs: &mut dyn Iterator<Item = ExecuteResult<KeyValuePair>>,
    ) -> IndexResult<()> {
        let _guard = self.create_lock.lock();
        let key = (meta.db.clone(), meta.table.clone(), meta.id.clone());
        if self.loaded.read().contains_key(&key) {
            return Err(IndexError::AlreadyExists {
                db: meta.db,
                table: meta.table,
                id: meta.id,
            });
        }

        let driver = self.driver(&meta.driver)?;
        driver.save(&meta, pairs)?;
        let index = driver.load(&meta.db, &meta.table, &meta.id)?;
        self.loaded.write().insert(key, index);
        Ok(())
    }

    pub fn delete(&self, db: &str, table: &str, id: &str) -> IndexResult<()> {
        let _guard = self.create_lock.lock();
        let key = (db.to_string(), table.to_string(), id.to_string());
        let removed = self.loaded.write().remove(&key);
        let driver_name = match &removed {
            Some(index) => index.meta().driver.clone(),
            None => self.default_driver.clone(),
        };
        self.driver(&driver_name)?.delete(db, table, id)?;
        if removed.is_none() {
            return Err(IndexError::NotFound {
                db: db.to_string(),
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, db: &str, table: &str, id: &str) -> Option<Arc<dyn Index>> {
        self.loaded
            .read()
            .get(&(db.to_string(), table.to_string(), id.to_string()))
            .cloned()
    }

    /// Find a loaded index over exactly the given column list.
    pub fn find(&self, db: &str, table: &str, columns: &[String]) -> Option<Arc<dyn Index>> {
        self.loaded
            .read()
            .values()
            .find(|index| {
                let m = index.meta();
                m.db == db && m.table == table && m.columns == columns
            })
            .cloned()
    }

    pub fn list(&self, db: &str) -> Vec<IndexMeta> {
        let mut out: Vec<IndexMeta> = self
            .loaded
            .read()
            .values()
            .filter(|i| i.meta().db == db)
            .map(|i| i.meta().clone())
            .collect();
        out.sort_by(|a, b| (&a.table, &a.id).cmp(&(&b.table, &b.id)));
        out
    }

    /// Load every index the drivers have persisted for a database. Indexes
    /// that fail to load are treated as absent.
    pub fn load_all(&self, db: &str) {
        for driver in self.drivers.values() {
            let metas = match driver.list(db) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(driver = driver.id(), error = %e, "listing indexes failed");
                    continue;
                }
            };
            for meta in metas {
                match driver.load(&meta.db, &meta.table, &meta.id) {
                    Ok(index) => {
                        self.loaded.write().insert(
                            (meta.db.clone(), meta.table.clone(), meta.id.clone()),
                            index,
                        );
                    }
                    Err(e) => {
                        tracing::warn!(index = %meta.id, error = %e, "loading index failed");
                    }
                }
            }
        }
    }
}
