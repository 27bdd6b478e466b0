//! File-backed index driver.
//!
//! Layout: `{root}/{driver}/{db}/{table}/{index_id}/` holding `meta.json`
//! and `entries.jsonl` (one key/locator pair per line). Saves write into a
//! temporary sibling directory and rename it into place, so an index is
//! either fully stored or absent after a crash.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Index, IndexDriver, IndexError, IndexMeta, IndexResult, KeyValuePair, LocatorIter};
use crate::executor::ExecuteResult;
use crate::sql::Value;

pub const DRIVER_ID: &str = "disk";

const META_FILE: &str = "meta.json";
const ENTRIES_FILE: &str = "entries.jsonl";

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: Vec<Value>,
    locator: Vec<u8>,
}

pub struct DiskIndexDriver {
    root: PathBuf,
}

impl DiskIndexDriver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join(DRIVER_ID),
        }
    }

    fn index_dir(&self, db: &str, table: &str, id: &str) -> PathBuf {
        self.root.join(db).join(table).join(id)
    }
}

impl IndexDriver for DiskIndexDriver {
    fn id(&self) -> &'static str {
        DRIVER_ID
    }

    fn save(
        &self,
        meta: &IndexMeta,
        pairs: &mut dyn Iterator<Item = ExecuteResult<KeyValuePair>>,
    ) -> IndexResult<()> {
        let final_dir = self.index_dir(&meta.db, &meta.table, &meta.id);
        if final_dir.exists() {
            return Err(IndexError::AlreadyExists {
                db: meta.db.clone(),
                table: meta.table.clone(),
                id: meta.id.clone(),
            });
        }

        let tmp_dir = final_dir.with_extension(format!("tmp-{}", ulid::Ulid::new()));
        fs::create_dir_all(&tmp_dir)?;

        let result = (|| -> IndexResult<()> {
            let meta_json = serde_json::to_vec_pretty(meta)?;
            fs::write(tmp_dir.join(META_FILE), meta_json)?;

            let file = fs::File::create(tmp_dir.join(ENTRIES_FILE))?;
            let mut writer = BufWriter::new(file);
            // Duplicate (value, locator) pairs keep at most one.
            let mut seen: std::collections::HashSet<(Vec<u8>, Vec<u8>)> = Default::default();
            for pair in pairs {
                let (key, locator) = pair.map_err(|e| IndexError::Build(e.to_string()))?;
                let dedup_key = (Value::encode_tuple(&key), locator.clone());
                if !seen.insert(dedup_key) {
                    continue;
                }
                let line = serde_json::to_string(&DiskEntry { key, locator })?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&tmp_dir);
            return Err(e);
        }

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        Ok(())
    }

    fn load(&self, db: &str, table: &str, id: &str) -> IndexResult<Arc<dyn Index>> {
        let dir = self.index_dir(db, table, id);
        if !dir.join(META_FILE).is_file() {
            return Err(IndexError::NotFound {
                db: db.to_string(),
                table: table.to_string(),
                id: id.to_string(),
            });
        }

        let meta: IndexMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)?;

        let mut entries: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
        let file = fs::File::open(dir.join(ENTRIES_FILE))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry: DiskEntry = serde_json::from_str(&line)?;
            let locators = entries.entry(Value::encode_tuple(&entry.key)).or_default();
            if !locators.contains(&entry.locator) {
                locators.push(entry.locator);
            }
        }

        Ok(Arc::new(DiskIndex { meta, entries }))
    }

    fn delete(&self, db: &str, table: &str, id: &str) -> IndexResult<()> {
        let dir = self.index_dir(db, table, id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn list(&self, db: &str) -> IndexResult<Vec<IndexMeta>> {
        let db_dir = self.root.join(db);
        let mut out = Vec::new();
        if !db_dir.is_dir() {
            return Ok(out);
        }
        for table_entry in fs::read_dir(&db_dir)? {
            let table_dir = table_entry?.path();
            if !table_dir.is_dir() {
                continue;
            }
            for index_entry in fs::read_dir(&table_dir)? {
                let index_dir = index_entry?.path();
                // Half-written saves carry a .tmp-<id> extension and are
                // invisible to listing.
                let is_tmp = index_dir
                    .extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.starts_with("tmp-"));
                if is_tmp || !index_dir.join(META_FILE).is_file() {
                    continue;
                }
                let meta: IndexMeta = serde_json::from_slice(&fs::read(index_dir.join(META_FILE))?)?;
                out.push(meta);
            }
        }
        Ok(out)
    }
}

/// An index fully loaded into memory as an equality map.
struct DiskIndex {
    meta: IndexMeta,
    entries: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl Index for DiskIndex {
    fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    fn values(&self, key: &[Value]) -> IndexResult<LocatorIter> {
        let encoded = Value::encode_tuple(key);
        Ok(LocatorIter::new(
            self.entries.get(&encoded).cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair(key: &str, locator: &[u8]) -> ExecuteResult<KeyValuePair> {
        Ok((vec![Value::text(key)], locator.to_vec()))
    }

    fn sample_meta() -> IndexMeta {
        IndexMeta::new("gitql", "refs", "refs_idx", vec!["ref_name".into()], DRIVER_ID)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let driver = DiskIndexDriver::new(dir.path());

        let mut pairs = vec![
            pair("HEAD", b"loc-head"),
            pair("refs/heads/master", b"loc-master"),
            pair("HEAD", b"loc-head"), // duplicate collapses
        ]
        .into_iter();
        driver.save(&sample_meta(), &mut pairs).unwrap();

        let index = driver.load("gitql", "refs", "refs_idx").unwrap();
        let locators: Vec<Vec<u8>> = index.values(&[Value::text("HEAD")]).unwrap().collect();
        assert_eq!(locators, vec![b"loc-head".to_vec()]);

        let empty: Vec<Vec<u8>> = index.values(&[Value::text("missing")]).unwrap().collect();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_save_twice_fails() {
        let dir = TempDir::new().unwrap();
        let driver = DiskIndexDriver::new(dir.path());

        driver.save(&sample_meta(), &mut vec![pair("a", b"1")].into_iter()).unwrap();
        let err = driver.save(&sample_meta(), &mut vec![pair("a", b"1")].into_iter());
        assert!(matches!(err, Err(IndexError::AlreadyExists { .. })));
    }

    #[test]
    fn test_failed_build_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let driver = DiskIndexDriver::new(dir.path());

        let mut pairs = vec![
            pair("a", b"1"),
            Err(crate::executor::ExecuteError::Internal("boom".into())),
        ]
        .into_iter();
        assert!(driver.save(&sample_meta(), &mut pairs).is_err());

        assert!(matches!(
            driver.load("gitql", "refs", "refs_idx"),
            Err(IndexError::NotFound { .. })
        ));
        assert!(driver.list("gitql").unwrap().is_empty());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let driver = DiskIndexDriver::new(dir.path());

        driver.save(&sample_meta(), &mut vec![pair("a", b"1")].into_iter()).unwrap();
        let listed = driver.list("gitql").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "refs_idx");

        driver.delete("gitql", "refs", "refs_idx").unwrap();
        assert!(driver.list("gitql").unwrap().is_empty());
    }

    #[test]
    fn test_registry_roundtrip() {
        let dir = TempDir::new().unwrap();
        let registry = super::super::IndexRegistry::new(dir.path());

        let meta = sample_meta();
        registry
            .create(meta.clone(), &mut vec![pair("HEAD", b"loc")].into_iter())
            .unwrap();

        assert!(registry.get("gitql", "refs", "refs_idx").is_some());
        assert!(registry
            .find("gitql", "refs", &["ref_name".to_string()])
            .is_some());

        // A fresh registry over the same directory reloads from disk.
        let registry2 = super::super::IndexRegistry::new(dir.path());
        registry2.load_all("gitql");
        assert!(registry2.get("gitql", "refs", "refs_idx").is_some());

        registry.delete("gitql", "refs", "refs_idx").unwrap();
        assert!(registry.get("gitql", "refs", "refs_idx").is_none());
    }
}
