//! The repository pool.
//!
//! A pool is a named collection of repositories shared by every session.
//! Repositories are registered at startup; iterators open fresh handles on
//! demand (libgit2 handles are not shareable across threads) while decoded
//! objects land in the pool-wide cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::cache::{ObjectCache, DEFAULT_CACHE_BYTES};
use super::errors::{StorageError, StorageResult};
use super::repository::Repository;

#[derive(Debug, Clone)]
struct RepoSpec {
    id: String,
    path: PathBuf,
}

/// Shared, read-only collection of repositories.
pub struct RepositoryPool {
    repos: RwLock<BTreeMap<String, RepoSpec>>,
    cache: Arc<ObjectCache>,
}

impl Default for RepositoryPool {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BYTES)
    }
}

impl RepositoryPool {
    pub fn new(cache_bytes: usize) -> Self {
        Self {
            repos: RwLock::new(BTreeMap::new()),
            cache: Arc::new(ObjectCache::new(cache_bytes)),
        }
    }

    /// Register a single repository. The repository id is its path. Returns
    /// the id, or an error when the path is not a git repository.
    pub fn add_repository(&self, path: impl AsRef<Path>) -> StorageResult<String> {
        let path = path.as_ref();
        if !is_git_dir(path) {
            return Err(StorageError::NotARepository(path.to_path_buf()));
        }
        let id = path.display().to_string();
        self.repos.write().insert(
            id.clone(),
            RepoSpec {
                id: id.clone(),
                path: path.to_path_buf(),
            },
        );
        Ok(id)
    }

    /// Scan a directory and register every git repository directly under it.
    /// The directory itself is registered when it is a repository. Returns
    /// the number of repositories added.
    pub fn add_directory(&self, dir: impl AsRef<Path>) -> StorageResult<usize> {
        let dir = dir.as_ref();
        if is_git_dir(dir) {
            self.add_repository(dir)?;
            return Ok(1);
        }

        let mut added = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && is_git_dir(&path) {
                self.add_repository(&path)?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// Ids of every pooled repository, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.repos.read().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.repos.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.repos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.read().is_empty()
    }

    /// Open a fresh handle for a pooled repository.
    pub fn open(&self, id: &str) -> StorageResult<Repository> {
        let spec = self
            .repos
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::RepositoryNotFound(id.to_string()))?;
        Repository::open(&spec.id, &spec.path, self.cache.clone())
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }
}

/// A directory is a repository when it has a `.git` subdirectory or looks
/// like a bare repository (HEAD plus an objects directory).
fn is_git_dir(path: &Path) -> bool {
    path.join(".git").exists() || (path.join("HEAD").is_file() && path.join("objects").is_dir())
}
