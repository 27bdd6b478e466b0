//! Read-only git repository wrapper.
//!
//! This wraps `git2::Repository` behind an API that returns owned data, so
//! row iterators can hold cursor state without borrowing from libgit2
//! objects. All other storage modules and the virtual tables use this for
//! git access.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use git2::{ErrorCode, ObjectType, Oid};

use super::cache::{CachedObject, ObjectCache};
use super::errors::{StorageError, StorageResult};

/// A reference row: name plus the hash of the commit it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefInfo {
    pub name: String,
    pub hash: String,
}

/// One remote refspec pairing. A remote with several refspecs produces one
/// of these per position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub name: String,
    pub push_url: String,
    pub fetch_url: String,
    pub push_refspec: String,
    pub fetch_refspec: String,
}

/// Decoded commit, cached across iterators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitData {
    pub hash: String,
    pub tree_hash: String,
    pub parents: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub author_when: DateTime<Utc>,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_when: DateTime<Utc>,
    pub message: String,
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntryData {
    pub name: String,
    pub hash: String,
    /// Raw git filemode (e.g. 0o100644, 0o40000 for trees).
    pub mode: i32,
    pub is_tree: bool,
    /// Submodule entries point at a commit in another repository.
    pub is_submodule: bool,
}

impl TreeEntryData {
    /// Octal rendering of the mode. Leading zeros are not padded, matching
    /// the behavior clients of the original system rely on.
    pub fn mode_octal(&self) -> String {
        format!("{:o}", self.mode)
    }
}

/// Blob metadata plus (optionally truncated) content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobData {
    pub hash: String,
    pub size: i64,
    pub content: Vec<u8>,
}

/// An open repository handle. Not shareable across threads; each iterator
/// opens its own handle through the pool, while decoded objects are shared
/// via the pool-wide cache.
pub struct Repository {
    id: String,
    inner: git2::Repository,
    cache: Arc<ObjectCache>,
}

impl Repository {
    pub(crate) fn open(id: &str, path: &Path, cache: Arc<ObjectCache>) -> StorageResult<Self> {
        let inner = git2::Repository::open(path)
            .map_err(|_| StorageError::NotARepository(path.to_path_buf()))?;
        Ok(Self {
            id: id.to_string(),
            inner,
            cache,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn parse_oid(&self, hash: &str) -> StorageResult<Oid> {
        Oid::from_str(hash).map_err(|_| StorageError::InvalidHash(hash.to_string()))
    }

    fn not_found(&self, hash: &str) -> StorageError {
        StorageError::ObjectNotFound {
            repository: self.id.clone(),
            hash: hash.to_string(),
        }
    }

    // ==================== References & remotes ====================

    /// All references of the repository: a HEAD row first, then concrete
    /// refs in name order. References that do not peel to a commit (e.g.
    /// tag objects pointing elsewhere) are skipped.
    pub fn ref_infos(&self) -> StorageResult<Vec<RefInfo>> {
        let mut out = Vec::new();

        if let Ok(head) = self.inner.head() {
            if let Ok(commit) = head.peel_to_commit() {
                out.push(RefInfo {
                    name: "HEAD".to_string(),
                    hash: commit.id().to_string(),
                });
            }
        }

        let mut named = Vec::new();
        for reference in self.inner.references()? {
            let reference = match reference {
                Ok(r) => r,
                Err(_) => continue,
            };
            let name = match reference.name() {
                Some(n) if n != "HEAD" => n.to_string(),
                _ => continue,
            };
            if let Ok(commit) = reference.peel_to_commit() {
                named.push(RefInfo {
                    name,
                    hash: commit.id().to_string(),
                });
            }
        }
        named.sort_by(|a, b| a.name.cmp(&b.name));
        out.extend(named);
        Ok(out)
    }

    /// Remote rows, one per refspec position per remote.
    pub fn remote_infos(&self) -> StorageResult<Vec<RemoteInfo>> {
        let names = self.inner.remotes()?;
        let mut out = Vec::new();
        for name in names.iter().flatten() {
            let remote = self.inner.find_remote(name)?;
            let fetch_url = remote.url().unwrap_or("").to_string();
            let push_url = remote.pushurl().unwrap_or(&fetch_url).to_string();
            let fetch_specs: Vec<String> = remote
                .fetch_refspecs()?
                .iter()
                .flatten()
                .map(str::to_string)
                .collect();
            let push_specs: Vec<String> = remote
                .push_refspecs()?
                .iter()
                .flatten()
                .map(str::to_string)
                .collect();

            let rows = fetch_specs.len().max(push_specs.len()).max(1);
            for i in 0..rows {
                out.push(RemoteInfo {
                    name: name.to_string(),
                    push_url: push_url.clone(),
                    fetch_url: fetch_url.clone(),
                    push_refspec: push_specs.get(i).cloned().unwrap_or_default(),
                    fetch_refspec: fetch_specs.get(i).cloned().unwrap_or_default(),
                });
            }
        }
        Ok(out)
    }

    // ==================== Object enumeration ====================

    fn object_ids(&self, wanted: ObjectType) -> StorageResult<Vec<String>> {
        let odb = self.inner.odb()?;
        let mut all = Vec::new();
        odb.foreach(|oid| {
            all.push(*oid);
            true
        })?;

        let mut out = Vec::new();
        for oid in all {
            if let Ok((_, kind)) = odb.read_header(oid) {
                if kind == wanted {
                    out.push(oid.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Every commit object in the store, in hash order.
    pub fn commit_ids(&self) -> StorageResult<Vec<String>> {
        self.object_ids(ObjectType::Commit)
    }

    /// Every tree object in the store, in hash order.
    pub fn tree_ids(&self) -> StorageResult<Vec<String>> {
        self.object_ids(ObjectType::Tree)
    }

    /// Every blob object in the store, in hash order.
    pub fn blob_ids(&self) -> StorageResult<Vec<String>> {
        self.object_ids(ObjectType::Blob)
    }

    // ==================== Point lookups ====================

    /// Decode a commit, going through the pool cache.
    pub fn commit_data(&self, hash: &str) -> StorageResult<Arc<CommitData>> {
        if let Some(CachedObject::Commit(c)) = self.cache.get(&self.id, hash) {
            return Ok(c);
        }

        let oid = self.parse_oid(hash)?;
        let commit = self.inner.find_commit(oid).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                self.not_found(hash)
            } else {
                StorageError::Git(e)
            }
        })?;

        let author = commit.author();
        let committer = commit.committer();
        let data = Arc::new(CommitData {
            hash: commit.id().to_string(),
            tree_hash: commit.tree_id().to_string(),
            parents: commit.parent_ids().map(|p| p.to_string()).collect(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            author_when: git_time_to_utc(author.when()),
            committer_name: committer.name().unwrap_or("").to_string(),
            committer_email: committer.email().unwrap_or("").to_string(),
            committer_when: git_time_to_utc(committer.when()),
            message: commit.message().unwrap_or("").to_string(),
        });

        self.cache
            .put(&self.id, hash, CachedObject::Commit(data.clone()));
        Ok(data)
    }

    /// First parent of a commit, or None at a root.
    pub fn first_parent(&self, hash: &str) -> StorageResult<Option<String>> {
        Ok(self.commit_data(hash)?.parents.first().cloned())
    }

    /// Entries of a tree, going through the pool cache.
    pub fn tree_entry_list(&self, hash: &str) -> StorageResult<Arc<Vec<TreeEntryData>>> {
        if let Some(CachedObject::Tree(t)) = self.cache.get(&self.id, hash) {
            return Ok(t);
        }

        let oid = self.parse_oid(hash)?;
        let tree = self.inner.find_tree(oid).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                self.not_found(hash)
            } else {
                StorageError::Git(e)
            }
        })?;

        let entries: Vec<TreeEntryData> = tree
            .iter()
            .map(|entry| {
                let kind = entry.kind();
                TreeEntryData {
                    name: entry.name().unwrap_or("").to_string(),
                    hash: entry.id().to_string(),
                    mode: entry.filemode(),
                    is_tree: kind == Some(ObjectType::Tree),
                    is_submodule: kind == Some(ObjectType::Commit),
                }
            })
            .collect();

        let entries = Arc::new(entries);
        self.cache
            .put(&self.id, hash, CachedObject::Tree(entries.clone()));
        Ok(entries)
    }

    /// Blob size and content. Content larger than `max_content` bytes is not
    /// materialized (empty content, real size). Pass `false` to skip content
    /// reads entirely when a projection does not need them.
    pub fn blob_data(&self, hash: &str, want_content: bool, max_content: usize) -> StorageResult<BlobData> {
        let oid = self.parse_oid(hash)?;
        let blob = self.inner.find_blob(oid).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                self.not_found(hash)
            } else {
                StorageError::Git(e)
            }
        })?;

        let content = blob.content();
        let size = content.len() as i64;
        let content = if want_content && content.len() <= max_content {
            content.to_vec()
        } else {
            Vec::new()
        };

        Ok(BlobData {
            hash: hash.to_string(),
            size,
            content,
        })
    }

    /// Whether an object with this hash exists in the store.
    pub fn has_object(&self, hash: &str) -> bool {
        match Oid::from_str(hash) {
            Ok(oid) => self
                .inner
                .odb()
                .map(|odb| odb.exists(oid))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn git_time_to_utc(time: git2::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds(), 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}
