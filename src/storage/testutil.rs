//! Git fixture repositories for tests.
//!
//! Fixtures are built object-by-object with deterministic timestamps so
//! date-based assertions are stable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{RepositoryInitOptions, Signature, Time};
use tempfile::TempDir;

use super::cache::{ObjectCache, DEFAULT_CACHE_BYTES};
use super::repository::Repository;

/// Seconds for 2015-03-31T00:00:00Z; commit `i` is stamped base + i hours.
const BASE_TIME: i64 = 1_427_760_000;

pub struct FixtureRepo {
    dir: TempDir,
    commits: Vec<String>,
}

impl FixtureRepo {
    /// An initialized repository with no commits.
    pub fn empty() -> Self {
        let dir = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        git2::Repository::init_opts(dir.path(), &opts).unwrap();
        Self {
            dir,
            commits: Vec::new(),
        }
    }

    /// A linear history, one commit per message, each rewriting `data.txt`.
    pub fn with_history(messages: &[&str]) -> Self {
        let mut fixture = Self::empty();
        for msg in messages {
            fixture.commit(msg, &[("data.txt", msg)]);
        }
        fixture
    }

    /// A single commit containing the given files (nested paths allowed).
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let mut fixture = Self::empty();
        fixture.commit("initial", files);
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Hashes of every commit created, in creation order (root first).
    pub fn commits(&self) -> &[String] {
        &self.commits
    }

    fn git(&self) -> git2::Repository {
        git2::Repository::open(self.dir.path()).unwrap()
    }

    fn signature(&self, n: usize) -> Signature<'static> {
        Signature::new("Fixture Author", "fixture@example.com", &Time::new(BASE_TIME + n as i64 * 3600, 0))
            .unwrap()
    }

    /// Add a commit on HEAD with the given files, returning its hash.
    pub fn commit(&mut self, message: &str, files: &[(&str, &str)]) -> String {
        let repo = self.git();
        let tree_oid = build_tree(&repo, files);
        let tree = repo.find_tree(tree_oid).unwrap();
        let sig = self.signature(self.commits.len());

        let parents: Vec<git2::Commit> = match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            Some(c) => vec![c],
            None => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
        let hash = oid.to_string();
        self.commits.push(hash.clone());
        hash
    }

    /// Create a branch pointing at the given commit.
    pub fn branch(&self, name: &str, hash: &str) {
        let repo = self.git();
        let commit = repo.find_commit(git2::Oid::from_str(hash).unwrap()).unwrap();
        repo.branch(name, &commit, false).unwrap();
    }

    /// Register a remote with the default fetch refspec.
    pub fn add_remote(&self, name: &str, url: &str) {
        self.git().remote(name, url).unwrap();
    }

    /// Remove a loose object file, producing a deliberately broken store.
    pub fn delete_object(&self, hash: &str) {
        let (dir, file) = hash.split_at(2);
        let path = self.dir.path().join(".git/objects").join(dir).join(file);
        std::fs::remove_file(path).unwrap();
    }

    /// Open a storage handle with a private cache.
    pub fn open(&self) -> Repository {
        self.open_with_cache(Arc::new(ObjectCache::new(DEFAULT_CACHE_BYTES)))
    }

    pub fn open_with_cache(&self, cache: Arc<ObjectCache>) -> Repository {
        let id = self.dir.path().display().to_string();
        Repository::open(&id, self.dir.path(), cache).unwrap()
    }
}

/// Write a (possibly nested) file set as a tree, returning the root tree id.
fn build_tree(repo: &git2::Repository, files: &[(&str, &str)]) -> git2::Oid {
    // Group files by their first path segment.
    let mut blobs: BTreeMap<String, git2::Oid> = BTreeMap::new();
    let mut subdirs: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

    for (path, content) in files {
        match path.split_once('/') {
            None => {
                let oid = repo.blob(content.as_bytes()).unwrap();
                blobs.insert(path.to_string(), oid);
            }
            Some((dir, rest)) => subdirs
                .entry(dir.to_string())
                .or_default()
                .push((rest.to_string(), content.to_string())),
        }
    }

    let mut builder = repo.treebuilder(None).unwrap();
    for (name, oid) in &blobs {
        builder.insert(name, *oid, 0o100644).unwrap();
    }
    for (dir, entries) in &subdirs {
        let nested: Vec<(&str, &str)> = entries
            .iter()
            .map(|(p, c)| (p.as_str(), c.as_str()))
            .collect();
        let sub_oid = build_tree(repo, &nested);
        builder.insert(dir, sub_oid, 0o040000).unwrap();
    }
    builder.write().unwrap()
}
