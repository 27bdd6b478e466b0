//! The `commit_blobs` table: every blob reachable from every commit,
//! deduplicated within one commit's expansion.

use std::collections::HashSet;

use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{Repository, StorageResult};

use super::commit_trees::TreeWalk;
use super::{ChainedRepoIter, RepoRowSource, Selectors};

pub const NAME: &str = "commit_blobs";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "commit_hash"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
        Column::new("blob_hash", ValueKind::Text, false, NAME),
    ])
}

/// Walk of the blobs under one commit: trees in pre-order, blobs in
/// recorded entry order, each blob once per commit.
pub struct BlobWalk {
    trees: TreeWalk,
    pending: Vec<String>,
    seen: HashSet<String>,
}

impl BlobWalk {
    pub fn new(root_tree: String) -> Self {
        Self {
            trees: TreeWalk::new(root_tree),
            pending: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn next_blob(&mut self, repo: &Repository) -> StorageResult<Option<String>> {
        loop {
            if let Some(hash) = self.pending.pop() {
                return Ok(Some(hash));
            }
            let tree = match self.trees.next_tree(repo)? {
                Some(t) => t,
                None => return Ok(None),
            };
            let entries = repo.tree_entry_list(&tree)?;
            // Collect this tree's blob entries, keeping recorded order.
            for entry in entries.iter().rev() {
                if !entry.is_tree && !entry.is_submodule && self.seen.insert(entry.hash.clone()) {
                    self.pending.push(entry.hash.clone());
                }
            }
        }
    }
}

pub struct Cursor {
    commits: Vec<String>,
    pos: usize,
    point_lookup: bool,
    walk: Option<(String, BlobWalk)>,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let (commits, point_lookup) = match selectors.text_values("commit_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                (hashes, true)
            }
            None => (repo.commit_ids()?, false),
        };
        Ok(Cursor {
            commits,
            pos: 0,
            point_lookup,
            walk: None,
        })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.walk.is_none() {
                if self.pos >= self.commits.len() {
                    return Ok(None);
                }
                let hash = self.commits[self.pos].clone();
                self.pos += 1;
                match repo.commit_data(&hash) {
                    Ok(data) => {
                        self.walk = Some((hash, BlobWalk::new(data.tree_hash.clone())));
                    }
                    Err(e) if self.point_lookup && e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }

            let (commit, walk) = self.walk.as_mut().expect("walk in progress");
            match walk.next_blob(repo)? {
                Some(blob) => {
                    return Ok(Some(vec![
                        Value::text(repo.id()),
                        Value::text(commit.as_str()),
                        Value::text(blob),
                    ]))
                }
                None => {
                    self.walk = None;
                }
            }
        }
    }
}

pub fn row_iter(
    ctx: &Context,
    filters: Vec<Expr>,
    projection: Option<Vec<usize>>,
) -> ChainedRepoIter<Cursor> {
    ChainedRepoIter::new(ctx, &schema(), filters, projection)
}
