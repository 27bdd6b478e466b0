//! The `commit_trees` table: every tree reachable from every commit.
//!
//! Trees are visited in pre-order starting at the commit's root tree; each
//! tree hash is emitted once per commit expansion.

use std::collections::HashSet;

use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{Repository, StorageResult};

use super::{ChainedRepoIter, RepoRowSource, Selectors};

pub const NAME: &str = "commit_trees";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "commit_hash"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
        Column::new("tree_hash", ValueKind::Text, false, NAME),
    ])
}

/// Pre-order walk of the trees under one commit, emitting each tree hash
/// once. Shared with the squash stages and the files table.
pub struct TreeWalk {
    stack: Vec<String>,
    visited: HashSet<String>,
}

impl TreeWalk {
    pub fn new(root_tree: String) -> Self {
        Self {
            stack: vec![root_tree],
            visited: HashSet::new(),
        }
    }

    /// Next unvisited tree hash, expanding its subtrees onto the stack.
    pub fn next_tree(&mut self, repo: &Repository) -> StorageResult<Option<String>> {
        while let Some(hash) = self.stack.pop() {
            if !self.visited.insert(hash.clone()) {
                continue;
            }
            let entries = repo.tree_entry_list(&hash)?;
            // Reverse keeps recorded order under the LIFO stack.
            for entry in entries.iter().rev() {
                if entry.is_tree {
                    self.stack.push(entry.hash.clone());
                }
            }
            return Ok(Some(hash));
        }
        Ok(None)
    }
}

pub struct Cursor {
    commits: Vec<String>,
    pos: usize,
    point_lookup: bool,
    walk: Option<(String, TreeWalk)>,
}

impl Cursor {
    fn commit_list(repo: &Repository, selectors: &Selectors) -> StorageResult<(Vec<String>, bool)> {
        match selectors.text_values("commit_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                Ok((hashes, true))
            }
            None => Ok((repo.commit_ids()?, false)),
        }
    }
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let (commits, point_lookup) = Self::commit_list(repo, selectors)?;
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
                        self.walk = Some((hash, TreeWalk::new(data.tree_hash.clone())));
                    }
                    Err(e) if self.point_lookup && e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }

            let (commit, walk) = self.walk.as_mut().expect("walk in progress");
            match walk.next_tree(repo)? {
                Some(tree) => {
                    return Ok(Some(vec![
                        Value::text(repo.id()),
                        Value::text(commit.as_str()),
                        Value::text(tree),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc;

    #[test]
    fn test_nested_trees_reachable() {
        let fixture = FixtureRepo::with_files(&[
            ("top.txt", "t"),
            ("dir/a.txt", "a"),
            ("dir/sub/b.txt", "b"),
        ]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        // Root tree, dir, dir/sub.
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row[1], Value::text(&fixture.commits()[0]));
        }

        // Root tree comes first in pre-order.
        let repo = fixture.open();
        let root = repo.commit_data(&fixture.commits()[0]).unwrap().tree_hash.clone();
        assert_eq!(rows[0][2], Value::text(&root));
    }

    #[test]
    fn test_trees_deduped_within_commit() {
        // Two directories with identical content share one tree object.
        let fixture = FixtureRepo::with_files(&[("x/f.txt", "same"), ("y/f.txt", "same")]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        // Root plus the single shared subtree.
        assert_eq!(rows.len(), 2);
    }
}
