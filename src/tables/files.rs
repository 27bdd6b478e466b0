//! The `files` table: the tree of every commit expanded into (path, blob)
//! rows. A row exists per (commit, file path) pair; submodule entries are
//! not files and are skipped.

use std::sync::Arc;

use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{Repository, StorageResult, TreeEntryData};

use super::{ChainedRepoIter, RepoRowSource, Selectors, MAX_BLOB_CONTENT};

pub const NAME: &str = "files";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "file_path", "commit_hash"];

/// Position of blob_content in the schema.
const CONTENT_COLUMN: usize = 4;

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("file_path", ValueKind::Text, false, NAME),
        Column::new("blob_hash", ValueKind::Text, false, NAME),
        Column::new("tree_entry_mode", ValueKind::Text, false, NAME),
        Column::new("blob_content", ValueKind::Blob, true, NAME),
        Column::new("tree_hash", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
    ])
}

struct Frame {
    prefix: String,
    entries: Arc<Vec<TreeEntryData>>,
    pos: usize,
}

pub struct Cursor {
    commits: Vec<String>,
    cpos: usize,
    point_lookup: bool,
    paths: Option<Vec<String>>,
    want_content: bool,
    /// Walk state for the current commit.
    current: Option<(String, String, Vec<Frame>)>,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, projection: Option<&[usize]>) -> StorageResult<Self> {
        let (commits, point_lookup) = match selectors.text_values("commit_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                (hashes, true)
            }
            None => (repo.commit_ids()?, false),
        };
        Ok(Cursor {
            commits,
            cpos: 0,
            point_lookup,
            paths: selectors.text_values("file_path"),
            want_content: projection.map_or(true, |cols| cols.contains(&CONTENT_COLUMN)),
            current: None,
        })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.current.is_none() {
                if self.cpos >= self.commits.len() {
                    return Ok(None);
                }
                let hash = self.commits[self.cpos].clone();
                self.cpos += 1;
                match repo.commit_data(&hash) {
                    Ok(data) => {
                        let root = data.tree_hash.clone();
                        let entries = repo.tree_entry_list(&root)?;
                        self.current = Some((
                            hash,
                            root,
                            vec![Frame {
                                prefix: String::new(),
                                entries,
                                pos: 0,
                            }],
                        ));
                    }
                    Err(e) if self.point_lookup && e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }

            let (commit, root_tree, frames) = self.current.as_mut().expect("walk in progress");

            let frame = match frames.last_mut() {
                Some(f) => f,
                None => {
                    self.current = None;
                    continue;
                }
            };
            if frame.pos >= frame.entries.len() {
                frames.pop();
                continue;
            }

            let entry = frame.entries[frame.pos].clone();
            let path = if frame.prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", frame.prefix, entry.name)
            };
            frame.pos += 1;

            if entry.is_tree {
                let entries = repo.tree_entry_list(&entry.hash)?;
                frames.push(Frame {
                    prefix: path,
                    entries,
                    pos: 0,
                });
                continue;
            }
            if entry.is_submodule {
                continue;
            }
            if let Some(paths) = &self.paths {
                if !paths.contains(&path) {
                    continue;
                }
            }

            let blob = repo.blob_data(&entry.hash, self.want_content, MAX_BLOB_CONTENT)?;
            return Ok(Some(vec![
                Value::text(repo.id()),
                Value::text(path),
                Value::text(&entry.hash),
                Value::text(entry.mode_octal()),
                Value::Blob(blob.content),
                Value::text(root_tree.as_str()),
                Value::text(commit.as_str()),
            ]));
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
    use std::sync::Arc as StdArc;

    fn fixture_ctx() -> (FixtureRepo, Context) {
        let mut fixture = FixtureRepo::empty();
        fixture.commit("one", &[("a.txt", "a1")]);
        fixture.commit("two", &[("a.txt", "a2"), ("dir/b.txt", "b")]);
        let pool = StdArc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        (fixture, Context::for_pool(pool))
    }

    #[test]
    fn test_one_row_per_commit_and_path() {
        let (fixture, ctx) = fixture_ctx();
        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();

        // Commit one: a.txt. Commit two: a.txt, dir/b.txt.
        assert_eq!(rows.len(), 3);

        let second: Vec<_> = rows
            .iter()
            .filter(|r| r[6] == Value::text(&fixture.commits()[1]))
            .collect();
        let paths: Vec<String> = second.iter().map(|r| r[1].to_string()).collect();
        assert!(paths.contains(&"a.txt".to_string()));
        assert!(paths.contains(&"dir/b.txt".to_string()));
    }

    #[test]
    fn test_file_path_lookup() {
        let (_fixture, ctx) = fixture_ctx();
        let filter = Expr::eq(
            Expr::Field {
                index: 1,
                kind: ValueKind::Text,
                name: "file_path".into(),
            },
            Expr::lit(Value::text("dir/b.txt")),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][4], Value::Blob(b"b".to_vec()));
    }

    #[test]
    fn test_matches_commit_tree_expansion() {
        // files ≡ walking the tree of every commit down to the leaves.
        let (fixture, ctx) = fixture_ctx();
        let file_rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();

        let repo = fixture.open();
        let mut expected = 0;
        for commit in fixture.commits() {
            let data = repo.commit_data(commit).unwrap();
            let mut walk = super::super::commit_blobs::BlobWalk::new(data.tree_hash.clone());
            while walk.next_blob(&repo).unwrap().is_some() {
                expected += 1;
            }
        }
        // Fixture has no duplicate blobs within a commit, so counts agree.
        assert_eq!(file_rows.len(), expected);
    }
}
