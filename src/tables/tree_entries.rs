//! The `tree_entries` table: every entry of every tree object.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::executor::{ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{Repository, StorageResult, TreeEntryData};

use super::{encode_locator, ChainedRepoIter, LocatorRowIter, RepoRowSource, Selectors};

pub const NAME: &str = "tree_entries";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "tree_hash"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("tree_hash", ValueKind::Text, false, NAME),
        Column::new("tree_entry_name", ValueKind::Text, false, NAME),
        Column::new("blob_hash", ValueKind::Text, false, NAME),
        Column::new("tree_entry_mode", ValueKind::Text, false, NAME),
    ])
}

pub(crate) fn entry_row(repo_id: &str, tree: &str, entry: &TreeEntryData) -> Row {
    vec![
        Value::text(repo_id),
        Value::text(tree),
        Value::text(&entry.name),
        Value::text(&entry.hash),
        Value::text(entry.mode_octal()),
    ]
}

pub struct Cursor {
    trees: Vec<String>,
    pos: usize,
    point_lookup: bool,
    current: Option<(String, Arc<Vec<TreeEntryData>>, usize)>,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let (trees, point_lookup) = match selectors.text_values("tree_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                (hashes, true)
            }
            None => (repo.tree_ids()?, false),
        };
        Ok(Cursor {
            trees,
            pos: 0,
            point_lookup,
            current: None,
        })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.current.is_none() {
                if self.pos >= self.trees.len() {
                    return Ok(None);
                }
                let hash = self.trees[self.pos].clone();
                self.pos += 1;
                match repo.tree_entry_list(&hash) {
                    Ok(entries) => self.current = Some((hash, entries, 0)),
                    Err(e) if self.point_lookup && e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }

            let (tree, entries, cursor) = self.current.as_mut().expect("current tree set");
            if *cursor >= entries.len() {
                self.current = None;
                continue;
            }
            let row = entry_row(repo.id(), tree, &entries[*cursor]);
            *cursor += 1;
            return Ok(Some(row));
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

// ==================== Index support ====================

/// Locator for a tree entry row: the tree plus the entry position, so rows
/// sharing one tree object resolve through a single decode.
#[derive(Debug, Serialize, Deserialize)]
struct Locator {
    repository: String,
    tree: String,
    pos: usize,
}

pub fn index_pairs(ctx: &Context, columns: &[String]) -> ExecuteResult<super::IndexPairs> {
    // Entry position restarts at every (repository, tree) boundary.
    let mut last: Option<(String, String)> = None;
    let mut pos = 0usize;
    super::IndexPairs::over_table(
        ctx,
        &schema(),
        columns,
        row_iter(ctx, vec![], None),
        move |row| {
            let key = (row[0].to_string(), row[1].to_string());
            if last.as_ref() != Some(&key) {
                last = Some(key.clone());
                pos = 0;
            }
            let locator = encode_locator(&Locator {
                repository: key.0,
                tree: key.1,
                pos,
            });
            pos += 1;
            locator
        },
    )
}

pub fn rows_for_index(ctx: &Context, locators: Vec<Vec<u8>>) -> Box<dyn RowIter> {
    Box::new(LocatorRowIter::new(ctx, locators, |ctx, bytes| {
        let locator: Locator = super::decode_locator(bytes)?;
        let repo = ctx.pool().open(&locator.repository)?;
        let entries = match repo.tree_entry_list(&locator.tree) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .get(locator.pos)
            .map(|entry| entry_row(repo.id(), &locator.tree, entry)))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc as StdArc;

    fn fixture_ctx() -> (FixtureRepo, Context) {
        let fixture = FixtureRepo::with_files(&[("a.txt", "alpha"), ("dir/b.txt", "beta")]);
        let pool = StdArc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        (fixture, Context::for_pool(pool))
    }

    #[test]
    fn test_entries_of_every_tree() {
        let (_fixture, ctx) = fixture_ctx();
        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();

        // Root tree has two entries (a.txt, dir); dir has one (b.txt).
        assert_eq!(rows.len(), 3);

        let names: Vec<String> = rows.iter().map(|r| r[2].to_string()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"dir".to_string()));
        assert!(names.contains(&"b.txt".to_string()));
    }

    #[test]
    fn test_mode_is_unpadded_octal() {
        let (_fixture, ctx) = fixture_ctx();
        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();

        let file = rows.iter().find(|r| r[2] == Value::text("a.txt")).unwrap();
        assert_eq!(file[4], Value::text("100644"));
        let dir = rows.iter().find(|r| r[2] == Value::text("dir")).unwrap();
        assert_eq!(dir[4], Value::text("40000"));
    }

    #[test]
    fn test_tree_hash_point_lookup() {
        let (fixture, ctx) = fixture_ctx();
        let repo = fixture.open();
        let root = repo
            .commit_data(&fixture.commits()[0])
            .unwrap()
            .tree_hash
            .clone();

        let filter = Expr::eq(
            Expr::Field {
                index: 1,
                kind: ValueKind::Text,
                name: "tree_hash".into(),
            },
            Expr::lit(Value::text(&root)),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row[1], Value::text(&root));
        }
    }

    #[test]
    fn test_index_pairs_resolve_back() {
        let (_fixture, ctx) = fixture_ctx();

        let pairs: Vec<_> = index_pairs(&ctx, &["blob_hash".to_string()])
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(pairs.len(), 3);

        let locators: Vec<Vec<u8>> = pairs.iter().map(|(_, l)| l.clone()).collect();
        let rows = collect_rows(&mut rows_for_index(&ctx, locators)).unwrap();
        assert_eq!(rows.len(), 3);

        let scanned = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        for row in &rows {
            assert!(scanned.contains(row));
        }
    }
}
