//! The `commits` table: every commit object in the repository store.

use serde::{Deserialize, Serialize};

use crate::executor::{ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{CommitData, Repository, StorageResult};

use super::{encode_locator, ChainedRepoIter, LocatorRowIter, RepoRowSource, Selectors};

pub const NAME: &str = "commits";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "commit_hash"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
        Column::new("commit_author_name", ValueKind::Text, false, NAME),
        Column::new("commit_author_email", ValueKind::Text, false, NAME),
        Column::new("commit_author_when", ValueKind::Timestamp, false, NAME),
        Column::new("committer_name", ValueKind::Text, false, NAME),
        Column::new("committer_email", ValueKind::Text, false, NAME),
        Column::new("committer_when", ValueKind::Timestamp, false, NAME),
        Column::new("commit_message", ValueKind::Text, false, NAME),
        Column::new("tree_hash", ValueKind::Text, false, NAME),
        Column::new("commit_parents", ValueKind::Array, false, NAME),
    ])
}

pub(crate) fn commit_row(repo_id: &str, data: &CommitData) -> Row {
    vec![
        Value::text(repo_id),
        Value::text(&data.hash),
        Value::text(&data.author_name),
        Value::text(&data.author_email),
        Value::Timestamp(data.author_when),
        Value::text(&data.committer_name),
        Value::text(&data.committer_email),
        Value::Timestamp(data.committer_when),
        Value::text(&data.message),
        Value::text(&data.tree_hash),
        Value::Array(data.parents.iter().map(Value::text).collect()),
    ]
}

pub struct Cursor {
    ids: Vec<String>,
    pos: usize,
    /// Point lookups tolerate missing objects; enumeration does not.
    point_lookup: bool,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        match selectors.text_values("commit_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                Ok(Cursor {
                    ids: hashes,
                    pos: 0,
                    point_lookup: true,
                })
            }
            None => Ok(Cursor {
                ids: repo.commit_ids()?,
                pos: 0,
                point_lookup: false,
            }),
        }
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.pos >= self.ids.len() {
                return Ok(None);
            }
            let hash = &self.ids[self.pos];
            self.pos += 1;
            match repo.commit_data(hash) {
                Ok(data) => return Ok(Some(commit_row(repo.id(), &data))),
                // A requested key that does not exist yields no row.
                Err(e) if self.point_lookup && e.is_not_found() => continue,
                Err(e) => return Err(e),
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

// ==================== Index support ====================

#[derive(Debug, Serialize, Deserialize)]
struct Locator {
    repository: String,
    hash: String,
}

pub fn index_pairs(ctx: &Context, columns: &[String]) -> ExecuteResult<super::IndexPairs> {
    super::IndexPairs::over_table(ctx, &schema(), columns, row_iter(ctx, vec![], None), |row| {
        encode_locator(&Locator {
            repository: row[0].to_string(),
            hash: row[1].to_string(),
        })
    })
}

pub fn rows_for_index(ctx: &Context, locators: Vec<Vec<u8>>) -> Box<dyn RowIter> {
    Box::new(LocatorRowIter::new(ctx, locators, |ctx, bytes| {
        let locator: Locator = super::decode_locator(bytes)?;
        let repo = ctx.pool().open(&locator.repository)?;
        match repo.commit_data(&locator.hash) {
            Ok(data) => Ok(Some(commit_row(repo.id(), &data))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc;

    #[test]
    fn test_enumerates_all_commits() {
        let fixture = FixtureRepo::with_history(&["one", "two", "three"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        assert_eq!(rows.len(), 3);

        let hashes: Vec<String> = rows.iter().map(|r| r[1].to_string()).collect();
        for known in fixture.commits() {
            assert!(hashes.contains(known));
        }
    }

    #[test]
    fn test_point_lookup_by_hash() {
        let fixture = FixtureRepo::with_history(&["one", "two"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let wanted = fixture.commits()[0].clone();
        let filter = Expr::eq(
            Expr::Field {
                index: 1,
                kind: ValueKind::Text,
                name: "commit_hash".into(),
            },
            Expr::lit(Value::text(&wanted)),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::text(&wanted));
        assert_eq!(rows[0][8], Value::text("one"));
    }

    #[test]
    fn test_missing_point_lookup_is_empty() {
        let fixture = FixtureRepo::with_history(&["one"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let filter = Expr::eq(
            Expr::Field {
                index: 1,
                kind: ValueKind::Text,
                name: "commit_hash".into(),
            },
            Expr::lit(Value::text("0123456789012345678901234567890123456789")),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parents_array() {
        let fixture = FixtureRepo::with_history(&["one", "two"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        let tip = rows
            .iter()
            .find(|r| r[1].to_string() == fixture.commits()[1])
            .unwrap();
        assert_eq!(
            tip[10],
            Value::Array(vec![Value::text(&fixture.commits()[0])])
        );
    }
}
