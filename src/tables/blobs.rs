//! The `blobs` table: every blob object with size and (bounded) content.

use serde::{Deserialize, Serialize};

use crate::executor::{ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{BlobData, Repository, StorageResult};

use super::{encode_locator, ChainedRepoIter, LocatorRowIter, RepoRowSource, Selectors, MAX_BLOB_CONTENT};

pub const NAME: &str = "blobs";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "blob_hash"];

/// Position of blob_content in the schema; scans skip reading content when a
/// pushed projection does not include it.
const CONTENT_COLUMN: usize = 3;

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("blob_hash", ValueKind::Text, false, NAME),
        Column::new("blob_size", ValueKind::Int64, false, NAME),
        Column::new("blob_content", ValueKind::Blob, true, NAME),
    ])
}

fn blob_row(repo_id: &str, data: &BlobData) -> Row {
    vec![
        Value::text(repo_id),
        Value::text(&data.hash),
        Value::Int64(data.size),
        Value::Blob(data.content.clone()),
    ]
}

pub struct Cursor {
    ids: Vec<String>,
    pos: usize,
    point_lookup: bool,
    want_content: bool,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, projection: Option<&[usize]>) -> StorageResult<Self> {
        let (ids, point_lookup) = match selectors.text_values("blob_hash") {
            Some(mut hashes) => {
                hashes.dedup();
                (hashes, true)
            }
            None => (repo.blob_ids()?, false),
        };
        let want_content = projection.map_or(true, |cols| cols.contains(&CONTENT_COLUMN));
        Ok(Cursor {
            ids,
            pos: 0,
            point_lookup,
            want_content,
        })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.pos >= self.ids.len() {
                return Ok(None);
            }
            let hash = &self.ids[self.pos];
            self.pos += 1;
            match repo.blob_data(hash, self.want_content, MAX_BLOB_CONTENT) {
                Ok(data) => return Ok(Some(blob_row(repo.id(), &data))),
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
        match repo.blob_data(&locator.hash, true, MAX_BLOB_CONTENT) {
            Ok(data) => Ok(Some(blob_row(repo.id(), &data))),
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

    fn fixture_ctx() -> (FixtureRepo, Context) {
        let fixture = FixtureRepo::with_files(&[("a.txt", "alpha"), ("b.txt", "bb")]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        (fixture, Context::for_pool(pool))
    }

    #[test]
    fn test_all_blobs_with_content() {
        let (_fixture, ctx) = fixture_ctx();
        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        assert_eq!(rows.len(), 2);

        let alpha = rows.iter().find(|r| r[2] == Value::Int64(5)).unwrap();
        assert_eq!(alpha[3], Value::Blob(b"alpha".to_vec()));
    }

    #[test]
    fn test_projection_skips_content() {
        let (_fixture, ctx) = fixture_ctx();
        // Only repository_id, blob_hash, blob_size requested.
        let rows = collect_rows(&mut row_iter(&ctx, vec![], Some(vec![0, 1, 2]))).unwrap();
        for row in &rows {
            // Schema positions stay stable; content is simply not read.
            assert_eq!(row.len(), 4);
            assert_eq!(row[3], Value::Blob(vec![]));
            assert!(row[2].as_i64().unwrap() > 0);
        }
    }

    #[test]
    fn test_point_lookup_and_index() {
        let (_fixture, ctx) = fixture_ctx();
        let all = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        let wanted = all[0][1].to_string();

        let filter = Expr::eq(
            Expr::Field {
                index: 1,
                kind: ValueKind::Text,
                name: "blob_hash".into(),
            },
            Expr::lit(Value::text(&wanted)),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::text(&wanted));

        let pairs: Vec<_> = index_pairs(&ctx, &["blob_hash".to_string()])
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let locators: Vec<Vec<u8>> = pairs
            .iter()
            .filter(|(k, _)| k == &vec![Value::text(&wanted)])
            .map(|(_, l)| l.clone())
            .collect();
        let resolved = collect_rows(&mut rows_for_index(&ctx, locators)).unwrap();
        assert_eq!(resolved, rows);
    }
}
