//! The `refs` table: every reference of every repository, with a HEAD row
//! per repository resolved to its target commit.

use serde::{Deserialize, Serialize};

use crate::executor::{ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{RefInfo, Repository, StorageResult};

use super::{encode_locator, ChainedRepoIter, LocatorRowIter, RepoRowSource, Selectors};

pub const NAME: &str = "refs";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "ref_name"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("ref_name", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
    ])
}

fn ref_row(repo_id: &str, info: &RefInfo) -> Row {
    vec![
        Value::text(repo_id),
        Value::text(&info.name),
        Value::text(&info.hash),
    ]
}

pub struct Cursor {
    rows: Vec<RefInfo>,
    pos: usize,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let mut rows = repo.ref_infos()?;
        if let Some(names) = selectors.text_values("ref_name") {
            rows.retain(|r| names.contains(&r.name));
        }
        Ok(Cursor { rows, pos: 0 })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let row = ref_row(repo.id(), &self.rows[self.pos]);
        self.pos += 1;
        Ok(Some(row))
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

/// Locator for a ref row: the repository plus the reference name.
#[derive(Debug, Serialize, Deserialize)]
struct Locator {
    repository: String,
    name: String,
}

/// (value tuple, locator) pairs for building an index over `columns`.
pub fn index_pairs(ctx: &Context, columns: &[String]) -> ExecuteResult<super::IndexPairs> {
    super::IndexPairs::over_table(ctx, &schema(), columns, row_iter(ctx, vec![], None), |row| {
        encode_locator(&Locator {
            repository: row[0].to_string(),
            name: row[1].to_string(),
        })
    })
}

/// Resolve index locators back to ref rows.
pub fn rows_for_index(ctx: &Context, locators: Vec<Vec<u8>>) -> Box<dyn RowIter> {
    Box::new(LocatorRowIter::new(ctx, locators, |ctx, bytes| {
        let locator: Locator = super::decode_locator(bytes)?;
        let repo = ctx.pool().open(&locator.repository)?;
        let info = repo
            .ref_infos()?
            .into_iter()
            .find(|r| r.name == locator.name);
        Ok(info.map(|i| ref_row(repo.id(), &i)))
    }))
}
