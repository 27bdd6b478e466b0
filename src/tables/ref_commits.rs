//! The `ref_commits` table: one row per (ref, ancestor commit) pair.
//!
//! For every reference the first-parent chain is walked from the tip;
//! `history_index` is 0 at the tip and increments toward the root. A walk
//! that hits a missing parent (shallow clone) stops silently with a
//! recorded warning.

use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{RefInfo, Repository, StorageResult};

use super::{ChainedRepoIter, RepoRowSource, Selectors};

pub const NAME: &str = "ref_commits";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "ref_name"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("ref_name", ValueKind::Text, false, NAME),
        Column::new("commit_hash", ValueKind::Text, false, NAME),
        Column::new("history_index", ValueKind::Int64, false, NAME),
    ])
}

pub struct Cursor {
    refs: Vec<RefInfo>,
    pos: usize,
    current: Option<String>,
    index: i64,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let mut refs = repo.ref_infos()?;
        if let Some(names) = selectors.text_values("ref_name") {
            refs.retain(|r| names.contains(&r.name));
        }
        Ok(Cursor {
            refs,
            pos: 0,
            current: None,
            index: 0,
        })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        loop {
            if self.current.is_none() {
                if self.pos >= self.refs.len() {
                    return Ok(None);
                }
                self.current = Some(self.refs[self.pos].hash.clone());
                self.index = 0;
            }

            let hash = self.current.clone().expect("walk position set");
            let ref_name = &self.refs[self.pos].name;

            match repo.commit_data(&hash) {
                Ok(data) => {
                    let row = vec![
                        Value::text(repo.id()),
                        Value::text(ref_name),
                        Value::text(&data.hash),
                        Value::Int64(self.index),
                    ];
                    self.current = data.parents.first().cloned();
                    self.index += 1;
                    if self.current.is_none() {
                        self.pos += 1;
                    }
                    return Ok(Some(row));
                }
                Err(e) if e.is_not_found() => {
                    // Shallow history: stop this walk, move to the next ref.
                    tracing::warn!(
                        repository = repo.id(),
                        reference = %ref_name,
                        commit = %hash,
                        "first-parent walk hit a missing commit"
                    );
                    self.current = None;
                    self.pos += 1;
                }
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
