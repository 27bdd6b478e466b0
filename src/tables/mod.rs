//! Virtual tables over git entities.
//!
//! Each table module defines the table schema, a per-repository cursor that
//! produces its rows, the set of filter columns the table can evaluate
//! internally, and (for indexable tables) the key/value iterator and
//! locator decoding used by the index subsystem.

pub mod blobs;
pub mod commit_blobs;
pub mod commit_trees;
pub mod commits;
pub mod files;
pub mod ref_commits;
pub mod refs;
pub mod remotes;
pub mod repositories;
pub mod tree_entries;

use std::collections::HashMap;

use crate::executor::{ExecuteError, ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Expr, Row, Schema, Value};
use crate::storage::{Repository, StorageResult};

/// Maximum blob content materialized into a row; larger blobs report their
/// size with empty content.
pub const MAX_BLOB_CONTENT: usize = 5 * 1024 * 1024;

/// Equality selectors extracted from pushed-down filters: column name to the
/// set of values the column may take.
#[derive(Debug, Default, Clone)]
pub struct Selectors(HashMap<String, Vec<Value>>);

impl Selectors {
    /// Extract selectors from filters resolved against `schema`. Recognized
    /// shapes: `col = lit`, `col IN (lit, ...)` and OR chains of equalities
    /// over one column.
    pub fn from_filters(schema: &Schema, filters: &[Expr]) -> Selectors {
        let mut out: HashMap<String, Vec<Value>> = HashMap::new();
        for filter in filters {
            if let Some((index, values)) = selector_of(filter) {
                if let Some(column) = schema.columns().get(index) {
                    let entry = out.entry(column.name.clone()).or_default();
                    for v in values {
                        if !entry.contains(&v) {
                            entry.push(v);
                        }
                    }
                }
            }
        }
        Selectors(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values allowed for a column, or None when the column is unrestricted.
    pub fn values(&self, column: &str) -> Option<&[Value]> {
        self.0.get(column).map(|v| v.as_slice())
    }

    /// Text values allowed for a column.
    pub fn text_values(&self, column: &str) -> Option<Vec<String>> {
        self.0
            .get(column)
            .map(|vs| vs.iter().map(|v| v.to_string()).collect())
    }

    /// Restrict a candidate list by this selector, preserving order.
    pub fn filter_list(&self, column: &str, candidates: Vec<String>) -> Vec<String> {
        match self.text_values(column) {
            Some(allowed) => candidates
                .into_iter()
                .filter(|c| allowed.contains(c))
                .collect(),
            None => candidates,
        }
    }
}

/// Decompose a filter into (field index, allowed values) when it has a
/// selector shape.
fn selector_of(expr: &Expr) -> Option<(usize, Vec<Value>)> {
    use crate::sql::BinaryOp;

    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Field { index, .. }, Expr::Literal(v))
            | (Expr::Literal(v), Expr::Field { index, .. }) => Some((*index, vec![v.clone()])),
            _ => None,
        },
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let index = match expr.as_ref() {
                Expr::Field { index, .. } => *index,
                _ => return None,
            };
            let mut values = Vec::new();
            for item in list {
                match item {
                    Expr::Literal(v) => values.push(v.clone()),
                    _ => return None,
                }
            }
            Some((index, values))
        }
        Expr::Binary {
            left,
            op: BinaryOp::Or,
            right,
        } => {
            let (li, lv) = selector_of(left)?;
            let (ri, mut rv) = selector_of(right)?;
            if li != ri {
                return None;
            }
            let mut values = lv;
            values.append(&mut rv);
            Some((li, values))
        }
        _ => None,
    }
}

/// The subset of `filters` a table with the given schema and handled columns
/// can evaluate internally. Pushed filters must be sound; the remainder is
/// re-checked above.
pub fn handled_filters(schema: &Schema, handled_columns: &[&str], filters: &[Expr]) -> Vec<Expr> {
    filters
        .iter()
        .filter(|f| {
            if selector_of(f).is_none() {
                return false;
            }
            f.field_indices().iter().all(|i| {
                schema
                    .columns()
                    .get(*i)
                    .map_or(false, |c| handled_columns.contains(&c.name.as_str()))
            })
        })
        .cloned()
        .collect()
}

/// A per-repository row cursor. Implementations hold owned state only, so
/// the outer iterator can interleave repository handles freely.
pub trait RepoRowSource: Send + Sized {
    fn open(repo: &Repository, selectors: &Selectors, projection: Option<&[usize]>)
        -> StorageResult<Self>;

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>>;
}

/// Drives a `RepoRowSource` across every repository the context may touch.
///
/// Honors repository_id selectors, re-applies pushed filters for soundness,
/// checks cancellation between rows, and applies the session's
/// skip_git_errors policy: open errors skip the repository, row errors skip
/// the row, both with a recorded warning.
pub struct ChainedRepoIter<S: RepoRowSource> {
    ctx: Context,
    repo_ids: std::vec::IntoIter<String>,
    selectors: Selectors,
    projection: Option<Vec<usize>>,
    filters: Vec<Expr>,
    current: Option<(Repository, S)>,
}

impl<S: RepoRowSource> ChainedRepoIter<S> {
    pub fn new(
        ctx: &Context,
        schema: &Schema,
        filters: Vec<Expr>,
        projection: Option<Vec<usize>>,
    ) -> Self {
        let selectors = Selectors::from_filters(schema, &filters);
        let repo_ids = selectors.filter_list("repository_id", ctx.repo_ids());
        Self {
            ctx: ctx.clone(),
            repo_ids: repo_ids.into_iter(),
            selectors,
            projection,
            filters,
            current: None,
        }
    }

    fn open_next_repo(&mut self) -> ExecuteResult<bool> {
        loop {
            let id = match self.repo_ids.next() {
                Some(id) => id,
                None => return Ok(false),
            };
            let opened = self.ctx.pool().open(&id).and_then(|repo| {
                let source = S::open(&repo, &self.selectors, self.projection.as_deref())?;
                Ok((repo, source))
            });
            match opened {
                Ok(pair) => {
                    self.current = Some(pair);
                    return Ok(true);
                }
                Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                    tracing::warn!(repository = %id, error = %e, "skipping repository");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: RepoRowSource> RowIter for ChainedRepoIter<S> {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            self.ctx.check()?;

            if self.current.is_none() && !self.open_next_repo()? {
                return Ok(None);
            }

            let (repo, source) = self.current.as_mut().expect("current repository set");
            match source.next_row(repo) {
                Ok(Some(row)) => {
                    let mut keep = true;
                    for filter in &self.filters {
                        if !filter.eval_truthy(&self.ctx, &row)? {
                            keep = false;
                            break;
                        }
                    }
                    if keep {
                        return Ok(Some(row));
                    }
                }
                Ok(None) => {
                    self.current = None;
                }
                Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                    tracing::warn!(repository = %repo.id(), error = %e, "skipping row");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.current = None;
        Ok(())
    }
}

/// Resolve an opaque locator back into a row via `resolve`, for tables that
/// support index access.
pub struct LocatorRowIter<F> {
    ctx: Context,
    locators: std::vec::IntoIter<Vec<u8>>,
    resolve: F,
}

impl<F> LocatorRowIter<F>
where
    F: FnMut(&Context, &[u8]) -> ExecuteResult<Option<Row>> + Send,
{
    pub fn new(ctx: &Context, locators: Vec<Vec<u8>>, resolve: F) -> Self {
        Self {
            ctx: ctx.clone(),
            locators: locators.into_iter(),
            resolve,
        }
    }
}

impl<F> RowIter for LocatorRowIter<F>
where
    F: FnMut(&Context, &[u8]) -> ExecuteResult<Option<Row>> + Send,
{
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            self.ctx.check()?;
            let locator = match self.locators.next() {
                Some(l) => l,
                None => return Ok(None),
            };
            match (self.resolve)(&self.ctx, &locator) {
                Ok(Some(row)) => return Ok(Some(row)),
                Ok(None) => continue,
                Err(e) if e.is_skippable_git_error() && self.ctx.skip_git_errors() => {
                    tracing::warn!(error = %e, "skipping unresolvable index locator");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Streaming (value tuple, locator) source for index builds, fed by a
/// table's full scan.
pub struct IndexPairs {
    inner: Box<dyn RowIter>,
    col_indices: Vec<usize>,
    locator_fn: Box<dyn FnMut(&Row) -> Vec<u8> + Send>,
    done: bool,
}

impl IndexPairs {
    pub fn over_table(
        _ctx: &Context,
        schema: &Schema,
        columns: &[String],
        iter: impl RowIter + 'static,
        locator_fn: impl FnMut(&Row) -> Vec<u8> + Send + 'static,
    ) -> ExecuteResult<Self> {
        let mut col_indices = Vec::with_capacity(columns.len());
        for column in columns {
            let positions = schema.positions_of(None, column);
            match positions.first() {
                Some(i) => col_indices.push(*i),
                None => {
                    return Err(ExecuteError::Internal(format!(
                        "cannot index unknown column: {}",
                        column
                    )))
                }
            }
        }
        Ok(Self {
            inner: Box::new(iter),
            col_indices,
            locator_fn: Box::new(locator_fn),
            done: false,
        })
    }
}

impl Iterator for IndexPairs {
    type Item = ExecuteResult<crate::index::KeyValuePair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next_row() {
            Ok(Some(row)) => {
                let values: Vec<Value> = self.col_indices.iter().map(|i| row[*i].clone()).collect();
                let locator = (self.locator_fn)(&row);
                Some(Ok((values, locator)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a locator the table encoded with serde_json.
pub fn decode_locator<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ExecuteResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ExecuteError::Internal(format!("malformed index locator: {}", e)))
}

/// Encode a table locator with serde_json.
pub fn encode_locator<T: serde::Serialize>(locator: &T) -> Vec<u8> {
    serde_json::to_vec(locator).expect("locator serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{BinaryOp, ValueKind};

    fn schema() -> Schema {
        refs::schema()
    }

    fn field(i: usize, name: &str) -> Expr {
        Expr::Field {
            index: i,
            kind: ValueKind::Text,
            name: name.into(),
        }
    }

    #[test]
    fn test_selector_eq() {
        let filters = vec![Expr::eq(field(1, "ref_name"), Expr::lit(Value::text("HEAD")))];
        let sel = Selectors::from_filters(&schema(), &filters);
        assert_eq!(sel.text_values("ref_name"), Some(vec!["HEAD".to_string()]));
    }

    #[test]
    fn test_selector_in_list() {
        let filters = vec![Expr::InList {
            expr: Box::new(field(0, "repository_id")),
            list: vec![Expr::lit(Value::text("a")), Expr::lit(Value::text("b"))],
            negated: false,
        }];
        let sel = Selectors::from_filters(&schema(), &filters);
        assert_eq!(
            sel.text_values("repository_id"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_selector_or_of_equalities() {
        let or = Expr::Binary {
            left: Box::new(Expr::eq(field(1, "ref_name"), Expr::lit(Value::text("HEAD")))),
            op: BinaryOp::Or,
            right: Box::new(Expr::eq(
                field(1, "ref_name"),
                Expr::lit(Value::text("refs/heads/master")),
            )),
        };
        let sel = Selectors::from_filters(&schema(), &[or]);
        assert_eq!(
            sel.text_values("ref_name"),
            Some(vec!["HEAD".to_string(), "refs/heads/master".to_string()])
        );
    }

    #[test]
    fn test_or_across_columns_is_not_a_selector() {
        let or = Expr::Binary {
            left: Box::new(Expr::eq(field(1, "ref_name"), Expr::lit(Value::text("HEAD")))),
            op: BinaryOp::Or,
            right: Box::new(Expr::eq(field(0, "repository_id"), Expr::lit(Value::text("r")))),
        };
        let sel = Selectors::from_filters(&schema(), &[or]);
        assert!(sel.is_empty());
    }

    #[test]
    fn test_handled_filters() {
        let eq_name = Expr::eq(field(1, "ref_name"), Expr::lit(Value::text("HEAD")));
        let eq_hash = Expr::eq(field(2, "commit_hash"), Expr::lit(Value::text("abc")));
        let like = Expr::Like {
            expr: Box::new(field(1, "ref_name")),
            pattern: Box::new(Expr::lit(Value::text("refs/%"))),
            negated: false,
        };

        let handled = handled_filters(
            &schema(),
            &["repository_id", "ref_name"],
            &[eq_name.clone(), eq_hash, like],
        );
        // Only the ref_name equality is in handled shape over handled columns.
        assert_eq!(handled, vec![eq_name]);
    }
}
