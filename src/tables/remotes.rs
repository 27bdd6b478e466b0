//! The `remotes` table: one row per remote per refspec position.

use crate::session::Context;
use crate::sql::{Column, Expr, Row, Schema, Value, ValueKind};
use crate::storage::{RemoteInfo, Repository, StorageResult};

use super::{ChainedRepoIter, RepoRowSource, Selectors};

pub const NAME: &str = "remotes";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id", "remote_name"];

pub fn schema() -> Schema {
    Schema::new(vec![
        Column::new("repository_id", ValueKind::Text, false, NAME),
        Column::new("remote_name", ValueKind::Text, false, NAME),
        Column::new("remote_push_url", ValueKind::Text, true, NAME),
        Column::new("remote_fetch_url", ValueKind::Text, true, NAME),
        Column::new("remote_push_refspec", ValueKind::Text, true, NAME),
        Column::new("remote_fetch_refspec", ValueKind::Text, true, NAME),
    ])
}

fn remote_row(repo_id: &str, info: &RemoteInfo) -> Row {
    vec![
        Value::text(repo_id),
        Value::text(&info.name),
        Value::text(&info.push_url),
        Value::text(&info.fetch_url),
        Value::text(&info.push_refspec),
        Value::text(&info.fetch_refspec),
    ]
}

pub struct Cursor {
    rows: Vec<RemoteInfo>,
    pos: usize,
}

impl RepoRowSource for Cursor {
    fn open(repo: &Repository, selectors: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        let mut rows = repo.remote_infos()?;
        if let Some(names) = selectors.text_values("remote_name") {
            rows.retain(|r| names.contains(&r.name));
        }
        Ok(Cursor { rows, pos: 0 })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let row = remote_row(repo.id(), &self.rows[self.pos]);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc;

    #[test]
    fn test_remote_rows() {
        let fixture = FixtureRepo::with_history(&["one"]);
        fixture.add_remote("origin", "https://example.com/repo.git");
        fixture.add_remote("mirror", "https://mirror.example.com/repo.git");

        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        assert_eq!(rows.len(), 2);

        let origin = rows.iter().find(|r| r[1] == Value::text("origin")).unwrap();
        assert_eq!(origin[3], Value::text("https://example.com/repo.git"));
        // Default fetch refspec registered with the remote.
        assert_eq!(
            origin[5],
            Value::text("+refs/heads/*:refs/remotes/origin/*")
        );
    }

    #[test]
    fn test_no_remotes() {
        let fixture = FixtureRepo::with_history(&["one"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        let ctx = Context::for_pool(pool);

        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        assert!(rows.is_empty());
    }
}
