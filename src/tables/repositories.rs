//! The `repositories` table: one row per pooled repository.

use crate::session::Context;
use crate::sql::{Column, Row, Schema, Value, ValueKind};
use crate::storage::{Repository, StorageResult};

use super::{ChainedRepoIter, RepoRowSource, Selectors};

pub const NAME: &str = "repositories";

pub const HANDLED_COLUMNS: &[&str] = &["repository_id"];

pub fn schema() -> Schema {
    Schema::new(vec![Column::new(
        "repository_id",
        ValueKind::Text,
        false,
        NAME,
    )])
}

pub struct Cursor {
    emitted: bool,
}

impl RepoRowSource for Cursor {
    fn open(_repo: &Repository, _sel: &Selectors, _proj: Option<&[usize]>) -> StorageResult<Self> {
        Ok(Cursor { emitted: false })
    }

    fn next_row(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(vec![Value::text(repo.id())]))
    }
}

pub fn row_iter(
    ctx: &Context,
    filters: Vec<crate::sql::Expr>,
    projection: Option<Vec<usize>>,
) -> ChainedRepoIter<Cursor> {
    ChainedRepoIter::new(ctx, &schema(), filters, projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::sql::Expr;
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc;

    #[test]
    fn test_one_row_per_repository() {
        let a = FixtureRepo::with_history(&["a"]);
        let b = FixtureRepo::with_history(&["b"]);
        let pool = Arc::new(RepositoryPool::default());
        pool.add_repository(a.path()).unwrap();
        pool.add_repository(b.path()).unwrap();

        let ctx = Context::for_pool(pool);
        let rows = collect_rows(&mut row_iter(&ctx, vec![], None)).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_repository_id_pushdown() {
        let a = FixtureRepo::with_history(&["a"]);
        let b = FixtureRepo::with_history(&["b"]);
        let pool = Arc::new(RepositoryPool::default());
        let id_a = pool.add_repository(a.path()).unwrap();
        pool.add_repository(b.path()).unwrap();

        let ctx = Context::for_pool(pool);
        let filter = Expr::eq(
            Expr::Field {
                index: 0,
                kind: ValueKind::Text,
                name: "repository_id".into(),
            },
            Expr::lit(Value::text(&id_a)),
        );
        let rows = collect_rows(&mut row_iter(&ctx, vec![filter], None)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::text(&id_a));
    }
}
