//! Table catalog.
//!
//! All tables are built in: the ten git tables plus the two
//! `information_schema` views. The catalog resolves names to tables and
//! dispatches the per-table capabilities (row iteration, handled filters,
//! index support).

mod information_schema;

use crate::executor::{ExecuteError, ExecuteResult, RowIter};
use crate::session::Context;
use crate::sql::{Expr, Schema};
use crate::tables;

pub const INFORMATION_SCHEMA: &str = "information_schema";

/// Every table the engine knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Repositories,
    Refs,
    Remotes,
    Commits,
    RefCommits,
    CommitTrees,
    CommitBlobs,
    TreeEntries,
    Blobs,
    Files,
    /// information_schema.tables
    InfoTables,
    /// information_schema.columns
    InfoColumns,
}

impl Table {
    /// The git-backed tables, in catalog order.
    pub const GIT_TABLES: [Table; 10] = [
        Table::Blobs,
        Table::CommitBlobs,
        Table::CommitTrees,
        Table::Commits,
        Table::Files,
        Table::RefCommits,
        Table::Refs,
        Table::Remotes,
        Table::Repositories,
        Table::TreeEntries,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Repositories => tables::repositories::NAME,
            Table::Refs => tables::refs::NAME,
            Table::Remotes => tables::remotes::NAME,
            Table::Commits => tables::commits::NAME,
            Table::RefCommits => tables::ref_commits::NAME,
            Table::CommitTrees => tables::commit_trees::NAME,
            Table::CommitBlobs => tables::commit_blobs::NAME,
            Table::TreeEntries => tables::tree_entries::NAME,
            Table::Blobs => tables::blobs::NAME,
            Table::Files => tables::files::NAME,
            Table::InfoTables => information_schema::TABLES_NAME,
            Table::InfoColumns => information_schema::COLUMNS_NAME,
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            Table::Repositories => tables::repositories::schema(),
            Table::Refs => tables::refs::schema(),
            Table::Remotes => tables::remotes::schema(),
            Table::Commits => tables::commits::schema(),
            Table::RefCommits => tables::ref_commits::schema(),
            Table::CommitTrees => tables::commit_trees::schema(),
            Table::CommitBlobs => tables::commit_blobs::schema(),
            Table::TreeEntries => tables::tree_entries::schema(),
            Table::Blobs => tables::blobs::schema(),
            Table::Files => tables::files::schema(),
            Table::InfoTables => information_schema::tables_schema(),
            Table::InfoColumns => information_schema::columns_schema(),
        }
    }

    pub fn is_git(&self) -> bool {
        !matches!(self, Table::InfoTables | Table::InfoColumns)
    }

    /// Columns this table can evaluate equality/IN filters on internally.
    pub fn handled_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Repositories => tables::repositories::HANDLED_COLUMNS,
            Table::Refs => tables::refs::HANDLED_COLUMNS,
            Table::Remotes => tables::remotes::HANDLED_COLUMNS,
            Table::Commits => tables::commits::HANDLED_COLUMNS,
            Table::RefCommits => tables::ref_commits::HANDLED_COLUMNS,
            Table::CommitTrees => tables::commit_trees::HANDLED_COLUMNS,
            Table::CommitBlobs => tables::commit_blobs::HANDLED_COLUMNS,
            Table::TreeEntries => tables::tree_entries::HANDLED_COLUMNS,
            Table::Blobs => tables::blobs::HANDLED_COLUMNS,
            Table::Files => tables::files::HANDLED_COLUMNS,
            Table::InfoTables | Table::InfoColumns => &[],
        }
    }

    /// The subset of `filters` this table evaluates internally.
    pub fn handled_filters(&self, filters: &[Expr]) -> Vec<Expr> {
        tables::handled_filters(&self.schema(), self.handled_columns(), filters)
    }

    /// Whether the table supports index builds and index-driven access.
    pub fn is_indexable(&self) -> bool {
        matches!(
            self,
            Table::Refs | Table::Commits | Table::TreeEntries | Table::Blobs
        )
    }

    /// Open the table's row iterator with pushed-down filters/projection.
    pub fn row_iter(
        &self,
        ctx: &Context,
        filters: Vec<Expr>,
        projection: Option<Vec<usize>>,
    ) -> ExecuteResult<Box<dyn RowIter>> {
        Ok(match self {
            Table::Repositories => Box::new(tables::repositories::row_iter(ctx, filters, projection)),
            Table::Refs => Box::new(tables::refs::row_iter(ctx, filters, projection)),
            Table::Remotes => Box::new(tables::remotes::row_iter(ctx, filters, projection)),
            Table::Commits => Box::new(tables::commits::row_iter(ctx, filters, projection)),
            Table::RefCommits => Box::new(tables::ref_commits::row_iter(ctx, filters, projection)),
            Table::CommitTrees => Box::new(tables::commit_trees::row_iter(ctx, filters, projection)),
            Table::CommitBlobs => Box::new(tables::commit_blobs::row_iter(ctx, filters, projection)),
            Table::TreeEntries => Box::new(tables::tree_entries::row_iter(ctx, filters, projection)),
            Table::Blobs => Box::new(tables::blobs::row_iter(ctx, filters, projection)),
            Table::Files => Box::new(tables::files::row_iter(ctx, filters, projection)),
            Table::InfoTables => information_schema::tables_iter(ctx),
            Table::InfoColumns => information_schema::columns_iter(ctx),
        })
    }

    /// Key/value pairs feeding an index build over `columns`.
    pub fn index_pairs(&self, ctx: &Context, columns: &[String]) -> ExecuteResult<tables::IndexPairs> {
        match self {
            Table::Refs => tables::refs::index_pairs(ctx, columns),
            Table::Commits => tables::commits::index_pairs(ctx, columns),
            Table::TreeEntries => tables::tree_entries::index_pairs(ctx, columns),
            Table::Blobs => tables::blobs::index_pairs(ctx, columns),
            other => Err(ExecuteError::Internal(format!(
                "table {} is not indexable",
                other.name()
            ))),
        }
    }

    /// Resolve index locators back into rows.
    pub fn rows_for_index(
        &self,
        ctx: &Context,
        locators: Vec<Vec<u8>>,
    ) -> ExecuteResult<Box<dyn RowIter>> {
        match self {
            Table::Refs => Ok(tables::refs::rows_for_index(ctx, locators)),
            Table::Commits => Ok(tables::commits::rows_for_index(ctx, locators)),
            Table::TreeEntries => Ok(tables::tree_entries::rows_for_index(ctx, locators)),
            Table::Blobs => Ok(tables::blobs::rows_for_index(ctx, locators)),
            other => Err(ExecuteError::Internal(format!(
                "table {} is not indexable",
                other.name()
            ))),
        }
    }
}

/// Name resolution for one database.
pub struct Catalog {
    database: String,
}

impl Catalog {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Resolve a possibly database-qualified table name.
    pub fn resolve(&self, database: Option<&str>, name: &str) -> Option<Table> {
        let name = name.to_ascii_lowercase();
        match database.map(str::to_ascii_lowercase) {
            Some(db) if db == INFORMATION_SCHEMA => match name.as_str() {
                information_schema::TABLES_NAME => Some(Table::InfoTables),
                information_schema::COLUMNS_NAME => Some(Table::InfoColumns),
                _ => None,
            },
            Some(db) if db != self.database.to_ascii_lowercase() => None,
            _ => Table::GIT_TABLES
                .iter()
                .copied()
                .find(|t| t.name() == name),
        }
    }

    /// Every git table, in catalog order.
    pub fn tables(&self) -> Vec<Table> {
        Table::GIT_TABLES.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_git_tables() {
        let catalog = Catalog::new("gitql");
        assert_eq!(catalog.resolve(None, "refs"), Some(Table::Refs));
        assert_eq!(catalog.resolve(None, "REFS"), Some(Table::Refs));
        assert_eq!(catalog.resolve(Some("gitql"), "commits"), Some(Table::Commits));
        assert_eq!(catalog.resolve(None, "no_such_table"), None);
        assert_eq!(catalog.resolve(Some("otherdb"), "refs"), None);
    }

    #[test]
    fn test_resolve_information_schema() {
        let catalog = Catalog::new("gitql");
        assert_eq!(
            catalog.resolve(Some("information_schema"), "tables"),
            Some(Table::InfoTables)
        );
        assert_eq!(
            catalog.resolve(Some("information_schema"), "columns"),
            Some(Table::InfoColumns)
        );
        assert_eq!(catalog.resolve(None, "tables"), None);
    }

    #[test]
    fn test_schemas_are_stable() {
        for table in Table::GIT_TABLES {
            assert_eq!(table.schema(), table.schema());
            assert!(!table.schema().is_empty());
            // Every git table leads with repository_id.
            assert_eq!(table.schema().columns()[0].name, "repository_id");
        }
    }

    #[test]
    fn test_handled_columns_exist_in_schema() {
        for table in Table::GIT_TABLES {
            let schema = table.schema();
            for column in table.handled_columns() {
                assert!(
                    !schema.positions_of(None, column).is_empty(),
                    "{} declares unknown handled column {}",
                    table.name(),
                    column
                );
            }
        }
    }
}
