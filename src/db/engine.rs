//! The engine facade: owns the pool, catalog and index registry, and turns
//! SQL text into result sets.

use std::sync::Arc;

use thiserror::Error;

use crate::catalog::Catalog;
use crate::executor::{
    build_iter, ExecuteError, FusedIter, ResultSet, RowIter,
};
use crate::index::{IndexError, IndexMeta, IndexRegistry};
use crate::planner::{Analyzer, Plan, PlanError};
use crate::session::{Context, Session};
use crate::sql::{ParseError, Parser, Statement, Value};
use crate::storage::{RepositoryPool, StorageError};

use super::config::{ConfigError, EngineConfig, LibraryFormat};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("server is read-only")]
    ReadOnly,

    #[error("table {0} does not support indexes")]
    NotIndexable(String),
}

/// The query engine over a repository pool.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    pool: Arc<RepositoryPool>,
    indexes: Arc<IndexRegistry>,
}

impl Engine {
    /// Build an engine from configuration: load repositories, open the
    /// index registry and reload persisted indexes.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let pool = Arc::new(RepositoryPool::new(config.cache_size_bytes()));

        for spec in config.directory_specs()? {
            if spec.format == LibraryFormat::Siva {
                return Err(ConfigError::UnsupportedFormat(
                    "siva libraries are not supported by this engine".into(),
                )
                .into());
            }
            let added = pool.add_directory(&spec.path)?;
            tracing::info!(directory = %spec.path.display(), repositories = added, "loaded directory");
        }

        let indexes = Arc::new(IndexRegistry::new(&config.index_dir));
        indexes.load_all(&config.database_name);

        Ok(Self {
            catalog: Arc::new(Catalog::new(&config.database_name)),
            pool,
            indexes,
            config,
        })
    }

    pub fn pool(&self) -> &Arc<RepositoryPool> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A new session carrying the engine's per-session defaults.
    pub fn session(&self) -> Session {
        let mut session = Session::new(self.pool.clone(), self.indexes.clone())
            .with_database(&self.config.database_name)
            .with_skip_git_errors(self.config.skip_git_errors);
        if let Some(endpoint) = &self.config.analysis_endpoint {
            session = session.with_analysis_endpoint(endpoint);
        }
        session
    }

    fn analyzer(&self) -> Analyzer {
        Analyzer::new(self.catalog.clone(), self.indexes.clone())
            .with_parallelism(self.config.effective_parallelism())
            .with_squash(!self.config.disable_squash)
    }

    /// Analyze a query without executing it; used to inspect plans.
    pub fn plan(&self, sql: &str) -> EngineResult<Plan> {
        match Parser::parse(sql)? {
            Statement::Query(plan) => Ok(self.analyzer().analyze(plan)?),
            other => Err(EngineError::Parse(ParseError::UnsupportedStatement(
                format!("{:?}", other),
            ))),
        }
    }

    /// Parse, analyze and run a statement within an existing context.
    pub fn query_with_context(&self, ctx: &Context, sql: &str) -> EngineResult<ResultSet> {
        let _span = ctx.span().clone().entered();
        tracing::debug!(sql, "executing");

        match Parser::parse(sql)? {
            Statement::Query(plan) => {
                let plan = self.analyzer().analyze(plan)?;
                let schema = plan.schema();
                let mut iter = FusedIter::new(build_iter(&plan, ctx)?);

                let mut result = ResultSet::with_schema(&schema);
                loop {
                    match iter.next_row() {
                        Ok(Some(row)) => result.push(row),
                        Ok(None) => break,
                        Err(e) => {
                            let _ = iter.close();
                            return Err(e.into());
                        }
                    }
                }
                iter.close()?;
                Ok(result)
            }

            Statement::CreateIndex {
                name,
                table,
                columns,
                driver,
            } => {
                if self.config.read_only {
                    return Err(EngineError::ReadOnly);
                }
                let table = self
                    .catalog
                    .resolve(None, &table)
                    .ok_or(PlanError::UnknownTable(table))?;
                if !table.is_indexable() {
                    return Err(EngineError::NotIndexable(table.name().to_string()));
                }
                // Validate the columns exist before draining anything.
                let schema = table.schema();
                for column in &columns {
                    if schema.positions_of(None, column).is_empty() {
                        return Err(EngineError::Plan(PlanError::UnknownColumn(column.clone())));
                    }
                }

                let driver = driver.unwrap_or_else(|| self.indexes.default_driver().to_string());
                let meta = IndexMeta::new(
                    &self.config.database_name,
                    table.name(),
                    &name,
                    columns.clone(),
                    &driver,
                );
                let mut pairs = table.index_pairs(ctx, &columns)?;
                self.indexes.create(meta, &mut pairs)?;
                tracing::info!(index = %name, table = table.name(), "index created");
                Ok(ResultSet::new(vec![]))
            }

            Statement::DropIndex { name, table } => {
                if self.config.read_only {
                    return Err(EngineError::ReadOnly);
                }
                let table = self
                    .catalog
                    .resolve(None, &table)
                    .ok_or(PlanError::UnknownTable(table))?;
                self.indexes
                    .delete(&self.config.database_name, table.name(), &name)?;
                Ok(ResultSet::new(vec![]))
            }

            Statement::ShowTables => {
                let mut result = ResultSet::new(vec!["table_name".into()]);
                for table in self.catalog.tables() {
                    result.push(vec![Value::text(table.name())]);
                }
                Ok(result)
            }

            Statement::ShowIndexes { table } => {
                let mut result = ResultSet::new(vec![
                    "table_name".into(),
                    "index_name".into(),
                    "columns".into(),
                    "driver".into(),
                ]);
                for meta in self.indexes.list(&self.config.database_name) {
                    if let Some(wanted) = &table {
                        if !meta.table.eq_ignore_ascii_case(wanted) {
                            continue;
                        }
                    }
                    result.push(vec![
                        Value::text(&meta.table),
                        Value::text(&meta.id),
                        Value::text(meta.columns.join(", ")),
                        Value::text(&meta.driver),
                    ]);
                }
                Ok(result)
            }

            Statement::Describe(name) => {
                let table = self
                    .catalog
                    .resolve(None, &name)
                    .ok_or(PlanError::UnknownTable(name))?;
                let mut result = ResultSet::new(vec![
                    "column".into(),
                    "type".into(),
                    "nullable".into(),
                ]);
                for column in table.schema().columns() {
                    result.push(vec![
                        Value::text(&column.name),
                        Value::text(column.kind.sql_name()),
                        Value::text(if column.nullable { "YES" } else { "NO" }),
                    ]);
                }
                Ok(result)
            }
        }
    }

    /// Convenience: run one statement in a fresh context of the session.
    pub fn query(&self, session: &Arc<Session>, sql: &str) -> EngineResult<ResultSet> {
        let ctx = Context::new(session.clone());
        self.query_with_context(&ctx, sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::FixtureRepo;
    use chrono::Datelike;

    fn engine_for(fixtures: &[&FixtureRepo]) -> (Engine, Arc<Session>) {
        let index_dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::new()
            .with_database_name("gitql")
            .with_index_dir(index_dir.keep());
        for f in fixtures {
            config = config.with_directory(f.path().display().to_string());
        }
        let engine = Engine::new(config).unwrap();
        let session = Arc::new(engine.session());
        (engine, session)
    }

    fn standard_fixture() -> FixtureRepo {
        let mut fixture = FixtureRepo::empty();
        fixture.commit("one", &[("a.txt", "a1"), ("dir/b.txt", "b1")]);
        fixture.commit("two", &[("a.txt", "a2"), ("dir/b.txt", "b1")]);
        let tip = fixture.commit(
            "three",
            &[("a.txt", "a3"), ("c.txt", "c1"), ("dir/b.txt", "b1")],
        );
        fixture.branch("feature", &tip);
        fixture
    }

    #[test]
    fn test_select_refs_ordered() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let result = engine
            .query(&session, "SELECT ref_name FROM refs ORDER BY ref_name")
            .unwrap();
        let names: Vec<String> = result
            .column_values("ref_name")
            .iter()
            .map(|v| v.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["HEAD", "refs/heads/feature", "refs/heads/main"]
        );
    }

    #[test]
    fn test_join_head_history() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let result = engine
            .query(
                &session,
                "SELECT c.commit_hash FROM ref_commits r \
                 INNER JOIN commits c ON r.ref_name = 'HEAD' AND r.commit_hash = c.commit_hash",
            )
            .unwrap();
        let mut hashes: Vec<String> = result
            .column_values("commit_hash")
            .iter()
            .map(|v| v.to_string())
            .collect();
        hashes.sort();
        let mut expected: Vec<String> = fixture.commits().to_vec();
        expected.sort();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn test_join_results_match_with_and_without_squash() {
        let fixture = standard_fixture();
        let index_dir = tempfile::TempDir::new().unwrap();

        let run = |squash: bool| {
            let config = EngineConfig::new()
                .with_directory(fixture.path().display().to_string())
                .with_index_dir(index_dir.path().join(if squash { "a" } else { "b" }))
                .with_squash(squash);
            let engine = Engine::new(config).unwrap();
            let session = Arc::new(engine.session());
            let mut rows = engine
                .query(
                    &session,
                    "SELECT cb.commit_hash, b.blob_hash FROM ref_commits r \
                     INNER JOIN commit_blobs cb ON r.ref_name = 'HEAD' \
                         AND r.commit_hash = cb.commit_hash \
                     INNER JOIN blobs b ON cb.blob_hash = b.blob_hash",
                )
                .unwrap()
                .rows;
            rows.sort_by_key(|r| Value::encode_tuple(r));
            rows
        };

        let squashed = run(true);
        let generic = run(false);
        assert_eq!(squashed, generic);
        assert!(!squashed.is_empty());
    }

    #[test]
    fn test_squashed_chain_from_sql() {
        let fixture = standard_fixture();
        let index_dir = tempfile::TempDir::new().unwrap();

        let sql = "SELECT r.ref_name, c.commit_hash FROM refs r \
                   INNER JOIN ref_commits rc ON r.ref_name = rc.ref_name \
                       AND r.repository_id = rc.repository_id \
                   INNER JOIN commits c ON rc.commit_hash = c.commit_hash";

        let run = |squash: bool, sub: &str| {
            let config = EngineConfig::new()
                .with_directory(fixture.path().display().to_string())
                .with_index_dir(index_dir.path().join(sub))
                .with_squash(squash);
            let engine = Engine::new(config).unwrap();
            if squash {
                let plan = engine.plan(sql).unwrap().to_string();
                assert!(plan.contains("SquashedTable"), "plan: {}", plan);
            }
            let session = Arc::new(engine.session());
            let mut rows = engine.query(&session, sql).unwrap().rows;
            rows.sort_by_key(|r| Value::encode_tuple(r));
            rows
        };

        let squashed = run(true, "squashed");
        let generic = run(false, "generic");
        assert_eq!(squashed, generic);
        // Three refs, each walking the full three-commit history.
        assert_eq!(squashed.len(), 9);
    }

    #[test]
    fn test_group_by_blobs_per_commit() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let result = engine
            .query(
                &session,
                "SELECT COUNT(c.blob_hash) AS n, c.commit_hash FROM ref_commits r \
                 INNER JOIN commit_blobs c ON r.ref_name = 'HEAD' \
                     AND r.commit_hash = c.commit_hash \
                 GROUP BY c.commit_hash",
            )
            .unwrap();

        // Commits reach 2, 2 and 3 distinct blobs respectively.
        assert_eq!(result.len(), 3);
        let mut counts: Vec<i64> = result
            .column_values("n")
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        counts.sort();
        assert_eq!(counts, vec![2, 2, 3]);
    }

    #[test]
    fn test_subquery_first_commit_year() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let result = engine
            .query(
                &session,
                "SELECT COUNT(first_commit_year) AS c, first_commit_year FROM ( \
                   SELECT YEAR(c.commit_author_when) AS first_commit_year \
                   FROM ref_commits rc \
                   INNER JOIN commits c ON rc.commit_hash = c.commit_hash \
                   ORDER BY c.commit_author_when LIMIT 1 \
                 ) y GROUP BY first_commit_year",
            )
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.value(0, "c"), Some(&Value::Int64(1)));
        // Fixture commits are stamped in 2015.
        let year = chrono::DateTime::from_timestamp(1_427_760_000, 0)
            .unwrap()
            .year();
        assert_eq!(result.value(0, "first_commit_year"), Some(&Value::Int32(year)));
    }

    #[test]
    fn test_create_index_changes_plan_and_matches_scan() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let scan = engine
            .query(
                &session,
                "SELECT * FROM refs WHERE ref_name = 'refs/heads/main'",
            )
            .unwrap();

        engine
            .query(&session, "CREATE INDEX refs_idx ON refs(ref_name)")
            .unwrap();

        let plan = engine
            .plan("SELECT * FROM refs WHERE ref_name = 'refs/heads/main'")
            .unwrap()
            .to_string();
        assert!(plan.contains("IndexedTableAccess"), "plan: {}", plan);

        let indexed = engine
            .query(
                &session,
                "SELECT * FROM refs WHERE ref_name = 'refs/heads/main'",
            )
            .unwrap();
        assert_eq!(scan.rows, indexed.rows);
        assert_eq!(indexed.len(), 1);

        let shown = engine.query(&session, "SHOW INDEXES FROM refs").unwrap();
        assert_eq!(shown.len(), 1);

        engine
            .query(&session, "DROP INDEX refs_idx ON refs")
            .unwrap();
        let shown = engine.query(&session, "SHOW INDEXES").unwrap();
        assert!(shown.is_empty());
    }

    #[test]
    fn test_cancellation_mid_query() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let ctx = Context::new(session.clone());
        let token = ctx.cancel_token();
        token.cancel();
        let err = engine
            .query_with_context(&ctx, "SELECT COUNT(*) FROM files")
            .unwrap_err();
        assert!(matches!(err, EngineError::Execute(ExecuteError::Cancelled)));
    }

    #[test]
    fn test_skip_git_errors_is_per_session() {
        let fixture = FixtureRepo::with_history(&["one", "two"]);
        // Break the store: remove the blob only the first commit reaches.
        let repo = fixture.open();
        let root_commit = repo.commit_data(&fixture.commits()[0]).unwrap();
        let entries = repo.tree_entry_list(&root_commit.tree_hash).unwrap();
        let missing_blob = entries[0].hash.clone();
        drop(entries);
        drop(root_commit);
        drop(repo);
        fixture.delete_object(&missing_blob);

        let (engine, _session) = engine_for(&[&fixture]);

        let strict = Arc::new(engine.session());
        let lenient = Arc::new(engine.session().with_skip_git_errors(true));

        // Same pool, different sessions, different result sets.
        let strict_result = engine.query(&strict, "SELECT file_path FROM files");
        assert!(strict_result.is_err());

        let lenient_result = engine
            .query(&lenient, "SELECT file_path FROM files")
            .unwrap();
        assert_eq!(lenient_result.len(), 1);
    }

    #[test]
    fn test_information_schema() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let tables = engine
            .query(
                &session,
                "SELECT table_name FROM information_schema.tables ORDER BY table_name",
            )
            .unwrap();
        let names: Vec<String> = tables
            .column_values("table_name")
            .iter()
            .map(|v| v.to_string())
            .collect();
        assert!(names.contains(&"refs".to_string()));
        assert!(names.contains(&"files".to_string()));

        let columns = engine
            .query(
                &session,
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_name = 'refs'",
            )
            .unwrap();
        assert_eq!(columns.len(), 3);
    }

    #[test]
    fn test_show_tables_and_describe() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let tables = engine.query(&session, "SHOW TABLES").unwrap();
        assert_eq!(tables.len(), 10);

        let desc = engine.query(&session, "DESCRIBE commits").unwrap();
        assert_eq!(desc.len(), 11);
    }

    #[test]
    fn test_read_only_blocks_index_ddl() {
        let fixture = standard_fixture();
        let index_dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::new()
            .with_directory(fixture.path().display().to_string())
            .with_index_dir(index_dir.keep())
            .with_read_only(true);
        let engine = Engine::new(config).unwrap();
        let session = Arc::new(engine.session());

        let err = engine
            .query(&session, "CREATE INDEX i ON refs(ref_name)")
            .unwrap_err();
        assert!(matches!(err, EngineError::ReadOnly));
    }

    #[test]
    fn test_files_table_end_to_end() {
        let fixture = standard_fixture();
        let (engine, session) = engine_for(&[&fixture]);

        let result = engine
            .query(
                &session,
                "SELECT DISTINCT file_path FROM files ORDER BY file_path",
            )
            .unwrap();
        let paths: Vec<String> = result
            .column_values("file_path")
            .iter()
            .map(|v| v.to_string())
            .collect();
        assert_eq!(paths, vec!["a.txt", "c.txt", "dir/b.txt"]);
    }

    #[test]
    fn test_parallelism_preserves_multiset() {
        let a = standard_fixture();
        let b = FixtureRepo::with_history(&["x", "y"]);
        let index_dir = tempfile::TempDir::new().unwrap();

        let run = |parallelism: usize, sub: &str| {
            let config = EngineConfig::new()
                .with_directory(a.path().display().to_string())
                .with_directory(b.path().display().to_string())
                .with_index_dir(index_dir.path().join(sub))
                .with_parallelism(parallelism);
            let engine = Engine::new(config).unwrap();
            let session = Arc::new(engine.session());
            let mut rows = engine
                .query(&session, "SELECT repository_id, commit_hash FROM commits")
                .unwrap()
                .rows;
            rows.sort_by_key(|r| Value::encode_tuple(r));
            rows
        };

        assert_eq!(run(1, "serial"), run(4, "parallel"));
    }
}
