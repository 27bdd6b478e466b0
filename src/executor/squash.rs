//! Execution of squashed join chains: one fused walk of the git object
//! graph per repository.
//!
//! The iterator keeps one cursor per stage. The deepest open stage is
//! pulled for its next fragment; exhaustion pops back to the parent stage,
//! and every new parent fragment re-opens the stages below it. Each stage
//! performs O(1) work per pull and the cancellation flag is observed on
//! every step.

use std::sync::Arc;

use crate::planner::{EntriesFrom, SquashedTable, StageInput, StageKind};
use crate::session::Context;
use crate::sql::{Row, Value};
use crate::storage::{RefInfo, Repository, StorageResult, TreeEntryData};
use crate::tables::commit_blobs::BlobWalk;
use crate::tables::commit_trees::TreeWalk;
use crate::tables::MAX_BLOB_CONTENT;

use super::error::ExecuteResult;
use super::iter::RowIter;

pub struct SquashIter {
    ctx: Context,
    spec: SquashedTable,
    /// stage index per output leaf position.
    stage_by_leaf: Vec<usize>,
    repo_ids: std::vec::IntoIter<String>,
    repo: Option<Repository>,
    cursors: Vec<Option<StageCursor>>,
    fragments: Vec<Row>,
    /// Stage currently being pulled; -1 means a new repository is needed.
    depth: isize,
}

impl SquashIter {
    pub fn new(ctx: &Context, spec: SquashedTable) -> Self {
        let stage_count = spec.stages.len();
        let mut stage_by_leaf = vec![0usize; stage_count];
        for (stage, &leaf) in spec.leaf_of_stage.iter().enumerate() {
            stage_by_leaf[leaf] = stage;
        }
        Self {
            ctx: ctx.clone(),
            spec,
            stage_by_leaf,
            repo_ids: ctx.repo_ids().into_iter(),
            repo: None,
            cursors: vec![],
            fragments: vec![],
            depth: -1,
        }
    }

    fn input_value(&self, input: StageInput) -> String {
        self.fragments[input.stage][input.column].to_string()
    }

    fn next_repo(&mut self) -> ExecuteResult<bool> {
        loop {
            let id = match self.repo_ids.next() {
                Some(id) => id,
                None => return Ok(false),
            };
            match self.ctx.pool().open(&id) {
                Ok(repo) => {
                    self.repo = Some(repo);
                    let stages = self.spec.stages.len();
                    self.cursors = (0..stages).map(|_| None).collect();
                    self.fragments = vec![Vec::new(); stages];
                    match self.open_stage(0) {
                        Ok(cursor) => {
                            self.cursors[0] = Some(cursor);
                            self.depth = 0;
                            return Ok(true);
                        }
                        Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                            tracing::warn!(repository = %id, error = %e, "skipping repository");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                    tracing::warn!(repository = %id, error = %e, "skipping repository");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn open_stage(&self, stage: usize) -> StorageResult<StageCursor> {
        let repo = self.repo.as_ref().expect("repository open");
        let kind = &self.spec.stages[stage].kind;

        Ok(match kind {
            StageKind::Repositories => {
                StageCursor::Once(Some(vec![Value::text(repo.id())]))
            }

            StageKind::Refs => {
                let rows = repo
                    .ref_infos()?
                    .into_iter()
                    .map(|r| {
                        vec![
                            Value::text(repo.id()),
                            Value::text(&r.name),
                            Value::text(&r.hash),
                        ]
                    })
                    .collect();
                StageCursor::Rows(rows, 0)
            }

            StageKind::RefCommits { by_ref, by_commit } => {
                let mut refs = repo.ref_infos()?;
                if let Some(input) = by_ref {
                    let wanted = self.input_value(*input);
                    refs.retain(|r| r.name == wanted);
                }
                let match_commit = by_commit.map(|input| self.input_value(input));
                StageCursor::RefWalk {
                    refs,
                    rpos: 0,
                    current: None,
                    index: 0,
                    match_commit,
                }
            }

            StageKind::Commits { by_commit } => match by_commit {
                Some(input) => {
                    let hash = self.input_value(*input);
                    match repo.commit_data(&hash) {
                        Ok(data) => StageCursor::Once(Some(
                            crate::tables::commits::commit_row(repo.id(), &data),
                        )),
                        Err(e) if e.is_not_found() => StageCursor::Once(None),
                        Err(e) => return Err(e),
                    }
                }
                None => StageCursor::CommitList {
                    ids: repo.commit_ids()?,
                    pos: 0,
                },
            },

            StageKind::CommitTrees { by_commit } => {
                let hash = self.input_value(*by_commit);
                match repo.commit_data(&hash) {
                    Ok(data) => StageCursor::TreeWalkCursor {
                        commit: hash,
                        walk: TreeWalk::new(data.tree_hash.clone()),
                    },
                    Err(e) if e.is_not_found() => StageCursor::Once(None),
                    Err(e) => return Err(e),
                }
            }

            StageKind::CommitBlobs { by_commit } => {
                let hash = self.input_value(*by_commit);
                match repo.commit_data(&hash) {
                    Ok(data) => StageCursor::BlobWalkCursor {
                        commit: hash,
                        walk: BlobWalk::new(data.tree_hash.clone()),
                    },
                    Err(e) if e.is_not_found() => StageCursor::Once(None),
                    Err(e) => return Err(e),
                }
            }

            StageKind::TreeEntries { from } => match from {
                EntriesFrom::AllTrees => StageCursor::AllTreeEntries {
                    trees: repo.tree_ids()?,
                    tpos: 0,
                    current: None,
                },
                EntriesFrom::CommitRoot(input) | EntriesFrom::Walked(input) => {
                    let tree = self.input_value(*input);
                    match repo.tree_entry_list(&tree) {
                        Ok(entries) => StageCursor::TreeEntries {
                            tree,
                            entries,
                            pos: 0,
                        },
                        Err(e) if e.is_not_found() => StageCursor::Once(None),
                        Err(e) => return Err(e),
                    }
                }
            },

            StageKind::Blobs { by_blob } => {
                let hash = self.input_value(*by_blob);
                // Tree entries pointing at non-blobs (submodules) simply
                // produce no match, like the generic join.
                match repo.blob_data(&hash, true, MAX_BLOB_CONTENT) {
                    Ok(data) => StageCursor::Once(Some(vec![
                        Value::text(repo.id()),
                        Value::text(&data.hash),
                        Value::Int64(data.size),
                        Value::Blob(data.content),
                    ])),
                    Err(e) if e.is_not_found() => StageCursor::Once(None),
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn assemble(&self) -> Row {
        let mut out = Vec::with_capacity(self.spec.schema.len());
        for &stage in &self.stage_by_leaf {
            out.extend(self.fragments[stage].iter().cloned());
        }
        out
    }
}

impl RowIter for SquashIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        'outer: loop {
            self.ctx.check()?;

            if self.depth < 0 {
                self.repo = None;
                if !self.next_repo()? {
                    return Ok(None);
                }
            }

            let depth = self.depth as usize;
            let repo = self.repo.as_ref().expect("repository open");
            let cursor = self.cursors[depth].as_mut().expect("cursor open");

            let fragment = match cursor.next(repo) {
                Ok(f) => f,
                Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                    tracing::warn!(repository = %repo.id(), error = %e, "skipping squash fragment");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match fragment {
                None => {
                    self.cursors[depth] = None;
                    self.depth -= 1;
                }
                Some(fragment) => {
                    for filter in &self.spec.stages[depth].filters {
                        if !filter.eval_truthy(&self.ctx, &fragment)? {
                            continue 'outer;
                        }
                    }
                    self.fragments[depth] = fragment;

                    if depth + 1 == self.spec.stages.len() {
                        return Ok(Some(self.assemble()));
                    }

                    let next = depth + 1;
                    let cursor = match self.open_stage(next) {
                        Ok(c) => c,
                        Err(e) if e.is_git() && self.ctx.skip_git_errors() => {
                            tracing::warn!(error = %e, "skipping squash expansion");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    self.cursors[next] = Some(cursor);
                    self.depth = next as isize;
                }
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.repo = None;
        self.cursors.clear();
        self.fragments.clear();
        self.depth = -1;
        // Drain remaining repositories so the iterator stays exhausted.
        while self.repo_ids.next().is_some() {}
        Ok(())
    }
}

/// Per-stage cursor state. Every variant yields fragment rows matching the
/// stage's table schema.
enum StageCursor {
    /// Zero or one fragment (repositories, point lookups).
    Once(Option<Row>),
    /// Pre-materialized fragments (refs).
    Rows(Vec<Row>, usize),
    /// First-parent walks over a set of refs.
    RefWalk {
        refs: Vec<RefInfo>,
        rpos: usize,
        current: Option<String>,
        index: i64,
        /// When set, only fragments with this commit hash are emitted (the
        /// chain joined ref_commits on a commit hash).
        match_commit: Option<String>,
    },
    /// Full commit enumeration (commits as the chain root).
    CommitList { ids: Vec<String>, pos: usize },
    TreeWalkCursor { commit: String, walk: TreeWalk },
    BlobWalkCursor { commit: String, walk: BlobWalk },
    /// Entries of one tree.
    TreeEntries {
        tree: String,
        entries: Arc<Vec<TreeEntryData>>,
        pos: usize,
    },
    /// Entries of every tree (tree_entries as the chain root).
    AllTreeEntries {
        trees: Vec<String>,
        tpos: usize,
        current: Option<(String, Arc<Vec<TreeEntryData>>, usize)>,
    },
}

impl StageCursor {
    fn next(&mut self, repo: &Repository) -> StorageResult<Option<Row>> {
        match self {
            StageCursor::Once(row) => Ok(row.take()),

            StageCursor::Rows(rows, pos) => {
                if *pos >= rows.len() {
                    return Ok(None);
                }
                let row = rows[*pos].clone();
                *pos += 1;
                Ok(Some(row))
            }

            StageCursor::RefWalk {
                refs,
                rpos,
                current,
                index,
                match_commit,
            } => loop {
                if current.is_none() {
                    if *rpos >= refs.len() {
                        return Ok(None);
                    }
                    *current = Some(refs[*rpos].hash.clone());
                    *index = 0;
                }
                let hash = current.clone().expect("walk position");
                let ref_name = refs[*rpos].name.clone();
                match repo.commit_data(&hash) {
                    Ok(data) => {
                        let row = vec![
                            Value::text(repo.id()),
                            Value::text(&ref_name),
                            Value::text(&data.hash),
                            Value::Int64(*index),
                        ];
                        *current = data.parents.first().cloned();
                        *index += 1;
                        if current.is_none() {
                            *rpos += 1;
                        }
                        let emit = match_commit
                            .as_ref()
                            .map_or(true, |wanted| *wanted == data.hash);
                        if emit {
                            return Ok(Some(row));
                        }
                    }
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(
                            repository = repo.id(),
                            reference = %ref_name,
                            commit = %hash,
                            "first-parent walk hit a missing commit"
                        );
                        *current = None;
                        *rpos += 1;
                    }
                    Err(e) => return Err(e),
                }
            },

            StageCursor::CommitList { ids, pos } => {
                if *pos >= ids.len() {
                    return Ok(None);
                }
                let hash = &ids[*pos];
                *pos += 1;
                let data = repo.commit_data(hash)?;
                Ok(Some(crate::tables::commits::commit_row(repo.id(), &data)))
            }

            StageCursor::TreeWalkCursor { commit, walk } => {
                Ok(walk.next_tree(repo)?.map(|tree| {
                    vec![
                        Value::text(repo.id()),
                        Value::text(commit.as_str()),
                        Value::text(tree),
                    ]
                }))
            }

            StageCursor::BlobWalkCursor { commit, walk } => {
                Ok(walk.next_blob(repo)?.map(|blob| {
                    vec![
                        Value::text(repo.id()),
                        Value::text(commit.as_str()),
                        Value::text(blob),
                    ]
                }))
            }

            StageCursor::TreeEntries { tree, entries, pos } => {
                if *pos >= entries.len() {
                    return Ok(None);
                }
                let row = crate::tables::tree_entries::entry_row(repo.id(), tree, &entries[*pos]);
                *pos += 1;
                Ok(Some(row))
            }

            StageCursor::AllTreeEntries {
                trees,
                tpos,
                current,
            } => loop {
                if current.is_none() {
                    if *tpos >= trees.len() {
                        return Ok(None);
                    }
                    let tree = trees[*tpos].clone();
                    *tpos += 1;
                    let entries = repo.tree_entry_list(&tree)?;
                    *current = Some((tree, entries, 0));
                }
                let (tree, entries, pos) = current.as_mut().expect("tree open");
                if *pos >= entries.len() {
                    *current = None;
                    continue;
                }
                let row = crate::tables::tree_entries::entry_row(repo.id(), tree, &entries[*pos]);
                *pos += 1;
                return Ok(Some(row));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::collect_rows;
    use crate::executor::operators::run_to_rows;
    use crate::planner::{squash_joins, Plan, TableNode};
    use crate::sql::{Expr, ValueKind};
    use crate::storage::testutil::FixtureRepo;
    use crate::storage::RepositoryPool;
    use std::sync::Arc as StdArc;

    fn fixture_ctx() -> (FixtureRepo, Context) {
        let mut fixture = FixtureRepo::empty();
        fixture.commit("one", &[("a.txt", "a1"), ("dir/b.txt", "b1")]);
        let tip = fixture.commit("two", &[("a.txt", "a2"), ("dir/b.txt", "b1")]);
        fixture.branch("feature", &tip);
        let pool = StdArc::new(RepositoryPool::default());
        pool.add_repository(fixture.path()).unwrap();
        (fixture, Context::for_pool(pool))
    }

    fn scan(table: crate::catalog::Table) -> Plan {
        Plan::Table(TableNode::new(table, None))
    }

    fn field(offset: usize, table: crate::catalog::Table, column: &str) -> Expr {
        let local = table.schema().positions_of(None, column)[0];
        Expr::Field {
            index: offset + local,
            kind: ValueKind::Text,
            name: column.into(),
        }
    }

    /// Execute a join plan generically and squashed, comparing multisets.
    fn assert_squash_equivalent(plan: Plan, ctx: &Context) -> usize {
        let generic = run_to_rows(&plan, ctx).unwrap();
        let squashed_plan = squash_joins(plan).unwrap();
        assert!(
            matches!(squashed_plan, Plan::Squashed(_)),
            "chain did not squash: {}",
            squashed_plan
        );
        let squashed = run_to_rows(&squashed_plan, ctx).unwrap();

        let key = |r: &Row| Value::encode_tuple(r);
        let mut a = generic.clone();
        let mut b = squashed;
        a.sort_by_key(key);
        b.sort_by_key(key);
        assert_eq!(a, b);
        generic.len()
    }

    #[test]
    fn test_refs_ref_commits_by_name() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Refs.schema().len();
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "ref_name"),
                field(w, Table::RefCommits, "ref_name"),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::RefCommits)),
        };
        let n = assert_squash_equivalent(plan, &ctx);
        // HEAD, main and feature each walk two commits.
        assert_eq!(n, 6);
    }

    #[test]
    fn test_refs_ref_commits_by_commit_hash() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Refs.schema().len();
        // Joining on the tip hash matches every ref's walk that passes
        // through the tip, not just the walk of the same ref.
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "commit_hash"),
                field(w, Table::RefCommits, "commit_hash"),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::RefCommits)),
        };
        assert_squash_equivalent(plan, &ctx);
    }

    #[test]
    fn test_refs_commits_chain_with_seed_filter() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Refs.schema().len();
        let plan = Plan::InnerJoin {
            condition: Expr::and(
                Expr::eq(
                    field(0, Table::Refs, "ref_name"),
                    Expr::lit(Value::text("HEAD")),
                ),
                Expr::eq(
                    field(0, Table::Refs, "commit_hash"),
                    field(w, Table::Commits, "commit_hash"),
                ),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::Commits)),
        };
        let n = assert_squash_equivalent(plan, &ctx);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_commits_commit_trees_tree_entries_blobs_chain() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w_c = Table::Commits.schema().len();
        let w_ct = Table::CommitTrees.schema().len();
        let w_te = Table::TreeEntries.schema().len();

        let commits_trees = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Commits, "commit_hash"),
                field(w_c, Table::CommitTrees, "commit_hash"),
            ),
            left: Box::new(scan(Table::Commits)),
            right: Box::new(scan(Table::CommitTrees)),
        };
        let with_entries = Plan::InnerJoin {
            condition: Expr::eq(
                field(w_c, Table::CommitTrees, "tree_hash"),
                field(w_c + w_ct, Table::TreeEntries, "tree_hash"),
            ),
            left: Box::new(commits_trees),
            right: Box::new(scan(Table::TreeEntries)),
        };
        let full = Plan::InnerJoin {
            condition: Expr::eq(
                field(w_c + w_ct, Table::TreeEntries, "blob_hash"),
                field(w_c + w_ct + w_te, Table::Blobs, "blob_hash"),
            ),
            left: Box::new(with_entries),
            right: Box::new(scan(Table::Blobs)),
        };
        assert_squash_equivalent(full, &ctx);
    }

    #[test]
    fn test_commits_root_tree_entries() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Commits.schema().len();
        // commits.tree_hash joins only the root tree's entries.
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Commits, "tree_hash"),
                field(w, Table::TreeEntries, "tree_hash"),
            ),
            left: Box::new(scan(Table::Commits)),
            right: Box::new(scan(Table::TreeEntries)),
        };
        let n = assert_squash_equivalent(plan, &ctx);
        // Each commit's root tree has entries a.txt and dir.
        assert_eq!(n, 4);
    }

    #[test]
    fn test_squash_cancellation() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Refs.schema().len();
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "ref_name"),
                field(w, Table::RefCommits, "ref_name"),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::RefCommits)),
        };
        let squashed = squash_joins(plan).unwrap();
        let mut iter = crate::executor::operators::build_iter(&squashed, &ctx).unwrap();
        ctx.cancel_token().cancel();
        assert!(matches!(
            iter.next_row(),
            Err(crate::executor::ExecuteError::Cancelled)
        ));
    }

    #[test]
    fn test_close_makes_iterator_exhausted() {
        use crate::catalog::Table;
        let (_fixture, ctx) = fixture_ctx();
        let w = Table::Refs.schema().len();
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "ref_name"),
                field(w, Table::RefCommits, "ref_name"),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::RefCommits)),
        };
        let squashed = squash_joins(plan).unwrap();
        match squashed {
            Plan::Squashed(spec) => {
                let mut iter = SquashIter::new(&ctx, spec);
                assert!(iter.next_row().unwrap().is_some());
                iter.close().unwrap();
                iter.close().unwrap();
                assert!(collect_rows(&mut iter).unwrap().is_empty());
            }
            other => panic!("expected squashed plan, got {}", other),
        }
    }
}
