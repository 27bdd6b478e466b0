//! The squash-joins rule.
//!
//! A chain of inner joins over git tables whose conditions are equalities on
//! the natural keys (ref to its commits, commit to its trees, tree to its
//! entries, entry to its blob) is logically one walk of the object graph.
//! This rule recognizes such chains and replaces them with a single fused
//! table; the executor walks every stage once per repository.
//!
//! Matching is table-driven: the admissible (table, column) edge pairs are
//! an explicit list, and anything outside it leaves the join to the generic
//! executor.

use crate::catalog::Table;
use crate::sql::{BinaryOp, Expr, Schema};

use super::error::PlanResult;
use super::nodes::{Plan, TableNode};

/// Canonical walk rank per table. Lower rank opens earlier.
fn stage_rank(table: Table) -> Option<u8> {
    Some(match table {
        Table::Repositories => 0,
        Table::Refs => 1,
        Table::RefCommits => 2,
        Table::Commits => 3,
        Table::CommitTrees | Table::CommitBlobs => 4,
        Table::TreeEntries => 5,
        Table::Blobs => 6,
        _ => return None,
    })
}

/// Tables allowed to open a chain without an input key.
fn can_root(table: Table) -> bool {
    matches!(
        table,
        Table::Repositories | Table::Refs | Table::Commits | Table::TreeEntries
    )
}

/// The admissible equality edges, as (table, column) pairs. Order within a
/// pair does not matter.
const EDGES: &[((Table, &str), (Table, &str))] = &[
    ((Table::Refs, "commit_hash"), (Table::RefCommits, "commit_hash")),
    ((Table::Refs, "commit_hash"), (Table::Commits, "commit_hash")),
    ((Table::Refs, "commit_hash"), (Table::CommitTrees, "commit_hash")),
    ((Table::Refs, "commit_hash"), (Table::CommitBlobs, "commit_hash")),
    ((Table::Refs, "ref_name"), (Table::RefCommits, "ref_name")),
    ((Table::RefCommits, "commit_hash"), (Table::Commits, "commit_hash")),
    ((Table::RefCommits, "commit_hash"), (Table::CommitTrees, "commit_hash")),
    ((Table::RefCommits, "commit_hash"), (Table::CommitBlobs, "commit_hash")),
    ((Table::Commits, "commit_hash"), (Table::CommitTrees, "commit_hash")),
    ((Table::Commits, "commit_hash"), (Table::CommitBlobs, "commit_hash")),
    ((Table::Commits, "tree_hash"), (Table::TreeEntries, "tree_hash")),
    ((Table::CommitTrees, "tree_hash"), (Table::TreeEntries, "tree_hash")),
    ((Table::TreeEntries, "blob_hash"), (Table::Blobs, "blob_hash")),
    ((Table::CommitBlobs, "blob_hash"), (Table::Blobs, "blob_hash")),
];

/// Where a stage takes its input key from: a column of an earlier stage's
/// emitted fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageInput {
    pub stage: usize,
    pub column: usize,
}

/// How a tree_entries stage finds its trees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntriesFrom {
    /// Root stage: every tree object of the repository.
    AllTrees,
    /// Entries of a commit's root tree (edge on commits.tree_hash).
    CommitRoot(StageInput),
    /// Entries of each tree emitted by a commit_trees walk.
    Walked(StageInput),
}

/// Per-table stage behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageKind {
    Repositories,
    Refs,
    RefCommits {
        by_ref: Option<StageInput>,
        by_commit: Option<StageInput>,
    },
    Commits {
        by_commit: Option<StageInput>,
    },
    CommitTrees {
        by_commit: StageInput,
    },
    CommitBlobs {
        by_commit: StageInput,
    },
    TreeEntries {
        from: EntriesFrom,
    },
    Blobs {
        by_blob: StageInput,
    },
}

/// One stage of a fused walk.
#[derive(Debug, Clone, PartialEq)]
pub struct SquashStage {
    pub table: Table,
    pub kind: StageKind,
    /// Filters over this stage's fragment, resolved against the table
    /// schema. Includes the filters originally pushed into the leaf.
    pub filters: Vec<Expr>,
}

/// The fused replacement for an admissible join chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SquashedTable {
    /// Stages in canonical walk order.
    pub stages: Vec<SquashStage>,
    /// For each stage, the position of its fragment in the output row
    /// (original left-to-right leaf order).
    pub leaf_of_stage: Vec<usize>,
    /// Concatenation of the leaf schemas in original leaf order.
    pub schema: Schema,
}

/// Rewrite admissible join chains into squashed tables. Matching is
/// top-down so the widest chain fuses as one walk; a join that does not
/// match is kept and its subtrees are tried independently.
pub fn squash_joins(plan: Plan) -> PlanResult<Plan> {
    if matches!(plan, Plan::InnerJoin { .. }) {
        if let Some(squashed) = try_squash(&plan) {
            return Ok(Plan::Squashed(squashed));
        }
    }
    plan.map_children(&squash_joins)
}

/// A chain candidate: leaves in original order plus all join conjuncts with
/// field indices over the concatenated leaf schema.
struct Chain {
    leaves: Vec<TableNode>,
    conjuncts: Vec<Expr>,
}

fn collect_chain(plan: &Plan, conjuncts: &mut Vec<Expr>, leaves: &mut Vec<TableNode>) -> bool {
    match plan {
        Plan::InnerJoin {
            condition,
            left,
            right,
        } => {
            if !collect_chain(left, conjuncts, leaves) {
                return false;
            }
            let offset: usize = leaves.iter().map(|l| l.schema().len()).sum();
            let mut right_leaves = Vec::new();
            let mut right_conjuncts = Vec::new();
            if !collect_chain(right, &mut right_conjuncts, &mut right_leaves) {
                return false;
            }
            // Shift everything gathered under the right subtree into the
            // coordinates of this join's concatenated schema.
            for c in right_conjuncts {
                conjuncts.push(c.map_field_indices(&|i| i + offset));
            }
            leaves.extend(right_leaves);
            conjuncts.extend(condition.clone().split_and());
            true
        }
        Plan::Table(node) if stage_rank(node.table).is_some() && node.index.is_none() => {
            leaves.push(node.clone());
            true
        }
        Plan::Filter { predicate, child } => match child.as_ref() {
            Plan::Table(node) if stage_rank(node.table).is_some() && node.index.is_none() => {
                let mut node = node.clone();
                node.filters.extend(predicate.clone().split_and());
                leaves.push(node);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn try_squash(plan: &Plan) -> Option<SquashedTable> {
    let mut conjuncts = Vec::new();
    let mut leaves = Vec::new();
    if !collect_chain(plan, &mut conjuncts, &mut leaves) {
        return None;
    }
    if leaves.len() < 2 {
        return None;
    }

    // Reject duplicate table kinds and the trees/blobs double expansion;
    // both go to the generic join.
    let mut kinds: Vec<Table> = leaves.iter().map(|l| l.table).collect();
    kinds.sort_by_key(|t| format!("{:?}", t));
    kinds.dedup();
    if kinds.len() != leaves.len() {
        return None;
    }
    if leaves.iter().any(|l| l.table == Table::CommitTrees)
        && leaves.iter().any(|l| l.table == Table::CommitBlobs)
    {
        return None;
    }

    let chain = Chain { leaves, conjuncts };
    build_squashed(chain)
}

/// Map of a global field index to (leaf position, leaf-local index).
fn locate(chain: &Chain, index: usize) -> Option<(usize, usize)> {
    let mut offset = 0;
    for (leaf_pos, leaf) in chain.leaves.iter().enumerate() {
        let width = leaf.schema().len();
        if index < offset + width {
            return Some((leaf_pos, index - offset));
        }
        offset += width;
    }
    None
}

fn build_squashed(chain: Chain) -> Option<SquashedTable> {
    // Stage order: leaves sorted by canonical rank (stable for equal ranks,
    // though equal ranks were rejected above).
    let mut order: Vec<usize> = (0..chain.leaves.len()).collect();
    order.sort_by_key(|&i| stage_rank(chain.leaves[i].table).expect("git leaf"));

    if !can_root(chain.leaves[order[0]].table) {
        return None;
    }

    // stage index per leaf position
    let mut stage_of_leaf = vec![0usize; chain.leaves.len()];
    for (stage, &leaf) in order.iter().enumerate() {
        stage_of_leaf[leaf] = stage;
    }

    // Classify every conjunct: an admissible cross-leaf equality becomes an
    // edge, a single-leaf predicate becomes a stage filter, anything else
    // disqualifies the chain.
    struct Edge {
        from_stage: usize,
        from_column: usize,
        to_stage: usize,
        to_column_name: String,
    }
    let mut edges: Vec<Edge> = Vec::new();
    let mut stage_filters: Vec<Vec<Expr>> = vec![Vec::new(); chain.leaves.len()];

    for conjunct in &chain.conjuncts {
        if let Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } = conjunct
        {
            if let (Expr::Field { index: a, .. }, Expr::Field { index: b, .. }) =
                (left.as_ref(), right.as_ref())
            {
                let (leaf_a, col_a) = locate(&chain, *a)?;
                let (leaf_b, col_b) = locate(&chain, *b)?;
                if leaf_a != leaf_b {
                    let table_a = chain.leaves[leaf_a].table;
                    let table_b = chain.leaves[leaf_b].table;
                    let name_a = table_a.schema().columns()[col_a].name.clone();
                    let name_b = table_b.schema().columns()[col_b].name.clone();

                    // repository_id equalities hold per construction: the
                    // walk never leaves the current repository.
                    if name_a == "repository_id" && name_b == "repository_id" {
                        continue;
                    }

                    let admissible = EDGES.iter().any(|((t1, c1), (t2, c2))| {
                        (*t1 == table_a && *c1 == name_a && *t2 == table_b && *c2 == name_b)
                            || (*t1 == table_b && *c1 == name_b && *t2 == table_a && *c2 == name_a)
                    });
                    if !admissible {
                        return None;
                    }

                    // Input flows from the earlier stage to the later one.
                    let (sa, sb) = (stage_of_leaf[leaf_a], stage_of_leaf[leaf_b]);
                    let (from_stage, from_col, to_stage, to_name) = if sa < sb {
                        (sa, col_a, sb, name_b)
                    } else {
                        (sb, col_b, sa, name_a)
                    };
                    edges.push(Edge {
                        from_stage,
                        from_column: from_col,
                        to_stage,
                        to_column_name: to_name,
                    });
                    continue;
                }
            }
        }

        // Not an edge: acceptable only when it touches a single leaf.
        let indices = conjunct.field_indices();
        let mut leaf_hit: Option<usize> = None;
        for index in &indices {
            let (leaf, _) = locate(&chain, *index)?;
            match leaf_hit {
                None => leaf_hit = Some(leaf),
                Some(prev) if prev != leaf => return None,
                _ => {}
            }
        }
        let leaf = leaf_hit?;
        let offset: usize = chain.leaves[..leaf].iter().map(|l| l.schema().len()).sum();
        stage_filters[leaf].push(conjunct.clone().map_field_indices(&|i| i - offset));
    }

    // Assemble per-stage inputs from the edges.
    let mut stages = Vec::with_capacity(order.len());
    for (stage_idx, &leaf_idx) in order.iter().enumerate() {
        let leaf = &chain.leaves[leaf_idx];
        let table = leaf.table;

        let input_on = |column: &str| -> Option<StageInput> {
            let mut found: Option<StageInput> = None;
            for edge in &edges {
                if edge.to_stage == stage_idx && edge.to_column_name == column {
                    let candidate = StageInput {
                        stage: edge.from_stage,
                        column: edge.from_column,
                    };
                    match found {
                        None => found = Some(candidate),
                        // Two distinct sources for one slot: ambiguous.
                        Some(existing) if existing != candidate => return None,
                        _ => {}
                    }
                }
            }
            found
        };

        let kind = match table {
            Table::Repositories => StageKind::Repositories,
            Table::Refs => StageKind::Refs,
            Table::RefCommits => {
                let by_ref = input_on("ref_name");
                let by_commit = input_on("commit_hash");
                if by_ref.is_none() && by_commit.is_none() {
                    return None;
                }
                StageKind::RefCommits { by_ref, by_commit }
            }
            Table::Commits => {
                let by_commit = input_on("commit_hash");
                if by_commit.is_none() && stage_idx != 0 {
                    return None;
                }
                StageKind::Commits { by_commit }
            }
            Table::CommitTrees => StageKind::CommitTrees {
                by_commit: input_on("commit_hash")?,
            },
            Table::CommitBlobs => StageKind::CommitBlobs {
                by_commit: input_on("commit_hash")?,
            },
            Table::TreeEntries => {
                let from = match input_on("tree_hash") {
                    Some(input) => {
                        let source_table = chain.leaves[order[input.stage]].table;
                        match source_table {
                            Table::Commits => EntriesFrom::CommitRoot(input),
                            Table::CommitTrees => EntriesFrom::Walked(input),
                            _ => return None,
                        }
                    }
                    None if stage_idx == 0 => EntriesFrom::AllTrees,
                    None => return None,
                };
                StageKind::TreeEntries { from }
            }
            Table::Blobs => StageKind::Blobs {
                by_blob: input_on("blob_hash")?,
            },
            _ => return None,
        };

        let mut filters = leaf.filters.clone();
        filters.extend(stage_filters[leaf_idx].iter().cloned());
        stages.push(SquashStage {
            table,
            kind,
            filters,
        });
    }

    // Connectivity of the commit/tree/blob stages is enforced during
    // construction above (a missing input aborts); what remains is that a
    // ref_commits walk needs refs to seed it.
    for (stage_idx, stage) in stages.iter().enumerate() {
        if matches!(stage.kind, StageKind::RefCommits { .. })
            && !stages[..stage_idx].iter().any(|s| s.table == Table::Refs)
        {
            return None;
        }
    }

    // Output schema: leaf schemas in original left-to-right order.
    let mut schema = Schema::default();
    for leaf in &chain.leaves {
        schema = schema.join(&leaf.schema());
    }

    let leaf_of_stage: Vec<usize> = order;
    Some(SquashedTable {
        stages,
        leaf_of_stage,
        schema,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::nodes::TableNode;
    use crate::sql::{Value, ValueKind};

    fn scan(table: Table) -> Plan {
        Plan::Table(TableNode::new(table, None))
    }

    fn field(schema_offset: usize, table: Table, column: &str) -> Expr {
        let schema = table.schema();
        let local = schema.positions_of(None, column)[0];
        Expr::Field {
            index: schema_offset + local,
            kind: ValueKind::Text,
            name: column.into(),
        }
    }

    fn refs_refcommits_join() -> Plan {
        // refs r INNER JOIN ref_commits rc
        //   ON r.ref_name = rc.ref_name AND r.repository_id = rc.repository_id
        let refs_width = Table::Refs.schema().len();
        let cond = Expr::and(
            Expr::eq(
                field(0, Table::Refs, "ref_name"),
                field(refs_width, Table::RefCommits, "ref_name"),
            ),
            Expr::eq(
                field(0, Table::Refs, "repository_id"),
                field(refs_width, Table::RefCommits, "repository_id"),
            ),
        );
        Plan::InnerJoin {
            condition: cond,
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::RefCommits)),
        }
    }

    #[test]
    fn test_admissible_pair_is_squashed() {
        let plan = squash_joins(refs_refcommits_join()).unwrap();
        match &plan {
            Plan::Squashed(squashed) => {
                assert_eq!(squashed.stages.len(), 2);
                assert_eq!(squashed.stages[0].table, Table::Refs);
                assert_eq!(squashed.stages[1].table, Table::RefCommits);
                match squashed.stages[1].kind {
                    StageKind::RefCommits { by_ref, by_commit } => {
                        assert!(by_ref.is_some());
                        assert!(by_commit.is_none());
                    }
                    _ => panic!("wrong stage kind"),
                }
            }
            other => panic!("expected squashed table, got {}", other),
        }
    }

    #[test]
    fn test_output_schema_keeps_leaf_order() {
        let plan = squash_joins(refs_refcommits_join()).unwrap();
        let schema = plan.schema();
        assert_eq!(
            schema.len(),
            Table::Refs.schema().len() + Table::RefCommits.schema().len()
        );
        assert_eq!(schema.columns()[0].source, "refs");
        assert_eq!(
            schema.columns()[Table::Refs.schema().len()].source,
            "ref_commits"
        );
    }

    #[test]
    fn test_non_key_condition_disqualifies() {
        // Joining refs to commits on a message column is outside the edge set.
        let refs_width = Table::Refs.schema().len();
        let cond = Expr::eq(
            field(0, Table::Refs, "ref_name"),
            field(refs_width, Table::Commits, "commit_message"),
        );
        let plan = Plan::InnerJoin {
            condition: cond,
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::Commits)),
        };
        let rewritten = squash_joins(plan).unwrap();
        assert!(matches!(rewritten, Plan::InnerJoin { .. }));
    }

    #[test]
    fn test_single_leaf_condition_becomes_stage_filter() {
        // ... ON r.ref_name = 'HEAD' AND r.commit_hash = c.commit_hash
        let refs_width = Table::Refs.schema().len();
        let cond = Expr::and(
            Expr::eq(field(0, Table::Refs, "ref_name"), Expr::lit(Value::text("HEAD"))),
            Expr::eq(
                field(0, Table::Refs, "commit_hash"),
                field(refs_width, Table::Commits, "commit_hash"),
            ),
        );
        let plan = Plan::InnerJoin {
            condition: cond,
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::Commits)),
        };
        match squash_joins(plan).unwrap() {
            Plan::Squashed(squashed) => {
                assert_eq!(squashed.stages[0].filters.len(), 1);
                assert!(matches!(
                    squashed.stages[1].kind,
                    StageKind::Commits { by_commit: Some(_) }
                ));
            }
            other => panic!("expected squashed table, got {}", other),
        }
    }

    #[test]
    fn test_three_table_chain() {
        // refs ⋈ commits ⋈ commit_trees via commit_hash edges.
        let w_refs = Table::Refs.schema().len();
        let w_commits = Table::Commits.schema().len();
        let inner = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "commit_hash"),
                field(w_refs, Table::Commits, "commit_hash"),
            ),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::Commits)),
        };
        let outer = Plan::InnerJoin {
            condition: Expr::eq(
                field(w_refs, Table::Commits, "commit_hash"),
                field(w_refs + w_commits, Table::CommitTrees, "commit_hash"),
            ),
            left: Box::new(inner),
            right: Box::new(scan(Table::CommitTrees)),
        };
        match squash_joins(outer).unwrap() {
            Plan::Squashed(squashed) => {
                assert_eq!(squashed.stages.len(), 3);
                assert_eq!(squashed.stages[2].table, Table::CommitTrees);
            }
            other => panic!("expected squashed table, got {}", other),
        }
    }

    #[test]
    fn test_commit_trees_without_commit_source_disqualifies() {
        // tree_entries ⋈ blobs is admissible (entry -> blob edge) but
        // blobs ⋈ commit_trees is not connected: commit_trees needs a
        // commit-providing stage.
        let w = Table::TreeEntries.schema().len();
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::TreeEntries, "blob_hash"),
                field(w, Table::Blobs, "blob_hash"),
            ),
            left: Box::new(scan(Table::TreeEntries)),
            right: Box::new(scan(Table::Blobs)),
        };
        // This one IS admissible: tree_entries roots the chain.
        assert!(matches!(squash_joins(plan).unwrap(), Plan::Squashed(_)));

        let w = Table::Blobs.schema().len();
        let bad = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Blobs, "repository_id"),
                field(w, Table::CommitTrees, "repository_id"),
            ),
            left: Box::new(scan(Table::Blobs)),
            right: Box::new(scan(Table::CommitTrees)),
        };
        assert!(matches!(squash_joins(bad).unwrap(), Plan::InnerJoin { .. }));
    }

    #[test]
    fn test_filter_wrapped_leaf_is_accepted() {
        let refs_width = Table::Refs.schema().len();
        let filtered_refs = Plan::filter(
            Expr::eq(field(0, Table::Refs, "ref_name"), Expr::lit(Value::text("HEAD"))),
            scan(Table::Refs),
        );
        let plan = Plan::InnerJoin {
            condition: Expr::eq(
                field(0, Table::Refs, "commit_hash"),
                field(refs_width, Table::Commits, "commit_hash"),
            ),
            left: Box::new(filtered_refs),
            right: Box::new(scan(Table::Commits)),
        };
        match squash_joins(plan).unwrap() {
            Plan::Squashed(squashed) => {
                assert_eq!(squashed.stages[0].filters.len(), 1);
            }
            other => panic!("expected squashed table, got {}", other),
        }
    }
}
