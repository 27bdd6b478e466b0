//! The analyzer: a bounded fixpoint of rewrite rules over logical plans.
//!
//! Rules run in declared order; a pass that leaves the plan unchanged ends
//! the loop. A plan that keeps changing past the pass bound is a bug
//! surfaced as an error rather than a hang.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::index::IndexRegistry;
use crate::sql::{BinaryOp, Expr, Schema};

use super::error::{PlanError, PlanResult};
use super::nodes::{IndexLookup, Plan, TableNode};
use super::squash;

/// Upper bound on analyzer passes.
pub const MAX_PASSES: usize = 1000;

pub struct Analyzer {
    catalog: Arc<Catalog>,
    indexes: Arc<IndexRegistry>,
    parallelism: usize,
    squash_enabled: bool,
}

impl Analyzer {
    pub fn new(catalog: Arc<Catalog>, indexes: Arc<IndexRegistry>) -> Self {
        Self {
            catalog,
            indexes,
            parallelism: 1,
            squash_enabled: true,
        }
    }

    /// Number of parallel partitions table scans may use. 1 disables the
    /// exchange node entirely.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_squash(mut self, enabled: bool) -> Self {
        self.squash_enabled = enabled;
        self
    }

    /// Run the rule fixpoint.
    pub fn analyze(&self, plan: Plan) -> PlanResult<Plan> {
        let mut current = plan;
        for pass in 0..MAX_PASSES {
            let next = self.single_pass(current.clone())?;
            if next == current {
                tracing::debug!(passes = pass + 1, "analyzer reached fixpoint");
                return Ok(next);
            }
            current = next;
        }
        Err(PlanError::MaxPasses(MAX_PASSES))
    }

    fn single_pass(&self, plan: Plan) -> PlanResult<Plan> {
        let plan = self.resolve_subqueries(plan)?;
        let plan = self.resolve_tables(plan)?;
        let plan = self.qualify_columns(plan)?;
        let plan = self.resolve_columns(plan)?;
        let plan = self.resolve_functions(plan)?;
        let plan = self.check_aggregations(plan)?;
        let plan = self.pushdown_filters(plan)?;
        let plan = self.pushdown_projections(plan)?;
        let plan = self.assign_indexes(plan)?;
        let plan = self.parallelize(plan)?;
        let plan = if self.squash_enabled {
            squash::squash_joins(plan)?
        } else {
            plan
        };
        Ok(plan)
    }

    // ==================== Rules ====================

    /// Analyze nested plans before anything else looks at them.
    fn resolve_subqueries(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| match node {
            Plan::SubqueryAlias { name, child } if !child.resolved() => {
                let analyzed = self.analyze(*child)?;
                Ok(Plan::SubqueryAlias {
                    name,
                    child: Box::new(analyzed),
                })
            }
            other => Ok(other),
        })
    }

    /// Bind table names against the catalog.
    fn resolve_tables(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| match node {
            Plan::UnresolvedTable {
                database,
                name,
                alias,
            } => {
                if let Some(db) = database.as_deref() {
                    let known = db.eq_ignore_ascii_case(self.catalog.database())
                        || db.eq_ignore_ascii_case(crate::catalog::INFORMATION_SCHEMA);
                    if !known {
                        return Err(PlanError::UnknownDatabase(db.to_string()));
                    }
                }
                match self.catalog.resolve(database.as_deref(), &name) {
                    Some(table) => Ok(Plan::Table(TableNode::new(table, alias))),
                    None => Err(PlanError::UnknownTable(name)),
                }
            }
            other => Ok(other),
        })
    }

    /// Attach the source table to unqualified column references.
    fn qualify_columns(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            node.map_exprs(&mut |expr, schema: &Schema| {
                if schema.is_empty() {
                    return Ok(expr);
                }
                expr.transform_up(&mut |e| match e {
                    Expr::Column { table: None, name } => {
                        let positions = schema.positions_of(None, &name);
                        let sources: Vec<&str> = positions
                            .iter()
                            .map(|i| schema.columns()[*i].source.as_str())
                            .collect();
                        match sources.as_slice() {
                            [] => Ok(Expr::Column { table: None, name }),
                            [single] if !single.is_empty() => Ok(Expr::Column {
                                table: Some(single.to_string()),
                                name,
                            }),
                            [_] => Ok(Expr::Column { table: None, name }),
                            many => {
                                let first = many[0];
                                if many.iter().all(|s| *s == first) && !first.is_empty() {
                                    Ok(Expr::Column {
                                        table: Some(first.to_string()),
                                        name,
                                    })
                                } else {
                                    Err(PlanError::AmbiguousColumn(name))
                                }
                            }
                        }
                    }
                    other => Ok(other),
                })
            })
        })
    }

    /// Rewrite column references into positional fields.
    fn resolve_columns(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            node.map_exprs(&mut |expr, schema: &Schema| {
                if schema.is_empty() {
                    return Ok(expr);
                }
                expr.transform_up(&mut |e| match e {
                    Expr::Column { table, name } => {
                        let positions = schema.positions_of(table.as_deref(), &name);
                        match positions.as_slice() {
                            [] => Err(PlanError::UnknownColumn(match table {
                                Some(t) => format!("{}.{}", t, name),
                                None => name,
                            })),
                            [index] => Ok(Expr::Field {
                                index: *index,
                                kind: schema.columns()[*index].kind,
                                name,
                            }),
                            _ => Err(PlanError::AmbiguousColumn(name)),
                        }
                    }
                    other => Ok(other),
                })
            })
        })
    }

    /// Bind scalar function names from the registry.
    fn resolve_functions(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            node.map_exprs(&mut |expr, _schema| {
                expr.transform_up(&mut |e| match e {
                    Expr::Function { name, args } => {
                        match crate::sql::ScalarFunc::lookup(&name, args.len()) {
                            Some(Ok(func)) => Ok(Expr::Call { func, args }),
                            Some(Err((min, max))) => Err(PlanError::WrongArity {
                                name,
                                min,
                                max,
                                got: args.len(),
                            }),
                            None => Err(PlanError::UnknownFunction(name)),
                        }
                    }
                    other => Ok(other),
                })
            })
        })
    }

    /// Every non-aggregate output of a GroupBy must be a grouping key.
    fn check_aggregations(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            if let Plan::GroupBy {
                keys, aggregates, ..
            } = &node
            {
                if node.resolved() {
                    for aggregate in aggregates {
                        let inner = match aggregate {
                            Expr::Alias { expr, .. } => expr.as_ref(),
                            other => other,
                        };
                        let valid = inner.has_aggregate()
                            || matches!(inner, Expr::Literal(_))
                            || keys.iter().any(|k| k == inner);
                        if !valid {
                            return Err(PlanError::InvalidAggregation(aggregate.to_string()));
                        }
                    }
                }
            }
            Ok(node)
        })
    }

    /// Move filters toward the tables that can evaluate them.
    fn pushdown_filters(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            let (predicate, child) = match node {
                Plan::Filter { predicate, child } => (predicate, child),
                other => return Ok(other),
            };
            if !predicate.resolved() {
                return Ok(Plan::Filter { predicate, child });
            }

            match *child {
                // Merge stacked filters so one pass sees all conjuncts.
                Plan::Filter {
                    predicate: inner,
                    child: grandchild,
                } => Ok(Plan::Filter {
                    predicate: Expr::and(predicate, inner),
                    child: grandchild,
                }),

                // Split side-local conjuncts through a join.
                Plan::InnerJoin {
                    condition,
                    left,
                    right,
                } => {
                    let left_width = left.schema().len();
                    let (kept, l, r) = split_by_side(predicate, left_width);
                    let left = push_onto(*left, l);
                    let right = push_onto(*right, r);
                    let join = Plan::InnerJoin {
                        condition,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    Ok(match Expr::join_and(kept) {
                        Some(k) => Plan::filter(k, join),
                        None => join,
                    })
                }
                Plan::CrossJoin { left, right } => {
                    let left_width = left.schema().len();
                    let (kept, l, r) = split_by_side(predicate, left_width);
                    let left = push_onto(*left, l);
                    let right = push_onto(*right, r);
                    let join = Plan::CrossJoin {
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    Ok(match Expr::join_and(kept) {
                        Some(k) => Plan::filter(k, join),
                        None => join,
                    })
                }

                // Hand the table the conjuncts it can evaluate internally.
                Plan::Table(mut table_node) => {
                    let conjuncts = predicate.split_and();
                    let handled = table_node.table.handled_filters(&conjuncts);
                    let mut remainder = Vec::new();
                    for conjunct in conjuncts {
                        if handled.contains(&conjunct) && !table_node.filters.contains(&conjunct) {
                            table_node.filters.push(conjunct);
                        } else if !handled.contains(&conjunct) {
                            remainder.push(conjunct);
                        }
                        // handled and already present: drop the duplicate.
                    }
                    let table = Plan::Table(table_node);
                    Ok(match Expr::join_and(remainder) {
                        Some(k) => Plan::filter(k, table),
                        None => table,
                    })
                }

                other => Ok(Plan::Filter {
                    predicate,
                    child: Box::new(other),
                }),
            }
        })
    }

    /// Tell tables which columns the consumer needs.
    fn pushdown_projections(&self, plan: Plan) -> PlanResult<Plan> {
        plan.transform_up(&|node| {
            let (exprs, child) = match node {
                Plan::Project { exprs, child } => (exprs, child),
                other => return Ok(other),
            };
            if exprs.iter().any(|e| !e.resolved()) {
                return Ok(Plan::Project { exprs, child });
            }

            let mut needed: Vec<usize> = Vec::new();
            for e in &exprs {
                for index in e.field_indices() {
                    if !needed.contains(&index) {
                        needed.push(index);
                    }
                }
            }
            needed.sort_unstable();

            let child = match *child {
                Plan::Table(mut node) if node.projection.is_none() => {
                    node.projection = Some(needed);
                    Plan::Table(node)
                }
                Plan::Filter { predicate, child } => match *child {
                    Plan::Table(mut node) if node.projection.is_none() => {
                        let mut with_filter = needed;
                        for index in predicate.field_indices() {
                            if !with_filter.contains(&index) {
                                with_filter.push(index);
                            }
                        }
                        for filter in &node.filters {
                            for index in filter.field_indices() {
                                if !with_filter.contains(&index) {
                                    with_filter.push(index);
                                }
                            }
                        }
                        with_filter.sort_unstable();
                        node.projection = Some(with_filter);
                        Plan::Filter {
                            predicate,
                            child: Box::new(Plan::Table(node)),
                        }
                    }
                    other => Plan::Filter {
                        predicate,
                        child: Box::new(other),
                    },
                },
                other => other,
            };

            Ok(Plan::Project {
                exprs,
                child: Box::new(child),
            })
        })
    }

    /// Switch table access to an index when an equality filter reached the
    /// table and a matching index exists. Equalities on indexable columns
    /// always land in the table's pushed filters (indexable columns are a
    /// subset of the handled ones), so leaves are matched directly.
    fn assign_indexes(&self, plan: Plan) -> PlanResult<Plan> {
        let db = self.catalog.database().to_string();
        plan.transform_up(&|node| {
            let mut table_node = match node {
                Plan::Table(t) if t.index.is_none() && t.table.is_indexable() => t,
                other => return Ok(other),
            };

            let schema = table_node.table.schema();
            for conjunct in &table_node.filters {
                let (index, value) = match conjunct {
                    Expr::Binary {
                        left,
                        op: BinaryOp::Eq,
                        right,
                    } => match (left.as_ref(), right.as_ref()) {
                        (Expr::Field { index, .. }, Expr::Literal(v))
                        | (Expr::Literal(v), Expr::Field { index, .. }) => (*index, v.clone()),
                        _ => continue,
                    },
                    _ => continue,
                };
                let column = match schema.columns().get(index) {
                    Some(c) => c.name.clone(),
                    None => continue,
                };
                let columns = vec![column];
                if let Some(found) = self.indexes.find(&db, table_node.table.name(), &columns) {
                    tracing::debug!(
                        table = table_node.table.name(),
                        index = %found.meta().id,
                        "index assigned"
                    );
                    table_node.index = Some(IndexLookup {
                        index_id: found.meta().id.clone(),
                        columns,
                        key: vec![value],
                    });
                    break;
                }
            }

            Ok(Plan::Table(table_node))
        })
    }

    /// Wrap repository-partitionable scans with an exchange node.
    fn parallelize(&self, plan: Plan) -> PlanResult<Plan> {
        if self.parallelism <= 1 {
            return Ok(plan);
        }
        Ok(self.parallelize_walk(plan))
    }

    fn parallelize_walk(&self, plan: Plan) -> Plan {
        let wrap = |child: Plan, width: usize| Plan::Exchange {
            width,
            child: Box::new(child),
        };
        match plan {
            // Already partitioned.
            done @ Plan::Exchange { .. } => done,
            // Joins stay serial; the squashed form is partitioned instead.
            join @ (Plan::InnerJoin { .. } | Plan::CrossJoin { .. }) => join,
            Plan::Table(node) if node.table.is_git() && node.index.is_none() => {
                wrap(Plan::Table(node), self.parallelism)
            }
            Plan::Filter { predicate, child } => match *child {
                Plan::Table(node) if node.table.is_git() && node.index.is_none() => wrap(
                    Plan::Filter {
                        predicate,
                        child: Box::new(Plan::Table(node)),
                    },
                    self.parallelism,
                ),
                other => Plan::Filter {
                    predicate,
                    child: Box::new(self.parallelize_walk(other)),
                },
            },
            squashed @ Plan::Squashed(_) => wrap(squashed, self.parallelism),
            Plan::Project { exprs, child } => Plan::Project {
                exprs,
                child: Box::new(self.parallelize_walk(*child)),
            },
            Plan::Sort { fields, child } => Plan::Sort {
                fields,
                child: Box::new(self.parallelize_walk(*child)),
            },
            Plan::GroupBy {
                keys,
                aggregates,
                child,
            } => Plan::GroupBy {
                keys,
                aggregates,
                child: Box::new(self.parallelize_walk(*child)),
            },
            Plan::Distinct { child } => Plan::Distinct {
                child: Box::new(self.parallelize_walk(*child)),
            },
            Plan::SubqueryAlias { name, child } => Plan::SubqueryAlias {
                name,
                child: Box::new(self.parallelize_walk(*child)),
            },
            // Limit/Offset stay above an unpartitioned child: merging
            // partitions below a bare LIMIT would reorder rows.
            other => other,
        }
    }
}

/// Split conjuncts of a join filter into (kept, left-side, right-side),
/// shifting right-side field indices into the right child's coordinates.
fn split_by_side(predicate: Expr, left_width: usize) -> (Vec<Expr>, Vec<Expr>, Vec<Expr>) {
    let mut kept = Vec::new();
    let mut left = Vec::new();
    let mut right = Vec::new();
    for conjunct in predicate.split_and() {
        let indices = conjunct.field_indices();
        if indices.is_empty() {
            kept.push(conjunct);
        } else if indices.iter().all(|i| *i < left_width) {
            left.push(conjunct);
        } else if indices.iter().all(|i| *i >= left_width) {
            right.push(conjunct.map_field_indices(&|i| i - left_width));
        } else {
            kept.push(conjunct);
        }
    }
    (kept, left, right)
}

fn push_onto(plan: Plan, filters: Vec<Expr>) -> Plan {
    match Expr::join_and(filters) {
        Some(predicate) => Plan::filter(predicate, plan),
        None => plan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Table;
    use crate::sql::{Value, ValueKind};

    fn analyzer() -> Analyzer {
        let dir = std::env::temp_dir().join(format!("gitql-test-an-{}", ulid::Ulid::new()));
        Analyzer::new(
            Arc::new(Catalog::new("gitql")),
            Arc::new(IndexRegistry::new(dir)),
        )
    }

    fn unresolved(name: &str) -> Plan {
        Plan::UnresolvedTable {
            database: None,
            name: name.into(),
            alias: None,
        }
    }

    #[test]
    fn test_resolves_tables_and_columns() {
        let plan = Plan::project(vec![Expr::col("ref_name")], unresolved("refs"));
        let analyzed = analyzer().analyze(plan).unwrap();
        assert!(analyzed.resolved());

        // The projection is a positional field now; the scan carries the
        // pushed projection.
        match &analyzed {
            Plan::Project { exprs, child } => {
                assert!(matches!(exprs[0], Expr::Field { index: 1, .. }));
                match child.as_ref() {
                    Plan::Table(node) => assert_eq!(node.projection, Some(vec![1])),
                    other => panic!("expected table, got {}", other),
                }
            }
            other => panic!("expected project, got {}", other),
        }
    }

    #[test]
    fn test_unknown_table_and_column() {
        let err = analyzer().analyze(unresolved("nope")).unwrap_err();
        assert!(matches!(err, PlanError::UnknownTable(_)));

        let plan = Plan::project(vec![Expr::col("no_such_column")], unresolved("refs"));
        let err = analyzer().analyze(plan).unwrap_err();
        assert!(matches!(err, PlanError::UnknownColumn(_)));
    }

    #[test]
    fn test_ambiguous_column() {
        // commit_hash exists on both sides of refs ⋈ commits.
        let join = Plan::InnerJoin {
            condition: Expr::lit(Value::Bool(true)),
            left: Box::new(unresolved("refs")),
            right: Box::new(unresolved("commits")),
        };
        let plan = Plan::project(vec![Expr::col("commit_hash")], join);
        let err = analyzer().analyze(plan).unwrap_err();
        assert!(matches!(err, PlanError::AmbiguousColumn(_)));
    }

    #[test]
    fn test_unknown_function() {
        let plan = Plan::project(
            vec![Expr::Function {
                name: "frobnicate".into(),
                args: vec![Expr::col("ref_name")],
            }],
            unresolved("refs"),
        );
        let err = analyzer().analyze(plan).unwrap_err();
        assert!(matches!(err, PlanError::UnknownFunction(_)));
    }

    #[test]
    fn test_filter_pushdown_into_table() {
        let plan = Plan::filter(
            Expr::and(
                Expr::eq(Expr::col("ref_name"), Expr::lit(Value::text("HEAD"))),
                Expr::Like {
                    expr: Box::new(Expr::col("commit_hash")),
                    pattern: Box::new(Expr::lit(Value::text("6e%"))),
                    negated: false,
                },
            ),
            unresolved("refs"),
        );
        let analyzed = analyzer().analyze(plan).unwrap();

        // The equality moved into the table; the LIKE stays above.
        match &analyzed {
            Plan::Filter { predicate, child } => {
                assert!(matches!(predicate, Expr::Like { .. }));
                match child.as_ref() {
                    Plan::Table(node) => {
                        assert_eq!(node.filters.len(), 1);
                    }
                    other => panic!("expected table, got {}", other),
                }
            }
            other => panic!("expected filter, got {}", other),
        }
    }

    #[test]
    fn test_analyze_is_idempotent() {
        let plan = Plan::project(
            vec![Expr::col("ref_name")],
            Plan::filter(
                Expr::eq(Expr::col("ref_name"), Expr::lit(Value::text("HEAD"))),
                unresolved("refs"),
            ),
        );
        let analyzer = analyzer();
        let once = analyzer.analyze(plan).unwrap();
        let twice = analyzer.analyze(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_check_aggregations_rejects_bare_column() {
        // SELECT ref_name, COUNT(*) ... GROUP BY commit_hash is invalid.
        let group = Plan::GroupBy {
            keys: vec![Expr::col("commit_hash")],
            aggregates: vec![
                Expr::col("ref_name"),
                Expr::Aggregate {
                    func: crate::sql::AggFunc::Count,
                    arg: None,
                    distinct: false,
                },
            ],
            child: Box::new(unresolved("refs")),
        };
        let err = analyzer().analyze(group).unwrap_err();
        assert!(matches!(err, PlanError::InvalidAggregation(_)));
    }

    #[test]
    fn test_squash_fires_through_analysis() {
        // refs r JOIN ref_commits rc ON r.ref_name = rc.ref_name
        let join = Plan::InnerJoin {
            condition: Expr::and(
                Expr::eq(
                    Expr::qualified("refs", "ref_name"),
                    Expr::qualified("ref_commits", "ref_name"),
                ),
                Expr::eq(
                    Expr::qualified("refs", "repository_id"),
                    Expr::qualified("ref_commits", "repository_id"),
                ),
            ),
            left: Box::new(unresolved("refs")),
            right: Box::new(unresolved("ref_commits")),
        };
        let analyzed = analyzer().analyze(join).unwrap();
        assert!(matches!(analyzed, Plan::Squashed(_)), "got {}", analyzed);

        let not_squashed = analyzer()
            .with_squash(false)
            .analyze(Plan::InnerJoin {
                condition: Expr::eq(
                    Expr::qualified("refs", "ref_name"),
                    Expr::qualified("ref_commits", "ref_name"),
                ),
                left: Box::new(unresolved("refs")),
                right: Box::new(unresolved("ref_commits")),
            })
            .unwrap();
        assert!(matches!(not_squashed, Plan::InnerJoin { .. }));
    }

    #[test]
    fn test_parallelize_wraps_scans() {
        let analyzed = analyzer()
            .with_parallelism(4)
            .analyze(unresolved("commits"))
            .unwrap();
        match analyzed {
            Plan::Exchange { width, child } => {
                assert_eq!(width, 4);
                assert!(matches!(*child, Plan::Table(_)));
            }
            other => panic!("expected exchange, got {}", other),
        }
    }

    #[test]
    fn test_assign_indexes_uses_registry() {
        let dir = std::env::temp_dir().join(format!("gitql-test-an-{}", ulid::Ulid::new()));
        let registry = Arc::new(IndexRegistry::new(dir));
        let meta = crate::index::IndexMeta::new(
            "gitql",
            "refs",
            "refs_idx",
            vec!["ref_name".into()],
            registry.default_driver(),
        );
        registry
            .create(
                meta,
                &mut vec![Ok((vec![Value::text("HEAD")], b"loc".to_vec()))].into_iter(),
            )
            .unwrap();

        let analyzer = Analyzer::new(Arc::new(Catalog::new("gitql")), registry);
        let plan = Plan::filter(
            Expr::eq(Expr::col("ref_name"), Expr::lit(Value::text("HEAD"))),
            unresolved("refs"),
        );
        let analyzed = analyzer.analyze(plan).unwrap();
        let shown = analyzed.to_string();
        assert!(shown.contains("IndexedTableAccess"), "plan: {}", shown);
    }

    #[test]
    fn test_field_kind_comes_from_schema() {
        let plan = Plan::project(vec![Expr::col("history_index")], unresolved("ref_commits"));
        let analyzed = analyzer().analyze(plan).unwrap();
        match &analyzed {
            Plan::Project { exprs, .. } => match &exprs[0] {
                Expr::Field { kind, .. } => assert_eq!(*kind, ValueKind::Int64),
                other => panic!("expected field, got {}", other),
            },
            other => panic!("expected project, got {}", other),
        }
        let _ = Table::RefCommits;
    }
}
