//! Logical query plans.
//!
//! Plans are immutable trees. Rewrites rebuild bottom-up through
//! `transform_up`; no node is mutated in place. Virtual tables are leaves
//! carrying their pushed-down state (filters, projection, index choice).

use std::fmt;

use crate::catalog::Table;
use crate::sql::{projection_schema, Expr, Schema, Value};

use super::error::PlanResult;
use super::squash::SquashedTable;

/// One ORDER BY field.
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub expr: Expr,
    pub ascending: bool,
}

/// Index access chosen by the analyzer for a table leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexLookup {
    pub index_id: String,
    pub columns: Vec<String>,
    pub key: Vec<Value>,
}

/// A virtual table leaf with its pushed-down state.
#[derive(Debug, Clone, PartialEq)]
pub struct TableNode {
    pub table: Table,
    pub alias: Option<String>,
    /// Filters the table evaluates internally (resolved against the table
    /// schema). Sound but re-checked above when not exact.
    pub filters: Vec<Expr>,
    /// Columns the consumer needs; rows keep full schema positions.
    pub projection: Option<Vec<usize>>,
    pub index: Option<IndexLookup>,
}

impl TableNode {
    pub fn new(table: Table, alias: Option<String>) -> Self {
        Self {
            table,
            alias,
            filters: Vec::new(),
            projection: None,
            index: None,
        }
    }

    /// Visible name: the alias when present, else the table name.
    pub fn visible_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.table.name())
    }

    pub fn schema(&self) -> Schema {
        let schema = self.table.schema();
        match &self.alias {
            Some(alias) => schema.with_source(alias),
            None => schema,
        }
    }
}

/// A logical plan node.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// A table reference not yet bound to the catalog.
    UnresolvedTable {
        database: Option<String>,
        name: String,
        alias: Option<String>,
    },
    Table(TableNode),
    Filter {
        predicate: Expr,
        child: Box<Plan>,
    },
    Project {
        exprs: Vec<Expr>,
        child: Box<Plan>,
    },
    Sort {
        fields: Vec<SortField>,
        child: Box<Plan>,
    },
    Limit {
        n: usize,
        child: Box<Plan>,
    },
    Offset {
        n: usize,
        child: Box<Plan>,
    },
    Distinct {
        child: Box<Plan>,
    },
    GroupBy {
        keys: Vec<Expr>,
        /// Output expressions; aggregates plus grouping keys.
        aggregates: Vec<Expr>,
        child: Box<Plan>,
    },
    CrossJoin {
        left: Box<Plan>,
        right: Box<Plan>,
    },
    InnerJoin {
        condition: Expr,
        left: Box<Plan>,
        right: Box<Plan>,
    },
    /// A subquery in FROM, re-executed on every row_iter call.
    SubqueryAlias {
        name: String,
        child: Box<Plan>,
    },
    /// Partitions its child by repository across parallel workers.
    Exchange {
        width: usize,
        child: Box<Plan>,
    },
    /// A fused chain of git-natural joins.
    Squashed(SquashedTable),
}

impl Plan {
    pub fn filter(predicate: Expr, child: Plan) -> Plan {
        Plan::Filter {
            predicate,
            child: Box::new(child),
        }
    }

    pub fn project(exprs: Vec<Expr>, child: Plan) -> Plan {
        Plan::Project {
            exprs,
            child: Box::new(child),
        }
    }

    /// Output schema. Unresolved nodes report an empty schema.
    pub fn schema(&self) -> Schema {
        match self {
            Plan::UnresolvedTable { .. } => Schema::default(),
            Plan::Table(node) => node.schema(),
            Plan::Filter { child, .. }
            | Plan::Sort { child, .. }
            | Plan::Limit { child, .. }
            | Plan::Offset { child, .. }
            | Plan::Distinct { child }
            | Plan::Exchange { child, .. } => child.schema(),
            Plan::Project { exprs, child } => projection_schema(exprs, &child.schema()),
            Plan::GroupBy {
                aggregates, child, ..
            } => projection_schema(aggregates, &child.schema()),
            Plan::CrossJoin { left, right } | Plan::InnerJoin { left, right, .. } => {
                left.schema().join(&right.schema())
            }
            Plan::SubqueryAlias { name, child } => child.schema().with_source(name),
            Plan::Squashed(squashed) => squashed.schema.clone(),
        }
    }

    pub fn children(&self) -> Vec<&Plan> {
        match self {
            Plan::UnresolvedTable { .. } | Plan::Table(_) | Plan::Squashed(_) => vec![],
            Plan::Filter { child, .. }
            | Plan::Project { child, .. }
            | Plan::Sort { child, .. }
            | Plan::Limit { child, .. }
            | Plan::Offset { child, .. }
            | Plan::Distinct { child }
            | Plan::GroupBy { child, .. }
            | Plan::SubqueryAlias { child, .. }
            | Plan::Exchange { child, .. } => vec![child],
            Plan::CrossJoin { left, right } | Plan::InnerJoin { left, right, .. } => {
                vec![left, right]
            }
        }
    }

    /// Rebuild the tree bottom-up, applying `f` to every rebuilt node.
    pub fn transform_up<F>(self, f: &F) -> PlanResult<Plan>
    where
        F: Fn(Plan) -> PlanResult<Plan>,
    {
        let rebuilt = match self {
            Plan::Filter { predicate, child } => Plan::Filter {
                predicate,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Project { exprs, child } => Plan::Project {
                exprs,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Sort { fields, child } => Plan::Sort {
                fields,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Limit { n, child } => Plan::Limit {
                n,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Offset { n, child } => Plan::Offset {
                n,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Distinct { child } => Plan::Distinct {
                child: Box::new(child.transform_up(f)?),
            },
            Plan::GroupBy {
                keys,
                aggregates,
                child,
            } => Plan::GroupBy {
                keys,
                aggregates,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::CrossJoin { left, right } => Plan::CrossJoin {
                left: Box::new(left.transform_up(f)?),
                right: Box::new(right.transform_up(f)?),
            },
            Plan::InnerJoin {
                condition,
                left,
                right,
            } => Plan::InnerJoin {
                condition,
                left: Box::new(left.transform_up(f)?),
                right: Box::new(right.transform_up(f)?),
            },
            Plan::SubqueryAlias { name, child } => Plan::SubqueryAlias {
                name,
                child: Box::new(child.transform_up(f)?),
            },
            Plan::Exchange { width, child } => Plan::Exchange {
                width,
                child: Box::new(child.transform_up(f)?),
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Rebuild only the direct children through `f`, leaving this node as
    /// is. Used by rules that need top-down matching.
    pub fn map_children<F>(self, f: &F) -> PlanResult<Plan>
    where
        F: Fn(Plan) -> PlanResult<Plan>,
    {
        Ok(match self {
            Plan::Filter { predicate, child } => Plan::Filter {
                predicate,
                child: Box::new(f(*child)?),
            },
            Plan::Project { exprs, child } => Plan::Project {
                exprs,
                child: Box::new(f(*child)?),
            },
            Plan::Sort { fields, child } => Plan::Sort {
                fields,
                child: Box::new(f(*child)?),
            },
            Plan::Limit { n, child } => Plan::Limit {
                n,
                child: Box::new(f(*child)?),
            },
            Plan::Offset { n, child } => Plan::Offset {
                n,
                child: Box::new(f(*child)?),
            },
            Plan::Distinct { child } => Plan::Distinct {
                child: Box::new(f(*child)?),
            },
            Plan::GroupBy {
                keys,
                aggregates,
                child,
            } => Plan::GroupBy {
                keys,
                aggregates,
                child: Box::new(f(*child)?),
            },
            Plan::CrossJoin { left, right } => Plan::CrossJoin {
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Plan::InnerJoin {
                condition,
                left,
                right,
            } => Plan::InnerJoin {
                condition,
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            Plan::SubqueryAlias { name, child } => Plan::SubqueryAlias {
                name,
                child: Box::new(f(*child)?),
            },
            Plan::Exchange { width, child } => Plan::Exchange {
                width,
                child: Box::new(f(*child)?),
            },
            leaf => leaf,
        })
    }

    /// Whether the plan is fully bound: no unresolved tables, columns or
    /// functions anywhere.
    pub fn resolved(&self) -> bool {
        let mut ok = true;
        self.visit(&mut |plan| {
            if matches!(plan, Plan::UnresolvedTable { .. }) {
                ok = false;
            }
            plan.for_each_expr(&mut |e| {
                if !e.resolved() {
                    ok = false;
                }
            });
        });
        ok
    }

    fn visit(&self, f: &mut dyn FnMut(&Plan)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Visit every expression held by this node (not its children).
    pub fn for_each_expr(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Plan::Table(node) => {
                for e in &node.filters {
                    f(e);
                }
            }
            Plan::Filter { predicate, .. } => f(predicate),
            Plan::Project { exprs, .. } => {
                for e in exprs {
                    f(e);
                }
            }
            Plan::Sort { fields, .. } => {
                for field in fields {
                    f(&field.expr);
                }
            }
            Plan::GroupBy {
                keys, aggregates, ..
            } => {
                for e in keys.iter().chain(aggregates) {
                    f(e);
                }
            }
            Plan::InnerJoin { condition, .. } => f(condition),
            Plan::Squashed(squashed) => {
                for stage in &squashed.stages {
                    for e in &stage.filters {
                        f(e);
                    }
                }
            }
            _ => {}
        }
    }

    /// Rebuild every expression of this node through `f`.
    pub fn map_exprs<F>(self, f: &mut F) -> PlanResult<Plan>
    where
        F: FnMut(Expr, &Schema) -> PlanResult<Expr>,
    {
        Ok(match self {
            Plan::Filter { predicate, child } => {
                let schema = child.schema();
                Plan::Filter {
                    predicate: f(predicate, &schema)?,
                    child,
                }
            }
            Plan::Project { exprs, child } => {
                let schema = child.schema();
                Plan::Project {
                    exprs: exprs
                        .into_iter()
                        .map(|e| f(e, &schema))
                        .collect::<PlanResult<_>>()?,
                    child,
                }
            }
            Plan::Sort { fields, child } => {
                let schema = child.schema();
                Plan::Sort {
                    fields: fields
                        .into_iter()
                        .map(|s| {
                            Ok(SortField {
                                expr: f(s.expr, &schema)?,
                                ascending: s.ascending,
                            })
                        })
                        .collect::<PlanResult<_>>()?,
                    child,
                }
            }
            Plan::GroupBy {
                keys,
                aggregates,
                child,
            } => {
                let schema = child.schema();
                Plan::GroupBy {
                    keys: keys
                        .into_iter()
                        .map(|e| f(e, &schema))
                        .collect::<PlanResult<_>>()?,
                    aggregates: aggregates
                        .into_iter()
                        .map(|e| f(e, &schema))
                        .collect::<PlanResult<_>>()?,
                    child,
                }
            }
            Plan::InnerJoin {
                condition,
                left,
                right,
            } => {
                let schema = left.schema().join(&right.schema());
                Plan::InnerJoin {
                    condition: f(condition, &schema)?,
                    left,
                    right,
                }
            }
            other => other,
        })
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format_indent(f, 0)
    }
}

impl Plan {
    fn format_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Plan::UnresolvedTable {
                database, name, ..
            } => match database {
                Some(db) => writeln!(f, "{}UnresolvedTable: {}.{}", pad, db, name),
                None => writeln!(f, "{}UnresolvedTable: {}", pad, name),
            },
            Plan::Table(node) => {
                if let Some(index) = &node.index {
                    writeln!(
                        f,
                        "{}IndexedTableAccess: {} index={} key=[{}]",
                        pad,
                        node.visible_name(),
                        index.index_id,
                        index
                            .key
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                } else {
                    write!(f, "{}Table: {}", pad, node.visible_name())?;
                    if !node.filters.is_empty() {
                        let fs: Vec<String> =
                            node.filters.iter().map(|e| e.to_string()).collect();
                        write!(f, " filters=[{}]", fs.join(", "))?;
                    }
                    if let Some(projection) = &node.projection {
                        write!(f, " columns={:?}", projection)?;
                    }
                    writeln!(f)
                }
            }
            Plan::Filter { predicate, child } => {
                writeln!(f, "{}Filter: {}", pad, predicate)?;
                child.format_indent(f, indent + 1)
            }
            Plan::Project { exprs, child } => {
                let cols: Vec<String> = exprs.iter().map(|e| e.to_string()).collect();
                writeln!(f, "{}Project: [{}]", pad, cols.join(", "))?;
                child.format_indent(f, indent + 1)
            }
            Plan::Sort { fields, child } => {
                let cols: Vec<String> = fields
                    .iter()
                    .map(|s| {
                        format!("{} {}", s.expr, if s.ascending { "ASC" } else { "DESC" })
                    })
                    .collect();
                writeln!(f, "{}Sort: [{}]", pad, cols.join(", "))?;
                child.format_indent(f, indent + 1)
            }
            Plan::Limit { n, child } => {
                writeln!(f, "{}Limit: {}", pad, n)?;
                child.format_indent(f, indent + 1)
            }
            Plan::Offset { n, child } => {
                writeln!(f, "{}Offset: {}", pad, n)?;
                child.format_indent(f, indent + 1)
            }
            Plan::Distinct { child } => {
                writeln!(f, "{}Distinct", pad)?;
                child.format_indent(f, indent + 1)
            }
            Plan::GroupBy {
                keys,
                aggregates,
                child,
            } => {
                let ks: Vec<String> = keys.iter().map(|e| e.to_string()).collect();
                let aggs: Vec<String> = aggregates.iter().map(|e| e.to_string()).collect();
                writeln!(
                    f,
                    "{}GroupBy: keys=[{}], aggregates=[{}]",
                    pad,
                    ks.join(", "),
                    aggs.join(", ")
                )?;
                child.format_indent(f, indent + 1)
            }
            Plan::CrossJoin { left, right } => {
                writeln!(f, "{}CrossJoin", pad)?;
                left.format_indent(f, indent + 1)?;
                right.format_indent(f, indent + 1)
            }
            Plan::InnerJoin {
                condition,
                left,
                right,
            } => {
                writeln!(f, "{}InnerJoin: {}", pad, condition)?;
                left.format_indent(f, indent + 1)?;
                right.format_indent(f, indent + 1)
            }
            Plan::SubqueryAlias { name, child } => {
                writeln!(f, "{}Subquery: {}", pad, name)?;
                child.format_indent(f, indent + 1)
            }
            Plan::Exchange { width, child } => {
                writeln!(f, "{}Exchange: width={}", pad, width)?;
                child.format_indent(f, indent + 1)
            }
            Plan::Squashed(squashed) => {
                let stages: Vec<&str> = squashed
                    .stages
                    .iter()
                    .map(|s| s.table.name())
                    .collect();
                writeln!(f, "{}SquashedTable: [{}]", pad, stages.join(" -> "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Table;

    fn scan(table: Table) -> Plan {
        Plan::Table(TableNode::new(table, None))
    }

    #[test]
    fn test_schema_concat_through_join() {
        let join = Plan::InnerJoin {
            condition: Expr::lit(Value::Bool(true)),
            left: Box::new(scan(Table::Refs)),
            right: Box::new(scan(Table::Commits)),
        };
        let schema = join.schema();
        assert_eq!(
            schema.len(),
            Table::Refs.schema().len() + Table::Commits.schema().len()
        );
    }

    #[test]
    fn test_alias_renames_source() {
        let node = TableNode::new(Table::Refs, Some("r".into()));
        let schema = node.schema();
        assert!(schema.columns().iter().all(|c| c.source == "r"));
    }

    #[test]
    fn test_transform_up_rebuilds_bottom_up() {
        let plan = Plan::filter(Expr::lit(Value::Bool(true)), scan(Table::Refs));
        let mut order = std::cell::RefCell::new(Vec::new());
        let _ = plan
            .transform_up(&|p| {
                order.borrow_mut().push(match &p {
                    Plan::Table(_) => "table",
                    Plan::Filter { .. } => "filter",
                    _ => "other",
                });
                Ok(p)
            })
            .unwrap();
        assert_eq!(*order.get_mut(), vec!["table", "filter"]);
    }

    #[test]
    fn test_resolved_detects_unbound_names() {
        let unresolved = Plan::filter(
            Expr::col("ref_name"),
            Plan::UnresolvedTable {
                database: None,
                name: "refs".into(),
                alias: None,
            },
        );
        assert!(!unresolved.resolved());
        assert!(scan(Table::Refs).resolved());
    }

    #[test]
    fn test_indexed_access_display() {
        let mut node = TableNode::new(Table::Refs, None);
        node.index = Some(IndexLookup {
            index_id: "refs_idx".into(),
            columns: vec!["ref_name".into()],
            key: vec![Value::text("refs/heads/master")],
        });
        let shown = Plan::Table(node).to_string();
        assert!(shown.contains("IndexedTableAccess"));
        assert!(shown.contains("refs_idx"));
    }
}
