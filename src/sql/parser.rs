//! SQL parsing: text to logical plans.
//!
//! Uses the `sqlparser` crate for queries, then lowers the AST into this
//! engine's plan and expression trees. Statements sqlparser has no business
//! with (SHOW INDEXES, CREATE/DROP INDEX, DESCRIBE) are recognized by hand
//! before the general parser runs.

use sqlparser::ast as sp;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::planner::{Plan, SortField};

use super::error::{ParseError, ParseResult};
use super::expr::{BinaryOp, Expr, UnaryOp};
use super::functions::AggFunc;
use super::value::Value;

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// A query, lowered to an unanalyzed logical plan.
    Query(Plan),
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        /// `USING <driver>`; the default driver when absent.
        driver: Option<String>,
    },
    DropIndex {
        name: String,
        table: String,
    },
    ShowTables,
    ShowIndexes {
        table: Option<String>,
    },
    Describe(String),
}

/// SQL parser for the engine.
pub struct Parser;

impl Parser {
    /// Parse a SQL string into a statement.
    pub fn parse(sql: &str) -> ParseResult<Statement> {
        let sql = sql.trim().trim_end_matches(';');
        if sql.is_empty() {
            return Err(ParseError::EmptyQuery);
        }

        // Handle engine-specific commands before sqlparser.
        if let Some(statement) = Self::parse_special(sql)? {
            return Ok(statement);
        }

        let dialect = MySqlDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;

        if statements.is_empty() {
            return Err(ParseError::EmptyQuery);
        }
        if statements.len() > 1 {
            return Err(ParseError::MultipleStatements);
        }

        Self::convert_statement(&statements[0])
    }

    /// Recognize SHOW/DESCRIBE/CREATE INDEX/DROP INDEX by hand.
    fn parse_special(sql: &str) -> ParseResult<Option<Statement>> {
        let upper = sql.to_uppercase();
        let words: Vec<&str> = sql.split_whitespace().collect();

        if upper == "SHOW TABLES" {
            return Ok(Some(Statement::ShowTables));
        }

        if upper.starts_with("SHOW INDEXES") || upper.starts_with("SHOW INDEX") {
            // SHOW INDEXES [FROM <table>]
            let table = match words.iter().position(|w| w.eq_ignore_ascii_case("from")) {
                Some(i) => Some(
                    words
                        .get(i + 1)
                        .ok_or_else(|| ParseError::MissingClause("table name".into()))?
                        .to_string(),
                ),
                None => None,
            };
            return Ok(Some(Statement::ShowIndexes { table }));
        }

        if upper.starts_with("DESCRIBE ") || upper.starts_with("DESC ") {
            let table = words
                .get(1)
                .ok_or_else(|| ParseError::MissingClause("table name".into()))?;
            return Ok(Some(Statement::Describe(table.to_string())));
        }

        if upper.starts_with("CREATE INDEX ") {
            return Self::parse_create_index(sql).map(Some);
        }

        if upper.starts_with("DROP INDEX ") {
            // DROP INDEX <name> ON <table>
            if words.len() != 5 || !words[3].eq_ignore_ascii_case("on") {
                return Err(ParseError::Syntax(
                    "expected DROP INDEX <name> ON <table>".into(),
                ));
            }
            return Ok(Some(Statement::DropIndex {
                name: words[2].to_string(),
                table: words[4].to_string(),
            }));
        }

        Ok(None)
    }

    /// CREATE INDEX <name> ON <table>(<col>[, <col>...]) [USING <driver>]
    fn parse_create_index(sql: &str) -> ParseResult<Statement> {
        let rest = &sql["CREATE INDEX ".len()..];
        let (name, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::MissingClause("index name".into()))?;
        let rest = rest.trim_start();

        let lowered = rest.to_lowercase();
        if !lowered.starts_with("on") {
            return Err(ParseError::MissingClause("ON <table>".into()));
        }
        let rest = rest[2..].trim_start();

        let open = rest
            .find('(')
            .ok_or_else(|| ParseError::MissingClause("column list".into()))?;
        let close = rest
            .find(')')
            .ok_or_else(|| ParseError::MissingClause("closing parenthesis".into()))?;
        if close < open {
            return Err(ParseError::Syntax("malformed column list".into()));
        }

        let table = rest[..open].trim().to_string();
        if table.is_empty() {
            return Err(ParseError::MissingClause("table name".into()));
        }
        let columns: Vec<String> = rest[open + 1..close]
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if columns.is_empty() {
            return Err(ParseError::MissingClause("column list".into()));
        }

        let tail = rest[close + 1..].trim();
        let driver = if tail.is_empty() {
            None
        } else {
            let mut parts = tail.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(using), Some(driver), None) if using.eq_ignore_ascii_case("using") => {
                    Some(driver.to_string())
                }
                _ => return Err(ParseError::Syntax(format!("unexpected trailing: {}", tail))),
            }
        };

        Ok(Statement::CreateIndex {
            name: name.to_string(),
            table,
            columns,
            driver,
        })
    }

    fn convert_statement(stmt: &sp::Statement) -> ParseResult<Statement> {
        match stmt {
            sp::Statement::Query(query) => Ok(Statement::Query(Self::convert_query(query)?)),
            other => Err(ParseError::UnsupportedStatement(format!("{:?}", other))),
        }
    }

    fn convert_query(query: &sp::Query) -> ParseResult<Plan> {
        let select = match query.body.as_ref() {
            sp::SetExpr::Select(s) => s,
            other => {
                return Err(ParseError::UnsupportedStatement(format!(
                    "unsupported query body: {:?}",
                    other
                )))
            }
        };

        // FROM (with joins)
        if select.from.len() != 1 {
            return Err(ParseError::UnsupportedStatement(
                "exactly one FROM item required".into(),
            ));
        }
        let mut plan = Self::convert_table_factor(&select.from[0].relation)?;
        for join in &select.from[0].joins {
            let right = Self::convert_table_factor(&join.relation)?;
            plan = match &join.join_operator {
                sp::JoinOperator::Inner(constraint) => {
                    match constraint {
                        sp::JoinConstraint::On(expr) => Plan::InnerJoin {
                            condition: Self::convert_expr(expr)?,
                            left: Box::new(plan),
                            right: Box::new(right),
                        },
                        sp::JoinConstraint::None => Plan::CrossJoin {
                            left: Box::new(plan),
                            right: Box::new(right),
                        },
                        other => {
                            return Err(ParseError::UnsupportedStatement(format!(
                                "unsupported join constraint: {:?}",
                                other
                            )))
                        }
                    }
                }
                sp::JoinOperator::CrossJoin => Plan::CrossJoin {
                    left: Box::new(plan),
                    right: Box::new(right),
                },
                other => {
                    return Err(ParseError::UnsupportedStatement(format!(
                        "unsupported join type: {:?}",
                        other
                    )))
                }
            };
        }

        Self::finish_query(query, select, plan)
    }

    /// Lower WHERE / GROUP BY / HAVING / DISTINCT / ORDER BY / LIMIT over an
    /// already-built FROM plan.
    fn finish_query(query: &sp::Query, select: &sp::Select, from: Plan) -> ParseResult<Plan> {
        let mut plan = from;

        // WHERE
        if let Some(selection) = &select.selection {
            plan = Plan::filter(Self::convert_expr(selection)?, plan);
        }

        // Projection list; None means SELECT *.
        let projection = Self::convert_projection(&select.projection)?;

        // GROUP BY / aggregates
        let group_keys = match &select.group_by {
            sp::GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(Self::convert_expr)
                .collect::<ParseResult<Vec<_>>>()?,
            other => {
                return Err(ParseError::UnsupportedStatement(format!(
                    "unsupported GROUP BY: {:?}",
                    other
                )))
            }
        };
        let has_aggregates = projection
            .as_ref()
            .map(|exprs| exprs.iter().any(Expr::has_aggregate))
            .unwrap_or(false);

        let grouped = !group_keys.is_empty() || has_aggregates;
        if grouped {
            let outputs = projection.clone().ok_or_else(|| {
                ParseError::UnsupportedStatement("SELECT * with GROUP BY".into())
            })?;
            plan = Plan::GroupBy {
                keys: group_keys,
                aggregates: outputs,
                child: Box::new(plan),
            };

            if let Some(having) = &select.having {
                let predicate = Self::rewrite_having(Self::convert_expr(having)?, &plan)?;
                plan = Plan::filter(predicate, plan);
            }
        } else if select.having.is_some() {
            return Err(ParseError::UnsupportedStatement(
                "HAVING without GROUP BY".into(),
            ));
        }

        // ORDER BY: above the projection when it references projection
        // aliases, otherwise below so hidden columns stay visible.
        let order_fields = match &query.order_by {
            Some(order_by) => Self::convert_order_by(order_by)?,
            None => Vec::new(),
        };
        let aliases: Vec<String> = projection
            .as_ref()
            .map(|exprs| {
                exprs
                    .iter()
                    .filter_map(|e| match e {
                        Expr::Alias { name, .. } => Some(name.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let order_above_projection = grouped
            || order_fields.iter().all(|f| match &f.expr {
                Expr::Column { table: None, name } => aliases.contains(name),
                _ => false,
            }) && !order_fields.is_empty();

        if !order_fields.is_empty() && !order_above_projection {
            plan = Plan::Sort {
                fields: order_fields.clone(),
                child: Box::new(plan),
            };
        }

        // Projection (grouped plans already emit their output columns).
        if !grouped {
            if let Some(exprs) = projection {
                plan = Plan::project(exprs, plan);
            }
        }

        if !order_fields.is_empty() && order_above_projection {
            plan = Plan::Sort {
                fields: order_fields,
                child: Box::new(plan),
            };
        }

        if select.distinct.is_some() {
            plan = Plan::Distinct {
                child: Box::new(plan),
            };
        }

        // OFFSET below LIMIT: skip first, then cap.
        if let Some(sp::LimitClause::LimitOffset { limit, offset, .. }) = &query.limit_clause {
            if let Some(offset) = offset {
                let n = Self::expr_to_usize(&offset.value)?;
                plan = Plan::Offset {
                    n,
                    child: Box::new(plan),
                };
            }
            if let Some(limit) = limit {
                let n = Self::expr_to_usize(limit)?;
                plan = Plan::Limit {
                    n,
                    child: Box::new(plan),
                };
            }
        }

        Ok(plan)
    }

    /// SELECT items as expressions; None for a plain `SELECT *`.
    fn convert_projection(items: &[sp::SelectItem]) -> ParseResult<Option<Vec<Expr>>> {
        if items.len() == 1 && matches!(items[0], sp::SelectItem::Wildcard(_)) {
            return Ok(None);
        }
        let exprs = items
            .iter()
            .map(|item| match item {
                sp::SelectItem::Wildcard(_) => Err(ParseError::UnsupportedStatement(
                    "* mixed with other select items".into(),
                )),
                sp::SelectItem::UnnamedExpr(expr) => Self::convert_expr(expr),
                sp::SelectItem::ExprWithAlias { expr, alias } => Ok(Expr::Alias {
                    expr: Box::new(Self::convert_expr(expr)?),
                    name: alias.value.clone(),
                }),
                sp::SelectItem::QualifiedWildcard(name, _) => Err(
                    ParseError::UnsupportedExpression(format!("qualified wildcard: {:?}", name)),
                ),
            })
            .collect::<ParseResult<Vec<_>>>()?;
        Ok(Some(exprs))
    }

    fn convert_order_by(order_by: &sp::OrderBy) -> ParseResult<Vec<SortField>> {
        let exprs = match &order_by.kind {
            sp::OrderByKind::Expressions(exprs) => exprs,
            sp::OrderByKind::All(_) => {
                return Err(ParseError::UnsupportedStatement("ORDER BY ALL".into()))
            }
        };
        exprs
            .iter()
            .map(|item| {
                Ok(SortField {
                    expr: Self::convert_expr(&item.expr)?,
                    ascending: item.options.asc.unwrap_or(true),
                })
            })
            .collect()
    }

    /// HAVING references aggregates by repeating them; rewrite each
    /// aggregate call into a reference to the matching output column of the
    /// GroupBy below. Aggregates not present in the select list are not
    /// supported.
    fn rewrite_having(predicate: Expr, group_plan: &Plan) -> ParseResult<Expr> {
        let outputs = match group_plan {
            Plan::GroupBy { aggregates, .. } => aggregates.clone(),
            _ => return Ok(predicate),
        };
        predicate.transform_up(&mut |e| {
            if !matches!(e, Expr::Aggregate { .. }) {
                return Ok(e);
            }
            for output in &outputs {
                let (inner, name) = match output {
                    Expr::Alias { expr, name } => (expr.as_ref(), name.clone()),
                    other => (other, other.output_name()),
                };
                if inner == &e {
                    return Ok(Expr::col(name));
                }
            }
            Err(ParseError::UnsupportedExpression(format!(
                "HAVING aggregate not in select list: {}",
                e
            )))
        })
    }

    fn expr_to_usize(expr: &sp::Expr) -> ParseResult<usize> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::Number(s, _) => s
                    .parse::<usize>()
                    .map_err(|_| ParseError::Syntax(format!("invalid count: {}", s))),
                other => Err(ParseError::Syntax(format!(
                    "expected a number, got {:?}",
                    other
                ))),
            },
            other => Err(ParseError::Syntax(format!(
                "expected a literal count, got {:?}",
                other
            ))),
        }
    }

    fn convert_table_factor(factor: &sp::TableFactor) -> ParseResult<Plan> {
        match factor {
            sp::TableFactor::Table { name, alias, .. } => {
                let parts: Vec<String> = name
                    .0
                    .iter()
                    .map(|p| {
                        p.as_ident()
                            .map(|id| id.value.clone())
                            .unwrap_or_else(|| p.to_string())
                    })
                    .collect();
                let (database, table) = match parts.as_slice() {
                    [table] => (None, table.clone()),
                    [db, table] => (Some(db.clone()), table.clone()),
                    _ => {
                        return Err(ParseError::InvalidIdentifier(format!(
                            "table name: {}",
                            parts.join(".")
                        )))
                    }
                };
                Ok(Plan::UnresolvedTable {
                    database,
                    name: table,
                    alias: alias.as_ref().map(|a| a.name.value.clone()),
                })
            }
            sp::TableFactor::Derived {
                subquery, alias, ..
            } => {
                let child = Self::convert_query(subquery)?;
                let name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| "subquery".to_string());
                Ok(Plan::SubqueryAlias {
                    name,
                    child: Box::new(child),
                })
            }
            other => Err(ParseError::UnsupportedStatement(format!(
                "unsupported FROM item: {:?}",
                other
            ))),
        }
    }

    fn convert_expr(expr: &sp::Expr) -> ParseResult<Expr> {
        match expr {
            sp::Expr::Identifier(id) => Ok(Expr::col(id.value.clone())),

            sp::Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [table, column] => Ok(Expr::qualified(table.value.clone(), column.value.clone())),
                [column] => Ok(Expr::col(column.value.clone())),
                _ => Err(ParseError::InvalidIdentifier(format!(
                    "{:?}",
                    parts
                ))),
            },

            sp::Expr::Value(v) => Ok(Expr::Literal(Self::convert_value(v)?)),

            sp::Expr::BinaryOp { left, op, right } => {
                let l = Self::convert_expr(left)?;
                let r = Self::convert_expr(right)?;
                let o = Self::convert_binary_op(op)?;
                Ok(Expr::Binary {
                    left: Box::new(l),
                    op: o,
                    right: Box::new(r),
                })
            }

            sp::Expr::UnaryOp { op, expr } => {
                let inner = Self::convert_expr(expr)?;
                match op {
                    sp::UnaryOperator::Not => Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(inner),
                    }),
                    sp::UnaryOperator::Minus => Ok(Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: Box::new(inner),
                    }),
                    sp::UnaryOperator::Plus => Ok(inner),
                    other => Err(ParseError::UnsupportedExpression(format!(
                        "unsupported unary operator: {:?}",
                        other
                    ))),
                }
            }

            sp::Expr::IsNull(e) => Ok(Expr::IsNull {
                expr: Box::new(Self::convert_expr(e)?),
                negated: false,
            }),
            sp::Expr::IsNotNull(e) => Ok(Expr::IsNull {
                expr: Box::new(Self::convert_expr(e)?),
                negated: true,
            }),

            sp::Expr::InList {
                expr,
                list,
                negated,
            } => Ok(Expr::InList {
                expr: Box::new(Self::convert_expr(expr)?),
                list: list
                    .iter()
                    .map(Self::convert_expr)
                    .collect::<ParseResult<Vec<_>>>()?,
                negated: *negated,
            }),

            sp::Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Ok(Expr::Between {
                expr: Box::new(Self::convert_expr(expr)?),
                low: Box::new(Self::convert_expr(low)?),
                high: Box::new(Self::convert_expr(high)?),
                negated: *negated,
            }),

            sp::Expr::Like {
                expr,
                pattern,
                negated,
                ..
            } => Ok(Expr::Like {
                expr: Box::new(Self::convert_expr(expr)?),
                pattern: Box::new(Self::convert_expr(pattern)?),
                negated: *negated,
            }),

            sp::Expr::RLike {
                expr,
                pattern,
                negated,
                ..
            } => Ok(Expr::Regexp {
                expr: Box::new(Self::convert_expr(expr)?),
                pattern: Box::new(Self::convert_expr(pattern)?),
                negated: *negated,
            }),

            sp::Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                let operand = operand
                    .as_ref()
                    .map(|e| Self::convert_expr(e).map(Box::new))
                    .transpose()?;
                let branches = conditions
                    .iter()
                    .map(|when| {
                        Ok((
                            Self::convert_expr(&when.condition)?,
                            Self::convert_expr(&when.result)?,
                        ))
                    })
                    .collect::<ParseResult<Vec<_>>>()?;
                let else_branch = else_result
                    .as_ref()
                    .map(|e| Self::convert_expr(e).map(Box::new))
                    .transpose()?;
                Ok(Expr::Case {
                    operand,
                    branches,
                    else_branch,
                })
            }

            sp::Expr::Function(f) => Self::convert_function(f),

            sp::Expr::Nested(inner) => Self::convert_expr(inner),

            other => Err(ParseError::UnsupportedExpression(format!("{:?}", other))),
        }
    }

    fn convert_function(f: &sp::Function) -> ParseResult<Expr> {
        let name = f.name.to_string().to_lowercase();

        let (args, distinct, saw_wildcard) = match &f.args {
            sp::FunctionArguments::List(list) => {
                let distinct = matches!(
                    list.duplicate_treatment,
                    Some(sp::DuplicateTreatment::Distinct)
                );
                let mut exprs = Vec::new();
                let mut wildcard = false;
                for arg in &list.args {
                    match arg {
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => {
                            exprs.push(Self::convert_expr(e)?);
                        }
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => {
                            wildcard = true;
                        }
                        other => {
                            return Err(ParseError::UnsupportedExpression(format!(
                                "unsupported function argument: {:?}",
                                other
                            )))
                        }
                    }
                }
                (exprs, distinct, wildcard)
            }
            _ => (Vec::new(), false, false),
        };

        if let Some(func) = AggFunc::lookup(&name) {
            let arg = if saw_wildcard {
                None
            } else {
                match args.len() {
                    0 => None,
                    1 => Some(Box::new(args.into_iter().next().expect("one argument"))),
                    n => {
                        return Err(ParseError::UnsupportedExpression(format!(
                            "{} takes at most one argument, got {}",
                            name, n
                        )))
                    }
                }
            };
            return Ok(Expr::Aggregate {
                func,
                arg,
                distinct,
            });
        }

        if saw_wildcard {
            return Err(ParseError::UnsupportedExpression(format!(
                "{}(*) is not a supported call",
                name
            )));
        }
        Ok(Expr::Function { name, args })
    }

    fn convert_value(v: &sp::ValueWithSpan) -> ParseResult<Value> {
        match &v.value {
            sp::Value::Null => Ok(Value::Null),
            sp::Value::Boolean(b) => Ok(Value::Bool(*b)),
            sp::Value::Number(s, _) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(Value::Int64(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(Value::Double(f))
                } else {
                    Err(ParseError::UnsupportedExpression(format!(
                        "invalid number: {}",
                        s
                    )))
                }
            }
            sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
                Ok(Value::Text(s.clone()))
            }
            other => Err(ParseError::UnsupportedExpression(format!(
                "unsupported literal: {:?}",
                other
            ))),
        }
    }

    fn convert_binary_op(op: &sp::BinaryOperator) -> ParseResult<BinaryOp> {
        match op {
            sp::BinaryOperator::Eq => Ok(BinaryOp::Eq),
            sp::BinaryOperator::NotEq => Ok(BinaryOp::NotEq),
            sp::BinaryOperator::Lt => Ok(BinaryOp::Lt),
            sp::BinaryOperator::LtEq => Ok(BinaryOp::LtEq),
            sp::BinaryOperator::Gt => Ok(BinaryOp::Gt),
            sp::BinaryOperator::GtEq => Ok(BinaryOp::GtEq),
            sp::BinaryOperator::And => Ok(BinaryOp::And),
            sp::BinaryOperator::Or => Ok(BinaryOp::Or),
            sp::BinaryOperator::Plus => Ok(BinaryOp::Plus),
            sp::BinaryOperator::Minus => Ok(BinaryOp::Minus),
            sp::BinaryOperator::Multiply => Ok(BinaryOp::Multiply),
            sp::BinaryOperator::Divide => Ok(BinaryOp::Divide),
            sp::BinaryOperator::Modulo => Ok(BinaryOp::Modulo),
            other => Err(ParseError::UnsupportedExpression(format!(
                "unsupported operator: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_plan(sql: &str) -> Plan {
        match Parser::parse(sql).unwrap() {
            Statement::Query(plan) => plan,
            other => panic!("expected a query, got {:?}", other),
        }
    }

    #[test]
    fn test_select_star() {
        let plan = query_plan("SELECT * FROM refs");
        assert!(matches!(plan, Plan::UnresolvedTable { .. }));
    }

    #[test]
    fn test_select_columns_where_order_limit() {
        let plan = query_plan(
            "SELECT ref_name FROM refs WHERE repository_id = 'r' ORDER BY ref_name LIMIT 5 OFFSET 2",
        );
        // Limit(Offset(Project(Sort(Filter(table)))))
        match plan {
            Plan::Limit { n: 5, child } => match *child {
                Plan::Offset { n: 2, child } => match *child {
                    Plan::Project { child, .. } => match *child {
                        Plan::Sort { child, .. } => {
                            assert!(matches!(*child, Plan::Filter { .. }))
                        }
                        other => panic!("expected sort, got {}", other),
                    },
                    other => panic!("expected project, got {}", other),
                },
                other => panic!("expected offset, got {}", other),
            },
            other => panic!("expected limit, got {}", other),
        }
    }

    #[test]
    fn test_inner_join_on() {
        let plan = query_plan(
            "SELECT c.commit_hash FROM ref_commits r \
             INNER JOIN commits c ON r.ref_name = 'HEAD' AND r.commit_hash = c.commit_hash",
        );
        match plan {
            Plan::Project { child, .. } => match *child {
                Plan::InnerJoin { left, right, .. } => {
                    assert!(matches!(
                        *left,
                        Plan::UnresolvedTable { ref alias, .. } if alias.as_deref() == Some("r")
                    ));
                    assert!(matches!(*right, Plan::UnresolvedTable { .. }));
                }
                other => panic!("expected join, got {}", other),
            },
            other => panic!("expected project, got {}", other),
        }
    }

    #[test]
    fn test_group_by_lowering() {
        let plan = query_plan(
            "SELECT commit_hash, COUNT(blob_hash) FROM commit_blobs GROUP BY commit_hash",
        );
        match plan {
            Plan::GroupBy {
                keys, aggregates, ..
            } => {
                assert_eq!(keys.len(), 1);
                assert_eq!(aggregates.len(), 2);
                assert!(aggregates[1].has_aggregate());
            }
            other => panic!("expected group-by, got {}", other),
        }
    }

    #[test]
    fn test_count_star_and_distinct() {
        let plan = query_plan("SELECT COUNT(*) FROM commits");
        match plan {
            Plan::GroupBy { aggregates, .. } => {
                assert!(matches!(
                    aggregates[0],
                    Expr::Aggregate {
                        func: AggFunc::Count,
                        arg: None,
                        distinct: false
                    }
                ));
            }
            other => panic!("expected group-by, got {}", other),
        }

        let plan = query_plan("SELECT COUNT(DISTINCT ref_name) FROM refs");
        match plan {
            Plan::GroupBy { aggregates, .. } => {
                assert!(matches!(
                    aggregates[0],
                    Expr::Aggregate { distinct: true, .. }
                ));
            }
            other => panic!("expected group-by, got {}", other),
        }
    }

    #[test]
    fn test_subquery_in_from() {
        let plan = query_plan(
            "SELECT first_commit_year FROM \
             (SELECT YEAR(commit_author_when) AS first_commit_year FROM commits) y",
        );
        match plan {
            Plan::Project { child, .. } => match *child {
                Plan::SubqueryAlias { name, child } => {
                    assert_eq!(name, "y");
                    assert!(matches!(*child, Plan::Project { .. }));
                }
                other => panic!("expected subquery alias, got {}", other),
            },
            other => panic!("expected project, got {}", other),
        }
    }

    #[test]
    fn test_order_by_alias_sorts_above_projection() {
        let plan = query_plan(
            "SELECT YEAR(commit_author_when) AS y FROM commits ORDER BY y",
        );
        match plan {
            Plan::Sort { child, .. } => assert!(matches!(*child, Plan::Project { .. })),
            other => panic!("expected sort above project, got {}", other),
        }
    }

    #[test]
    fn test_having_rewrites_to_output_column() {
        let plan = query_plan(
            "SELECT commit_hash, COUNT(*) AS n FROM commit_blobs \
             GROUP BY commit_hash HAVING COUNT(*) > 2",
        );
        match plan {
            Plan::Filter { predicate, child } => {
                assert!(matches!(*child, Plan::GroupBy { .. }));
                let mut found = false;
                predicate.visit(&mut |e| {
                    if matches!(e, Expr::Column { name, .. } if name == "n") {
                        found = true;
                    }
                });
                assert!(found, "aggregate was not rewritten: {}", predicate);
            }
            other => panic!("expected filter above group-by, got {}", other),
        }
    }

    #[test]
    fn test_special_statements() {
        assert_eq!(Parser::parse("SHOW TABLES").unwrap(), Statement::ShowTables);
        assert_eq!(
            Parser::parse("DESCRIBE refs").unwrap(),
            Statement::Describe("refs".into())
        );
        assert_eq!(
            Parser::parse("SHOW INDEXES FROM refs").unwrap(),
            Statement::ShowIndexes {
                table: Some("refs".into())
            }
        );
        assert_eq!(
            Parser::parse("CREATE INDEX refs_idx ON refs(ref_name) USING disk").unwrap(),
            Statement::CreateIndex {
                name: "refs_idx".into(),
                table: "refs".into(),
                columns: vec!["ref_name".into()],
                driver: Some("disk".into()),
            }
        );
        assert_eq!(
            Parser::parse("DROP INDEX refs_idx ON refs").unwrap(),
            Statement::DropIndex {
                name: "refs_idx".into(),
                table: "refs".into(),
            }
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(Parser::parse(""), Err(ParseError::EmptyQuery)));
        assert!(matches!(
            Parser::parse("SELECT 1; SELECT 2"),
            Err(ParseError::MultipleStatements)
        ));
        assert!(Parser::parse("INSERT INTO refs VALUES ('x')").is_err());
        assert!(matches!(
            Parser::parse("CREATE INDEX broken ON refs"),
            Err(ParseError::MissingClause(_))
        ));
    }

    #[test]
    fn test_like_and_regexp() {
        let plan = query_plan("SELECT * FROM refs WHERE ref_name LIKE 'refs/%'");
        match plan {
            Plan::Filter { predicate, .. } => {
                assert!(matches!(predicate, Expr::Like { .. }));
            }
            other => panic!("expected filter, got {}", other),
        }

        let plan = query_plan("SELECT * FROM refs WHERE ref_name REGEXP '^refs/'");
        match plan {
            Plan::Filter { predicate, .. } => {
                assert!(matches!(predicate, Expr::Regexp { .. }));
            }
            other => panic!("expected filter, got {}", other),
        }
    }
}
