//! SQL expression tree.
//!
//! Expressions start out with name references (`Column`, `Function`) and are
//! rewritten by the analyzer into positional `Field` and bound `Call` nodes.
//! Every expression evaluates against a single row.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;

use super::functions::{AggFunc, ScalarFunc};
use super::schema::Schema;
use super::value::{Value, ValueKind};
use crate::executor::{ExecuteError, ExecuteResult};
use crate::session::Context;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// An unresolved column reference.
    Column { table: Option<String>, name: String },
    /// A resolved column: 0-based position in the child schema.
    Field {
        index: usize,
        kind: ValueKind,
        name: String,
    },
    /// Expression with an output name.
    Alias { expr: Box<Expr>, name: String },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, expr: Box<Expr> },
    IsNull { expr: Box<Expr>, negated: bool },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    /// SQL LIKE: `%` matches any run, `_` one character, `\` escapes.
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Regexp {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_branch: Option<Box<Expr>>,
    },
    /// An unresolved function call.
    Function { name: String, args: Vec<Expr> },
    /// A resolved scalar function call.
    Call { func: ScalarFunc, args: Vec<Expr> },
    /// An aggregate, only legal under GROUP BY handling.
    Aggregate {
        func: AggFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn lit(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op: BinaryOp::Eq,
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op: BinaryOp::And,
            right: Box::new(right),
        }
    }

    /// Join a list of conjuncts back into one AND tree. None for empty input.
    pub fn join_and(mut conjuncts: Vec<Expr>) -> Option<Expr> {
        let first = if conjuncts.is_empty() {
            return None;
        } else {
            conjuncts.remove(0)
        };
        Some(conjuncts.into_iter().fold(first, Expr::and))
    }

    /// Split an AND tree into its conjuncts.
    pub fn split_and(self) -> Vec<Expr> {
        match self {
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut out = left.split_and();
                out.extend(right.split_and());
                out
            }
            other => vec![other],
        }
    }

    /// Whether every name in this tree is bound.
    pub fn resolved(&self) -> bool {
        let mut ok = true;
        self.visit(&mut |e| {
            if matches!(e, Expr::Column { .. } | Expr::Function { .. }) {
                ok = false;
            }
        });
        ok
    }

    /// Result type of this expression, best effort before full analysis.
    pub fn result_kind(&self) -> ValueKind {
        match self {
            Expr::Literal(v) => v.kind().unwrap_or(ValueKind::Text),
            Expr::Column { .. } => ValueKind::Text,
            Expr::Field { kind, .. } => *kind,
            Expr::Alias { expr, .. } => expr.result_kind(),
            Expr::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    ValueKind::Bool
                } else if left.result_kind() == ValueKind::Double
                    || right.result_kind() == ValueKind::Double
                    || matches!(op, BinaryOp::Divide)
                {
                    ValueKind::Double
                } else {
                    ValueKind::Int64
                }
            }
            Expr::Unary { op: UnaryOp::Not, .. } => ValueKind::Bool,
            Expr::Unary { op: UnaryOp::Neg, expr } => expr.result_kind(),
            Expr::IsNull { .. } | Expr::InList { .. } | Expr::Between { .. } => ValueKind::Bool,
            Expr::Like { .. } | Expr::Regexp { .. } => ValueKind::Bool,
            Expr::Case { branches, else_branch, .. } => branches
                .first()
                .map(|(_, v)| v.result_kind())
                .or_else(|| else_branch.as_ref().map(|e| e.result_kind()))
                .unwrap_or(ValueKind::Text),
            Expr::Function { .. } => ValueKind::Text,
            Expr::Call { func, .. } => func.result_kind(),
            Expr::Aggregate { func, arg, .. } => func.result_kind(arg.as_deref()),
        }
    }

    /// Output name of this expression when projected.
    pub fn output_name(&self) -> String {
        match self {
            Expr::Alias { name, .. } => name.clone(),
            Expr::Field { name, .. } => name.clone(),
            Expr::Column { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Source table of this expression when it is a plain column.
    pub fn output_source(&self) -> String {
        match self {
            Expr::Column { table, .. } => table.clone().unwrap_or_default(),
            Expr::Alias { expr, .. } => expr.output_source(),
            _ => String::new(),
        }
    }

    /// Walk the tree without rebuilding it.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Alias { expr, .. }
            | Expr::Unary { expr, .. }
            | Expr::IsNull { expr, .. } => expr.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::InList { expr, list, .. } => {
                expr.visit(f);
                for e in list {
                    e.visit(f);
                }
            }
            Expr::Between { expr, low, high, .. } => {
                expr.visit(f);
                low.visit(f);
                high.visit(f);
            }
            Expr::Like { expr, pattern, .. } | Expr::Regexp { expr, pattern, .. } => {
                expr.visit(f);
                pattern.visit(f);
            }
            Expr::Case {
                operand,
                branches,
                else_branch,
            } => {
                if let Some(op) = operand {
                    op.visit(f);
                }
                for (w, t) in branches {
                    w.visit(f);
                    t.visit(f);
                }
                if let Some(e) = else_branch {
                    e.visit(f);
                }
            }
            Expr::Function { args, .. } | Expr::Call { args, .. } => {
                for a in args {
                    a.visit(f);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(a) = arg {
                    a.visit(f);
                }
            }
            Expr::Literal(_) | Expr::Column { .. } | Expr::Field { .. } => {}
        }
    }

    /// Rebuild the tree bottom-up, applying `f` to every rebuilt node.
    pub fn transform_up<E>(self, f: &mut dyn FnMut(Expr) -> Result<Expr, E>) -> Result<Expr, E> {
        let rebuilt = match self {
            Expr::Alias { expr, name } => Expr::Alias {
                expr: Box::new(expr.transform_up(f)?),
                name,
            },
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.transform_up(f)?),
                op,
                right: Box::new(right.transform_up(f)?),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op,
                expr: Box::new(expr.transform_up(f)?),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.transform_up(f)?),
                negated,
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: Box::new(expr.transform_up(f)?),
                list: list
                    .into_iter()
                    .map(|e| e.transform_up(f))
                    .collect::<Result<_, E>>()?,
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.transform_up(f)?),
                low: Box::new(low.transform_up(f)?),
                high: Box::new(high.transform_up(f)?),
                negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(expr.transform_up(f)?),
                pattern: Box::new(pattern.transform_up(f)?),
                negated,
            },
            Expr::Regexp {
                expr,
                pattern,
                negated,
            } => Expr::Regexp {
                expr: Box::new(expr.transform_up(f)?),
                pattern: Box::new(pattern.transform_up(f)?),
                negated,
            },
            Expr::Case {
                operand,
                branches,
                else_branch,
            } => Expr::Case {
                operand: operand.map(|e| e.transform_up(f).map(Box::new)).transpose()?,
                branches: branches
                    .into_iter()
                    .map(|(w, t)| Ok((w.transform_up(f)?, t.transform_up(f)?)))
                    .collect::<Result<_, E>>()?,
                else_branch: else_branch
                    .map(|e| e.transform_up(f).map(Box::new))
                    .transpose()?,
            },
            Expr::Function { name, args } => Expr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|e| e.transform_up(f))
                    .collect::<Result<_, E>>()?,
            },
            Expr::Call { func, args } => Expr::Call {
                func,
                args: args
                    .into_iter()
                    .map(|e| e.transform_up(f))
                    .collect::<Result<_, E>>()?,
            },
            Expr::Aggregate { func, arg, distinct } => Expr::Aggregate {
                func,
                arg: arg.map(|e| e.transform_up(f).map(Box::new)).transpose()?,
                distinct,
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Collect the field indices referenced by this expression.
    pub fn field_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Field { index, .. } = e {
                if !out.contains(index) {
                    out.push(*index);
                }
            }
        });
        out
    }

    /// Rewrite every field index through `map`. Used when an expression moves
    /// across a join boundary.
    pub fn map_field_indices(self, map: &dyn Fn(usize) -> usize) -> Expr {
        // Index remapping cannot fail.
        self.transform_up::<std::convert::Infallible>(&mut |e| {
            Ok(match e {
                Expr::Field { index, kind, name } => Expr::Field {
                    index: map(index),
                    kind,
                    name,
                },
                other => other,
            })
        })
        .unwrap_or_else(|e| match e {})
    }

    /// Whether this expression contains any aggregate call.
    pub fn has_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }

    // ==================== Evaluation ====================

    /// Evaluate against a row. The context carries cancellation and the
    /// session resources some functions need.
    pub fn eval(&self, ctx: &Context, row: &[Value]) -> ExecuteResult<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),

            Expr::Column { name, .. } => Err(ExecuteError::Internal(format!(
                "unresolved column in execution: {}",
                name
            ))),

            Expr::Field { index, .. } => row
                .get(*index)
                .cloned()
                .ok_or_else(|| ExecuteError::Internal(format!("field index {} out of range", index))),

            Expr::Alias { expr, .. } => expr.eval(ctx, row),

            Expr::Binary { left, op, right } => eval_binary(ctx, row, left, *op, right),

            Expr::Unary { op, expr } => {
                let v = expr.eval(ctx, row)?;
                match op {
                    UnaryOp::Not => Ok(match v {
                        Value::Null => Value::Null,
                        other => Value::Bool(!other.is_truthy()),
                    }),
                    UnaryOp::Neg => match v {
                        Value::Null => Ok(Value::Null),
                        Value::Int32(n) => Ok(Value::Int32(-n)),
                        Value::Int64(n) => Ok(Value::Int64(-n)),
                        Value::Double(d) => Ok(Value::Double(-d)),
                        other => other
                            .as_f64()
                            .map(|f| Value::Double(-f))
                            .ok_or_else(|| ExecuteError::TypeMismatch(format!("cannot negate {}", other))),
                    },
                }
            }

            Expr::IsNull { expr, negated } => {
                let is_null = expr.eval(ctx, row)?.is_null();
                Ok(Value::Bool(is_null != *negated))
            }

            Expr::InList { expr, list, negated } => {
                let v = expr.eval(ctx, row)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in list {
                    let iv = item.eval(ctx, row)?;
                    match v.sql_eq(&iv) {
                        Some(true) => return Ok(Value::Bool(!*negated)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Bool(*negated))
                }
            }

            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = expr.eval(ctx, row)?;
                let lo = low.eval(ctx, row)?;
                let hi = high.eval(ctx, row)?;
                match (v.sql_cmp(&lo), v.sql_cmp(&hi)) {
                    (Some(a), Some(b)) => {
                        let within = a != std::cmp::Ordering::Less && b != std::cmp::Ordering::Greater;
                        Ok(Value::Bool(within != *negated))
                    }
                    _ => Ok(Value::Null),
                }
            }

            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let v = expr.eval(ctx, row)?;
                let p = pattern.eval(ctx, row)?;
                match (&v, &p) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    _ => {
                        let re = cached_regex(&like_to_regex(&p.to_string()))?;
                        Ok(Value::Bool(re.is_match(&v.to_string()) != *negated))
                    }
                }
            }

            Expr::Regexp {
                expr,
                pattern,
                negated,
            } => {
                let v = expr.eval(ctx, row)?;
                let p = pattern.eval(ctx, row)?;
                match (&v, &p) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    _ => {
                        let re = cached_regex(&p.to_string())?;
                        Ok(Value::Bool(re.is_match(&v.to_string()) != *negated))
                    }
                }
            }

            Expr::Case {
                operand,
                branches,
                else_branch,
            } => {
                for (when, then) in branches {
                    let hit = match operand {
                        Some(op) => {
                            let lhs = op.eval(ctx, row)?;
                            lhs.sql_eq(&when.eval(ctx, row)?).unwrap_or(false)
                        }
                        None => when.eval(ctx, row)?.is_truthy(),
                    };
                    if hit {
                        return then.eval(ctx, row);
                    }
                }
                match else_branch {
                    Some(e) => e.eval(ctx, row),
                    None => Ok(Value::Null),
                }
            }

            Expr::Function { name, .. } => Err(ExecuteError::Internal(format!(
                "unresolved function in execution: {}",
                name
            ))),

            Expr::Call { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(a.eval(ctx, row)?);
                }
                func.eval(ctx, &values)
            }

            Expr::Aggregate { func, .. } => Err(ExecuteError::Internal(format!(
                "aggregate {} evaluated outside GROUP BY",
                func
            ))),
        }
    }

    /// Evaluate as a predicate: NULL is not truthy.
    pub fn eval_truthy(&self, ctx: &Context, row: &[Value]) -> ExecuteResult<bool> {
        Ok(self.eval(ctx, row)?.is_truthy())
    }
}

fn eval_binary(
    ctx: &Context,
    row: &[Value],
    left: &Expr,
    op: BinaryOp,
    right: &Expr,
) -> ExecuteResult<Value> {
    // Logical operators short-circuit and keep three-valued semantics.
    if op.is_logical() {
        let l = left.eval(ctx, row)?;
        return match op {
            BinaryOp::And => {
                if !l.is_null() && !l.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                let r = right.eval(ctx, row)?;
                if !r.is_null() && !r.is_truthy() {
                    Ok(Value::Bool(false))
                } else if l.is_null() || r.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Bool(true))
                }
            }
            BinaryOp::Or => {
                if !l.is_null() && l.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                let r = right.eval(ctx, row)?;
                if !r.is_null() && r.is_truthy() {
                    Ok(Value::Bool(true))
                } else if l.is_null() || r.is_null() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Bool(false))
                }
            }
            _ => unreachable!(),
        };
    }

    let l = left.eval(ctx, row)?;
    let r = right.eval(ctx, row)?;

    if op.is_comparison() {
        use std::cmp::Ordering::*;
        let ord = match l.sql_cmp(&r) {
            Some(o) => o,
            None => return Ok(Value::Null),
        };
        let out = match op {
            BinaryOp::Eq => ord == Equal,
            BinaryOp::NotEq => ord != Equal,
            BinaryOp::Lt => ord == Less,
            BinaryOp::LtEq => ord != Greater,
            BinaryOp::Gt => ord == Greater,
            BinaryOp::GtEq => ord != Less,
            _ => unreachable!(),
        };
        return Ok(Value::Bool(out));
    }

    // Arithmetic: NULL propagates, integer inputs keep integer results where
    // the operation allows it.
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    let (li, ri) = (l.as_i64(), r.as_i64());
    let both_int = li.is_some()
        && ri.is_some()
        && !matches!(l, Value::Double(_))
        && !matches!(r, Value::Double(_));
    let lf = l
        .as_f64()
        .ok_or_else(|| ExecuteError::TypeMismatch(format!("non-numeric operand: {}", l)))?;
    let rf = r
        .as_f64()
        .ok_or_else(|| ExecuteError::TypeMismatch(format!("non-numeric operand: {}", r)))?;

    match op {
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply => {
            if both_int {
                let (a, b) = (li.unwrap(), ri.unwrap());
                let out = match op {
                    BinaryOp::Plus => a.checked_add(b),
                    BinaryOp::Minus => a.checked_sub(b),
                    BinaryOp::Multiply => a.checked_mul(b),
                    _ => unreachable!(),
                };
                match out {
                    Some(n) => Ok(Value::Int64(n)),
                    None => Ok(Value::Double(match op {
                        BinaryOp::Plus => lf + rf,
                        BinaryOp::Minus => lf - rf,
                        _ => lf * rf,
                    })),
                }
            } else {
                Ok(Value::Double(match op {
                    BinaryOp::Plus => lf + rf,
                    BinaryOp::Minus => lf - rf,
                    _ => lf * rf,
                }))
            }
        }
        BinaryOp::Divide => {
            if rf == 0.0 {
                Err(ExecuteError::DivisionByZero)
            } else {
                Ok(Value::Double(lf / rf))
            }
        }
        BinaryOp::Modulo => {
            if rf == 0.0 {
                Err(ExecuteError::DivisionByZero)
            } else if both_int {
                Ok(Value::Int64(li.unwrap() % ri.unwrap()))
            } else {
                Ok(Value::Double(lf % rf))
            }
        }
        _ => unreachable!(),
    }
}

/// Translate a LIKE pattern into an anchored, case-insensitive regex.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Process-wide compiled pattern cache shared by LIKE and REGEXP.
fn cached_regex(pattern: &str) -> ExecuteResult<Regex> {
    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock();
    if let Some(re) = guard.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)
        .map_err(|e| ExecuteError::TypeMismatch(format!("invalid pattern: {}", e)))?;
    guard.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Build the output schema of a projection list over a child schema.
pub fn projection_schema(exprs: &[Expr], _child: &Schema) -> Schema {
    Schema::new(
        exprs
            .iter()
            .map(|e| {
                super::schema::Column::new(e.output_name(), e.result_kind(), true, e.output_source())
            })
            .collect(),
    )
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => match v {
                Value::Text(s) => write!(f, "'{}'", s),
                other => write!(f, "{}", other),
            },
            Expr::Column { table: Some(t), name } => write!(f, "{}.{}", t, name),
            Expr::Column { table: None, name } => write!(f, "{}", name),
            Expr::Field { name, .. } => write!(f, "{}", name),
            Expr::Alias { expr, name } => write!(f, "{} AS {}", expr, name),
            Expr::Binary { left, op, right } => {
                let sym = match op {
                    BinaryOp::Eq => "=",
                    BinaryOp::NotEq => "<>",
                    BinaryOp::Lt => "<",
                    BinaryOp::LtEq => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::GtEq => ">=",
                    BinaryOp::And => "AND",
                    BinaryOp::Or => "OR",
                    BinaryOp::Plus => "+",
                    BinaryOp::Minus => "-",
                    BinaryOp::Multiply => "*",
                    BinaryOp::Divide => "/",
                    BinaryOp::Modulo => "%",
                };
                write!(f, "({} {} {})", left, sym, right)
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT {}", expr),
                UnaryOp::Neg => write!(f, "-{}", expr),
            },
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::InList { expr, list, negated } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(f, "{} {}LIKE {}", expr, if *negated { "NOT " } else { "" }, pattern),
            Expr::Regexp {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{} {}REGEXP {}",
                expr,
                if *negated { "NOT " } else { "" },
                pattern
            ),
            Expr::Case { .. } => write!(f, "CASE"),
            Expr::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Aggregate { func, arg, distinct } => {
                write!(f, "{}(", func)?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                match arg {
                    Some(a) => write!(f, "{}", a)?,
                    None => write!(f, "*")?,
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Context;

    fn ctx() -> Context {
        Context::for_tests()
    }

    fn field(i: usize) -> Expr {
        Expr::Field {
            index: i,
            kind: ValueKind::Text,
            name: format!("c{}", i),
        }
    }

    #[test]
    fn test_field_eval() {
        let row = vec![Value::text("a"), Value::Int64(2)];
        assert_eq!(field(0).eval(&ctx(), &row).unwrap(), Value::text("a"));
        assert_eq!(field(1).eval(&ctx(), &row).unwrap(), Value::Int64(2));
    }

    #[test]
    fn test_comparison_null() {
        let e = Expr::eq(Expr::lit(Value::Null), Expr::lit(Value::Int64(1)));
        assert_eq!(e.eval(&ctx(), &[]).unwrap(), Value::Null);
        assert!(!e.eval_truthy(&ctx(), &[]).unwrap());
    }

    #[test]
    fn test_and_short_circuit_with_null() {
        // false AND NULL = false, true AND NULL = NULL
        let false_and_null = Expr::and(Expr::lit(Value::Bool(false)), Expr::lit(Value::Null));
        assert_eq!(false_and_null.eval(&ctx(), &[]).unwrap(), Value::Bool(false));

        let true_and_null = Expr::and(Expr::lit(Value::Bool(true)), Expr::lit(Value::Null));
        assert_eq!(true_and_null.eval(&ctx(), &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_like() {
        let like = Expr::Like {
            expr: Box::new(Expr::lit(Value::text("refs/heads/master"))),
            pattern: Box::new(Expr::lit(Value::text("refs/%/master"))),
            negated: false,
        };
        assert_eq!(like.eval(&ctx(), &[]).unwrap(), Value::Bool(true));

        let underscore = Expr::Like {
            expr: Box::new(Expr::lit(Value::text("abc"))),
            pattern: Box::new(Expr::lit(Value::text("a_c"))),
            negated: false,
        };
        assert_eq!(underscore.eval(&ctx(), &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_like_escapes_metacharacters() {
        let like = Expr::Like {
            expr: Box::new(Expr::lit(Value::text("a.c"))),
            pattern: Box::new(Expr::lit(Value::text("a.c"))),
            negated: false,
        };
        assert_eq!(like.eval(&ctx(), &[]).unwrap(), Value::Bool(true));

        // The dot is literal, so "abc" must not match.
        let like = Expr::Like {
            expr: Box::new(Expr::lit(Value::text("abc"))),
            pattern: Box::new(Expr::lit(Value::text("a.c"))),
            negated: false,
        };
        assert_eq!(like.eval(&ctx(), &[]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_in_list_null_semantics() {
        let in_list = Expr::InList {
            expr: Box::new(Expr::lit(Value::Int64(1))),
            list: vec![Expr::lit(Value::Int64(2)), Expr::lit(Value::Null)],
            negated: false,
        };
        // 1 IN (2, NULL) is NULL, not false.
        assert_eq!(in_list.eval(&ctx(), &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_between() {
        let between = Expr::Between {
            expr: Box::new(Expr::lit(Value::Int64(5))),
            low: Box::new(Expr::lit(Value::Int64(1))),
            high: Box::new(Expr::lit(Value::Int64(10))),
            negated: false,
        };
        assert_eq!(between.eval(&ctx(), &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_arithmetic_integer_preservation() {
        let add = Expr::Binary {
            left: Box::new(Expr::lit(Value::Int64(2))),
            op: BinaryOp::Plus,
            right: Box::new(Expr::lit(Value::Int64(3))),
        };
        assert_eq!(add.eval(&ctx(), &[]).unwrap(), Value::Int64(5));

        let div = Expr::Binary {
            left: Box::new(Expr::lit(Value::Int64(1))),
            op: BinaryOp::Divide,
            right: Box::new(Expr::lit(Value::Int64(0))),
        };
        assert!(matches!(div.eval(&ctx(), &[]), Err(ExecuteError::DivisionByZero)));
    }

    #[test]
    fn test_split_and_join_roundtrip() {
        let e = Expr::and(
            Expr::eq(field(0), Expr::lit(Value::text("x"))),
            Expr::and(
                Expr::eq(field(1), Expr::lit(Value::text("y"))),
                Expr::eq(field(2), Expr::lit(Value::text("z"))),
            ),
        );
        let parts = e.split_and();
        assert_eq!(parts.len(), 3);
        let rejoined = Expr::join_and(parts).unwrap();
        assert_eq!(rejoined.split_and().len(), 3);
    }

    #[test]
    fn test_transform_up_rewrites_fields() {
        let e = Expr::eq(field(0), field(3));
        let shifted = e.map_field_indices(&|i| i + 10);
        assert_eq!(shifted.field_indices(), vec![10, 13]);
    }

    #[test]
    fn test_resolved() {
        assert!(!Expr::col("x").resolved());
        assert!(field(0).resolved());
        assert!(!Expr::Function {
            name: "year".into(),
            args: vec![field(0)]
        }
        .resolved());
    }
}
