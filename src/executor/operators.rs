//! Volcano-style operators for query execution.
//!
//! Each plan node maps to an iterator; rows are pulled one at a time
//! through the tree. Every operator observes cancellation between rows.

use std::collections::HashMap;

use crate::planner::Plan;
use crate::session::Context;
use crate::sql::{AggFunc, BinaryOp, Expr, Row, Value};

use super::error::{ExecuteError, ExecuteResult};
use super::iter::{RowIter, RowsIter};

/// Build the iterator tree for an analyzed plan.
pub fn build_iter(plan: &Plan, ctx: &Context) -> ExecuteResult<Box<dyn RowIter>> {
    match plan {
        Plan::UnresolvedTable { name, .. } => Err(ExecuteError::Internal(format!(
            "unresolved table reached execution: {}",
            name
        ))),

        Plan::Table(node) => {
            if let Some(lookup) = &node.index {
                let db = ctx.session().database().to_string();
                match ctx.indexes().get(&db, node.table.name(), &lookup.index_id) {
                    Some(index) => {
                        let locators: Vec<Vec<u8>> = index.values(&lookup.key)?.collect();
                        let inner = node.table.rows_for_index(ctx, locators)?;
                        // Pushed filters still apply to index-provided rows.
                        return Ok(Box::new(FilterIter {
                            ctx: ctx.clone(),
                            predicate: Expr::join_and(node.filters.clone())
                                .unwrap_or(Expr::Literal(Value::Bool(true))),
                            child: inner,
                        }));
                    }
                    // A vanished index falls back to the plain scan.
                    None => {
                        tracing::warn!(index = %lookup.index_id, "index not loaded, falling back to scan");
                    }
                }
            }
            node.table
                .row_iter(ctx, node.filters.clone(), node.projection.clone())
        }

        Plan::Filter { predicate, child } => Ok(Box::new(FilterIter {
            ctx: ctx.clone(),
            predicate: predicate.clone(),
            child: build_iter(child, ctx)?,
        })),

        Plan::Project { exprs, child } => Ok(Box::new(ProjectIter {
            ctx: ctx.clone(),
            exprs: exprs.clone(),
            child: build_iter(child, ctx)?,
        })),

        Plan::Sort { fields, child } => Ok(Box::new(SortIter {
            ctx: ctx.clone(),
            fields: fields.clone(),
            child: Some(build_iter(child, ctx)?),
            sorted: None,
        })),

        Plan::Limit { n, child } => Ok(Box::new(LimitIter {
            ctx: ctx.clone(),
            remaining: *n,
            child: build_iter(child, ctx)?,
        })),

        Plan::Offset { n, child } => Ok(Box::new(OffsetIter {
            ctx: ctx.clone(),
            to_skip: *n,
            child: build_iter(child, ctx)?,
        })),

        Plan::Distinct { child } => Ok(Box::new(DistinctIter {
            ctx: ctx.clone(),
            seen: Default::default(),
            child: build_iter(child, ctx)?,
        })),

        Plan::GroupBy {
            keys,
            aggregates,
            child,
        } => Ok(Box::new(GroupByIter {
            ctx: ctx.clone(),
            keys: keys.clone(),
            outputs: aggregates.clone(),
            child: Some(build_iter(child, ctx)?),
            groups: None,
        })),

        Plan::CrossJoin { left, right } => Ok(Box::new(NestedLoopJoinIter {
            ctx: ctx.clone(),
            left: build_iter(left, ctx)?,
            right_plan: (**right).clone(),
            condition: None,
            current_left: None,
            right: None,
        })),

        Plan::InnerJoin {
            condition,
            left,
            right,
        } => {
            let left_width = left.schema().len();
            match hash_join_keys(condition, left_width) {
                Some((left_keys, right_keys, residual)) => Ok(Box::new(HashJoinIter {
                    ctx: ctx.clone(),
                    left: build_iter(left, ctx)?,
                    right_plan: (**right).clone(),
                    left_keys,
                    right_keys,
                    residual,
                    table: None,
                    pending: Vec::new(),
                })),
                None => Ok(Box::new(NestedLoopJoinIter {
                    ctx: ctx.clone(),
                    left: build_iter(left, ctx)?,
                    right_plan: (**right).clone(),
                    condition: Some(condition.clone()),
                    current_left: None,
                    right: None,
                })),
            }
        }

        // Re-executed from scratch every time an iterator is requested.
        Plan::SubqueryAlias { child, .. } => build_iter(child, ctx),

        Plan::Exchange { width, child } => super::exchange::exchange_iter(ctx, *width, child),

        Plan::Squashed(squashed) => Ok(Box::new(super::squash::SquashIter::new(
            ctx,
            squashed.clone(),
        ))),
    }
}

/// Decompose a join condition into hash-join key pairs. Every conjunct must
/// be either a cross-side equality on plain fields (a key pair) or a
/// residual predicate; a condition with no key pairs is not hash-joinable.
fn hash_join_keys(
    condition: &Expr,
    left_width: usize,
) -> Option<(Vec<usize>, Vec<usize>, Option<Expr>)> {
    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    let mut residual = Vec::new();

    for conjunct in condition.clone().split_and() {
        if let Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } = &conjunct
        {
            if let (Expr::Field { index: a, .. }, Expr::Field { index: b, .. }) =
                (left.as_ref(), right.as_ref())
            {
                let (l, r) = if *a < left_width && *b >= left_width {
                    (*a, *b - left_width)
                } else if *b < left_width && *a >= left_width {
                    (*b, *a - left_width)
                } else {
                    residual.push(conjunct);
                    continue;
                };
                left_keys.push(l);
                right_keys.push(r);
                continue;
            }
        }
        residual.push(conjunct);
    }

    if left_keys.is_empty() {
        None
    } else {
        Some((left_keys, right_keys, Expr::join_and(residual)))
    }
}

// ==================== Filter / Project ====================

pub struct FilterIter {
    pub(crate) ctx: Context,
    pub(crate) predicate: Expr,
    pub(crate) child: Box<dyn RowIter>,
}

impl RowIter for FilterIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            self.ctx.check()?;
            match self.child.next_row()? {
                Some(row) => {
                    if self.predicate.eval_truthy(&self.ctx, &row)? {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.child.close()
    }
}

struct ProjectIter {
    ctx: Context,
    exprs: Vec<Expr>,
    child: Box<dyn RowIter>,
}

impl RowIter for ProjectIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        self.ctx.check()?;
        let row = match self.child.next_row()? {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut out = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            match expr.eval(&self.ctx, &row) {
                Ok(v) => out.push(v),
                // A failing external service degrades a projected value to
                // NULL with a warning; in a WHERE it stays fatal.
                Err(ExecuteError::ExternalService(msg)) => {
                    tracing::warn!(error = %msg, "external function degraded to NULL");
                    out.push(Value::Null);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.child.close()
    }
}

// ==================== Sort / Limit / Offset / Distinct ====================

struct SortIter {
    ctx: Context,
    fields: Vec<crate::planner::SortField>,
    child: Option<Box<dyn RowIter>>,
    sorted: Option<std::vec::IntoIter<Row>>,
}

impl RowIter for SortIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        self.ctx.check()?;
        if self.sorted.is_none() {
            let mut child = self.child.take().ok_or_else(|| {
                ExecuteError::Internal("sort iterator reused after close".into())
            })?;
            let mut keyed: Vec<(Vec<Value>, Row)> = Vec::new();
            loop {
                self.ctx.check()?;
                match child.next_row()? {
                    Some(row) => {
                        let mut key = Vec::with_capacity(self.fields.len());
                        for field in &self.fields {
                            key.push(field.expr.eval(&self.ctx, &row)?);
                        }
                        keyed.push((key, row));
                    }
                    None => break,
                }
            }
            child.close()?;

            let fields = self.fields.clone();
            // Stable sort keeps the child's order on ties.
            keyed.sort_by(|(a, _), (b, _)| {
                for (i, field) in fields.iter().enumerate() {
                    let ord = a[i].sort_cmp(&b[i]);
                    let ord = if field.ascending { ord } else { ord.reverse() };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            self.sorted = Some(
                keyed
                    .into_iter()
                    .map(|(_, row)| row)
                    .collect::<Vec<_>>()
                    .into_iter(),
            );
        }
        Ok(self.sorted.as_mut().and_then(|it| it.next()))
    }

    fn close(&mut self) -> ExecuteResult<()> {
        if let Some(mut child) = self.child.take() {
            child.close()?;
        }
        self.sorted = None;
        Ok(())
    }
}

struct LimitIter {
    ctx: Context,
    remaining: usize,
    child: Box<dyn RowIter>,
}

impl RowIter for LimitIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        self.ctx.check()?;
        // Never pull past the limit.
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.child.next_row()? {
            Some(row) => {
                self.remaining -= 1;
                Ok(Some(row))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.child.close()
    }
}

struct OffsetIter {
    ctx: Context,
    to_skip: usize,
    child: Box<dyn RowIter>,
}

impl RowIter for OffsetIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        while self.to_skip > 0 {
            self.ctx.check()?;
            if self.child.next_row()?.is_none() {
                self.to_skip = 0;
                return Ok(None);
            }
            self.to_skip -= 1;
        }
        self.ctx.check()?;
        self.child.next_row()
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.child.close()
    }
}

struct DistinctIter {
    ctx: Context,
    seen: std::collections::HashSet<Vec<u8>>,
    child: Box<dyn RowIter>,
}

impl RowIter for DistinctIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            self.ctx.check()?;
            match self.child.next_row()? {
                Some(row) => {
                    if self.seen.insert(Value::encode_tuple(&row)) {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.child.close()
    }
}

// ==================== Aggregation ====================

/// One accumulator per aggregate call, in pre-order over the output list.
enum AccState {
    Count(i64),
    CountDistinct(std::collections::HashSet<Vec<u8>>),
    Sum { total: f64, seen: bool },
    Avg { total: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AccState {
    fn new(func: AggFunc, distinct: bool) -> AccState {
        match (func, distinct) {
            (AggFunc::Count, true) => AccState::CountDistinct(Default::default()),
            (AggFunc::Count, false) => AccState::Count(0),
            (AggFunc::Sum, _) => AccState::Sum {
                total: 0.0,
                seen: false,
            },
            (AggFunc::Avg, _) => AccState::Avg { total: 0.0, count: 0 },
            (AggFunc::Min, _) => AccState::Min(None),
            (AggFunc::Max, _) => AccState::Max(None),
        }
    }

    fn update(&mut self, value: Option<Value>) -> ExecuteResult<()> {
        match self {
            AccState::Count(n) => {
                // COUNT(*) counts rows; COUNT(expr) skips NULLs.
                match value {
                    None => *n += 1,
                    Some(v) if !v.is_null() => *n += 1,
                    _ => {}
                }
            }
            AccState::CountDistinct(set) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        set.insert(Value::encode_tuple(&[v]));
                    }
                }
            }
            AccState::Sum { total, seen } => {
                if let Some(v) = value {
                    if !v.is_null() {
                        *total += v.as_f64().ok_or_else(|| {
                            ExecuteError::TypeMismatch(format!("SUM over non-numeric: {}", v))
                        })?;
                        *seen = true;
                    }
                }
            }
            AccState::Avg { total, count } => {
                if let Some(v) = value {
                    if !v.is_null() {
                        *total += v.as_f64().ok_or_else(|| {
                            ExecuteError::TypeMismatch(format!("AVG over non-numeric: {}", v))
                        })?;
                        *count += 1;
                    }
                }
            }
            AccState::Min(best) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let better = match best {
                            Some(b) => v.sql_cmp(b) == Some(std::cmp::Ordering::Less),
                            None => true,
                        };
                        if better {
                            *best = Some(v);
                        }
                    }
                }
            }
            AccState::Max(best) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let better = match best {
                            Some(b) => v.sql_cmp(b) == Some(std::cmp::Ordering::Greater),
                            None => true,
                        };
                        if better {
                            *best = Some(v);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            AccState::Count(n) => Value::Int64(*n),
            AccState::CountDistinct(set) => Value::Int64(set.len() as i64),
            AccState::Sum { total, seen } => {
                if *seen {
                    Value::Double(*total)
                } else {
                    Value::Null
                }
            }
            AccState::Avg { total, count } => {
                if *count > 0 {
                    Value::Double(total / *count as f64)
                } else {
                    Value::Null
                }
            }
            AccState::Min(v) | AccState::Max(v) => v.clone().unwrap_or(Value::Null),
        }
    }
}

/// The aggregate calls of the output list, in evaluation order.
fn collect_aggregates(outputs: &[Expr]) -> Vec<(AggFunc, Option<Expr>, bool)> {
    let mut out = Vec::new();
    for expr in outputs {
        expr.visit(&mut |e| {
            if let Expr::Aggregate {
                func,
                arg,
                distinct,
            } = e
            {
                out.push((*func, arg.as_deref().cloned(), *distinct));
            }
        });
    }
    out
}

/// Replace aggregate calls with their computed values, in the same order
/// they were collected.
fn substitute_aggregates(expr: Expr, values: &[Value], cursor: &mut usize) -> Expr {
    expr.transform_up::<std::convert::Infallible>(&mut |e| {
        Ok(match e {
            Expr::Aggregate { .. } => {
                let v = values.get(*cursor).cloned().unwrap_or(Value::Null);
                *cursor += 1;
                Expr::Literal(v)
            }
            other => other,
        })
    })
    .unwrap_or_else(|e| match e {})
}

struct GroupByIter {
    ctx: Context,
    keys: Vec<Expr>,
    outputs: Vec<Expr>,
    child: Option<Box<dyn RowIter>>,
    groups: Option<std::vec::IntoIter<Row>>,
}

impl GroupByIter {
    fn materialize(&mut self) -> ExecuteResult<Vec<Row>> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| ExecuteError::Internal("group-by iterator reused".into()))?;

        let agg_specs = collect_aggregates(&self.outputs);
        // Group key -> (representative row, accumulators), insertion order.
        let mut order: Vec<Vec<u8>> = Vec::new();
        let mut groups: HashMap<Vec<u8>, (Row, Vec<AccState>)> = HashMap::new();

        loop {
            self.ctx.check()?;
            let row = match child.next_row()? {
                Some(row) => row,
                None => break,
            };

            let mut key_values = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                key_values.push(key.eval(&self.ctx, &row)?);
            }
            let key = Value::encode_tuple(&key_values);

            let entry = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (
                    row.clone(),
                    agg_specs
                        .iter()
                        .map(|(f, _, d)| AccState::new(*f, *d))
                        .collect(),
                )
            });

            for (state, (_, arg, _)) in entry.1.iter_mut().zip(&agg_specs) {
                let value = match arg {
                    Some(a) => Some(a.eval(&self.ctx, &row)?),
                    None => None,
                };
                state.update(value)?;
            }
        }
        child.close()?;

        // A pure aggregation over zero rows still produces one row.
        if groups.is_empty() && self.keys.is_empty() {
            let accs: Vec<AccState> = agg_specs
                .iter()
                .map(|(f, _, d)| AccState::new(*f, *d))
                .collect();
            let empty: Row = Vec::new();
            order.push(Vec::new());
            groups.insert(Vec::new(), (empty, accs));
        }

        let mut rows = Vec::with_capacity(order.len());
        for key in order {
            let (representative, accs) = groups.remove(&key).expect("group recorded");
            let agg_values: Vec<Value> = accs.iter().map(AccState::finish).collect();
            let mut out = Vec::with_capacity(self.outputs.len());
            let mut cursor = 0usize;
            for output in &self.outputs {
                let substituted = substitute_aggregates(output.clone(), &agg_values, &mut cursor);
                out.push(substituted.eval(&self.ctx, &representative)?);
            }
            rows.push(out);
        }
        Ok(rows)
    }
}

impl RowIter for GroupByIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        self.ctx.check()?;
        if self.groups.is_none() {
            let rows = self.materialize()?;
            self.groups = Some(rows.into_iter());
        }
        Ok(self.groups.as_mut().and_then(|it| it.next()))
    }

    fn close(&mut self) -> ExecuteResult<()> {
        if let Some(mut child) = self.child.take() {
            child.close()?;
        }
        self.groups = None;
        Ok(())
    }
}

// ==================== Joins ====================

struct NestedLoopJoinIter {
    ctx: Context,
    left: Box<dyn RowIter>,
    right_plan: Plan,
    condition: Option<Expr>,
    current_left: Option<Row>,
    right: Option<Box<dyn RowIter>>,
}

impl RowIter for NestedLoopJoinIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        loop {
            self.ctx.check()?;

            if self.current_left.is_none() {
                match self.left.next_row()? {
                    Some(row) => {
                        self.current_left = Some(row);
                        // The right side restarts for every left row.
                        self.right = Some(build_iter(&self.right_plan, &self.ctx)?);
                    }
                    None => return Ok(None),
                }
            }

            let right = self.right.as_mut().expect("right iterator open");
            match right.next_row()? {
                Some(right_row) => {
                    let mut combined = self.current_left.clone().expect("left row set");
                    combined.extend(right_row);
                    match &self.condition {
                        Some(cond) if !cond.eval_truthy(&self.ctx, &combined)? => continue,
                        _ => return Ok(Some(combined)),
                    }
                }
                None => {
                    self.current_left = None;
                    if let Some(mut r) = self.right.take() {
                        r.close()?;
                    }
                }
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.left.close()?;
        if let Some(mut r) = self.right.take() {
            r.close()?;
        }
        Ok(())
    }
}

struct HashJoinIter {
    ctx: Context,
    left: Box<dyn RowIter>,
    right_plan: Plan,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    residual: Option<Expr>,
    /// Build side: right rows keyed by their join key.
    table: Option<HashMap<Vec<u8>, Vec<Row>>>,
    pending: Vec<Row>,
}

impl HashJoinIter {
    fn build(&mut self) -> ExecuteResult<()> {
        let mut table: HashMap<Vec<u8>, Vec<Row>> = HashMap::new();
        let mut right = build_iter(&self.right_plan, &self.ctx)?;
        loop {
            self.ctx.check()?;
            match right.next_row()? {
                Some(row) => {
                    let key_values: Vec<Value> =
                        self.right_keys.iter().map(|i| row[*i].clone()).collect();
                    if key_values.iter().any(Value::is_null) {
                        continue;
                    }
                    table
                        .entry(Value::encode_tuple(&key_values))
                        .or_default()
                        .push(row);
                }
                None => break,
            }
        }
        right.close()?;
        self.table = Some(table);
        Ok(())
    }
}

impl RowIter for HashJoinIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        if self.table.is_none() {
            self.build()?;
        }
        loop {
            self.ctx.check()?;

            if let Some(row) = self.pending.pop() {
                return Ok(Some(row));
            }

            let left_row = match self.left.next_row()? {
                Some(row) => row,
                None => return Ok(None),
            };
            let key_values: Vec<Value> =
                self.left_keys.iter().map(|i| left_row[*i].clone()).collect();
            if key_values.iter().any(Value::is_null) {
                continue;
            }
            let key = Value::encode_tuple(&key_values);
            if let Some(matches) = self.table.as_ref().expect("built").get(&key) {
                for right_row in matches {
                    let mut combined = left_row.clone();
                    combined.extend(right_row.iter().cloned());
                    let keep = match &self.residual {
                        Some(cond) => cond.eval_truthy(&self.ctx, &combined)?,
                        None => true,
                    };
                    if keep {
                        self.pending.push(combined);
                    }
                }
                // Emit matches in right-row order.
                self.pending.reverse();
            }
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        self.left.close()?;
        self.table = None;
        self.pending.clear();
        Ok(())
    }
}

/// Convenience used by tests and the engine: run a plan to completion.
pub fn run_to_rows(plan: &Plan, ctx: &Context) -> ExecuteResult<Vec<Row>> {
    let mut iter = build_iter(plan, ctx)?;
    super::iter::collect_rows(&mut *iter)
}
