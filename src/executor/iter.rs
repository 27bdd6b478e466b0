//! The row iterator contract.
//!
//! Row iterators are lazy, single-pass and pull-driven. `next_row` yields
//! the next row, `Ok(None)` once exhausted, or an error. `close` releases
//! resources and is idempotent; dropping an unclosed iterator is also legal.

use crate::sql::Row;

use super::error::{ExecuteError, ExecuteResult};

pub trait RowIter: Send {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>>;

    fn close(&mut self) -> ExecuteResult<()> {
        Ok(())
    }
}

/// Drain an iterator into a vector, closing it afterwards.
pub fn collect_rows(iter: &mut dyn RowIter) -> ExecuteResult<Vec<Row>> {
    let mut rows = Vec::new();
    let result = loop {
        match iter.next_row() {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break Ok(rows),
            Err(e) => break Err(e),
        }
    };
    iter.close()?;
    result
}

/// Iterator over an in-memory row vector.
pub struct RowsIter {
    rows: std::vec::IntoIter<Row>,
}

impl RowsIter {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowIter for RowsIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        Ok(self.rows.next())
    }
}

/// An iterator producing no rows.
pub struct EmptyIter;

impl RowIter for EmptyIter {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        Ok(None)
    }
}

enum FuseState {
    Live,
    Done,
    Failed(ExecuteError),
}

/// Wrapper enforcing the single-pass law: after EOF every call keeps
/// returning EOF, and after an error every call returns the same error kind.
pub struct FusedIter<I> {
    inner: I,
    state: FuseState,
    closed: bool,
}

impl<I: RowIter> FusedIter<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            state: FuseState::Live,
            closed: false,
        }
    }
}

impl<I: RowIter> RowIter for FusedIter<I> {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        match &self.state {
            FuseState::Done => Ok(None),
            FuseState::Failed(e) => Err(e.clone_kind()),
            FuseState::Live => match self.inner.next_row() {
                Ok(Some(row)) => Ok(Some(row)),
                Ok(None) => {
                    self.state = FuseState::Done;
                    Ok(None)
                }
                Err(e) => {
                    self.state = FuseState::Failed(e.clone_kind());
                    Err(e)
                }
            },
        }
    }

    fn close(&mut self) -> ExecuteResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close()
    }
}

impl RowIter for Box<dyn RowIter> {
    fn next_row(&mut self) -> ExecuteResult<Option<Row>> {
        (**self).next_row()
    }

    fn close(&mut self) -> ExecuteResult<()> {
        (**self).close()
    }
}
