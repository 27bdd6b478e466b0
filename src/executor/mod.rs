//! Query execution engine.
//!
//! Uses the volcano/iterator model: each plan node becomes a pull-driven
//! row iterator, with parallelism supplied by the exchange node and fused
//! git walks by the squash iterator.

mod error;
pub mod exchange;
mod iter;
pub mod operators;
mod result;
pub mod squash;

pub use error::{ExecuteError, ExecuteResult};
pub use iter::{collect_rows, EmptyIter, FusedIter, RowIter, RowsIter};
pub use operators::{build_iter, run_to_rows};
pub use result::ResultSet;
