//! Planning and analysis errors.

use thiserror::Error;

/// Result type for planning operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised while analyzing a logical plan.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("ambiguous column reference: {0}")]
    AmbiguousColumn(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {name} expects between {min} and {max} arguments, got {got}")]
    WrongArity {
        name: String,
        min: usize,
        max: usize,
        got: usize,
    },

    #[error("expression is neither an aggregation nor a grouping key: {0}")]
    InvalidAggregation(String),

    #[error("analyzer did not reach a fixpoint after {0} passes")]
    MaxPasses(usize),

    #[error("unsupported plan shape: {0}")]
    Unsupported(String),
}
