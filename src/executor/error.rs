//! Execution errors.

use thiserror::Error;

use crate::index::IndexError;
use crate::storage::StorageError;

/// Result type for execution operations.
pub type ExecuteResult<T> = Result<T, ExecuteError>;

/// Errors raised while pulling rows through a plan.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The query context was cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// Expression evaluation hit incompatible types.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    /// Underlying git error. Sessions with skip_git_errors turn these into
    /// skipped rows or repositories instead.
    #[error("object store error: {0}")]
    Storage(#[from] StorageError),

    /// Index create/save/load failed; planning falls back to scans.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// An external analysis service could not be reached or failed.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// A node expected a gitql session but received something else.
    #[error("invalid session")]
    InvalidSession,

    /// Invariant violation that should never be observed in production.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecuteError {
    /// Whether the session's skip_git_errors flag may swallow this error.
    pub fn is_skippable_git_error(&self) -> bool {
        matches!(self, ExecuteError::Storage(e) if e.is_git())
    }

    /// A same-kind copy. Inner errors that are not cloneable are carried as
    /// their display form; the variant is preserved, which is what callers
    /// match on.
    pub fn clone_kind(&self) -> ExecuteError {
        match self {
            ExecuteError::Cancelled => ExecuteError::Cancelled,
            ExecuteError::TypeMismatch(s) => ExecuteError::TypeMismatch(s.clone()),
            ExecuteError::DivisionByZero => ExecuteError::DivisionByZero,
            ExecuteError::Storage(e) => {
                ExecuteError::Storage(StorageError::Io(std::io::Error::other(e.to_string())))
            }
            ExecuteError::Index(e) => ExecuteError::Index(IndexError::Build(e.to_string())),
            ExecuteError::ExternalService(s) => ExecuteError::ExternalService(s.clone()),
            ExecuteError::InvalidSession => ExecuteError::InvalidSession,
            ExecuteError::Internal(s) => ExecuteError::Internal(s.clone()),
        }
    }
}
