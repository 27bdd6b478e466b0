//! Storage layer error types.
//!
//! All errors that can occur while reading git object stores are defined
//! here. We use `thiserror` for ergonomic error definition.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error from the underlying git library.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// The requested repository is not in the pool.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The path does not contain a git repository.
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// An object hash did not resolve in the repository.
    #[error("object not found: {hash} in {repository}")]
    ObjectNotFound { repository: String, hash: String },

    /// A hash string is not valid hex.
    #[error("invalid object hash: {0}")]
    InvalidHash(String),

    /// Unsupported repository library layout.
    #[error("unsupported library format: {0}")]
    UnsupportedFormat(String),

    /// I/O error (filesystem level).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether this error originates in git object decoding. These are the
    /// errors a session with skip_git_errors set may skip over.
    pub fn is_git(&self) -> bool {
        matches!(
            self,
            StorageError::Git(_)
                | StorageError::ObjectNotFound { .. }
                | StorageError::NotARepository(_)
        )
    }

    /// Whether this error means the object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectNotFound { .. } | StorageError::RepositoryNotFound(_) => true,
            StorageError::Git(e) => e.code() == git2::ErrorCode::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let nf = StorageError::ObjectNotFound {
            repository: "r".into(),
            hash: "abc".into(),
        };
        assert!(nf.is_not_found());
        assert!(nf.is_git());

        let missing = StorageError::RepositoryNotFound("r".into());
        assert!(missing.is_not_found());
        assert!(!missing.is_git());
    }
}
