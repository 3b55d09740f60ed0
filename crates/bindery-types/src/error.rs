//! Error kinds shared across the workspace.

use thiserror::Error;

/// Errors from repository operations (used by the trait definitions in
/// bindery-core; implemented by the SQLite layer in bindery-infra).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// A mutation helper was invoked before the prior state it requires exists,
/// e.g. recording a parallel-item result before the fan-out was initialized.
///
/// A programming bug in the caller; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("precondition violated: {0}")]
pub struct PreconditionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn precondition_error_display() {
        let err = PreconditionError("parallel results not initialized".to_string());
        assert!(err.to_string().contains("parallel results"));
    }
}
