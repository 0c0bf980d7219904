//! Persistence error taxonomy shared by every storage adapter.

use thiserror::Error;

/// Errors raised at the persistence boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The store could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A transaction could not be committed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A write violated a uniqueness or check constraint.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The store aborted the statement to break a deadlock.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// The statement did not complete in time.
    #[error("Persistence timeout: {0}")]
    Timeout(String),
}

impl PersistenceError {
    /// Check if this error is retryable at the persistence boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::Deadlock(_)
                | PersistenceError::Timeout(_)
                | PersistenceError::ConnectionFailed(_)
        )
    }

    /// Get a stable error code for logs and event metadata.
    pub fn error_code(&self) -> &'static str {
        match self {
            PersistenceError::ConnectionFailed(_) => "connection_failed",
            PersistenceError::TransactionFailed(_) => "transaction_failed",
            PersistenceError::ConstraintViolation(_) => "constraint_violation",
            PersistenceError::Deadlock(_) => "deadlock",
            PersistenceError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for persistence operations.
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PersistenceError::Deadlock("d".into()).is_retryable());
        assert!(PersistenceError::Timeout("t".into()).is_retryable());
        assert!(PersistenceError::ConnectionFailed("c".into()).is_retryable());
        assert!(!PersistenceError::ConstraintViolation("c".into()).is_retryable());
        assert!(!PersistenceError::TransactionFailed("t".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PersistenceError::ConstraintViolation("dup".into()).error_code(),
            "constraint_violation"
        );
        assert_eq!(PersistenceError::Deadlock("x".into()).error_code(), "deadlock");
    }
}
