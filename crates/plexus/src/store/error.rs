//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the stores the gateway consumes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Target entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller may not perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request breaks a domain rule.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the message is safe to show to the client.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::Forbidden(_) | StoreError::Invalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound("chat 7".to_string());
        assert_eq!(err.to_string(), "not found: chat 7");
        assert!(err.is_client_error());
        assert!(!StoreError::Other(anyhow::anyhow!("boom")).is_client_error());
    }
}
