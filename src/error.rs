//! Error types for queries, mutations and keys.
//!
//! Fetch and mutation failures never escape the engine as panics or early
//! returns: they are recorded on the query entry or mutation state and observed
//! through status fields. All errors are `Clone` so a single in-flight result can
//! be handed to every waiter that shares it.

use thiserror::Error;

/// Error type for query (read) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The entry was removed while its fetch was still running.
    #[error("Fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),
}

impl QueryError {
    /// Shorthand for [`QueryError::FetchError`].
    pub fn fetch(message: impl ToString) -> Self {
        Self::FetchError(message.to_string())
    }
}

/// Error type for mutation (write) operations.
///
/// Mutations are terminal: a failure is reported once and never retried unless
/// the mutation opted into a retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutation failed: {0}")]
    Failed(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl MutationError {
    /// Shorthand for [`MutationError::Failed`].
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }
}

/// A malformed or conflicting query key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidKeyError {
    #[error("Query key must contain at least one segment")]
    Empty,

    #[error("Query key segment {index} contains a non-finite number")]
    NonFiniteNumber { index: usize },

    #[error("Query key {key} is cached with a different value type")]
    TypeMismatch { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::NetworkError("network error".to_string());
        assert_eq!(err.to_string(), "Network error: network error");

        let err = QueryError::from(InvalidKeyError::Empty);
        assert_eq!(err.to_string(), "Query key must contain at least one segment");
    }

    #[test]
    fn test_mutation_error_display() {
        assert_eq!(
            MutationError::failed("boom").to_string(),
            "Mutation failed: boom"
        );
    }
}
