// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the `PostgreSQL` storage backend.

use thiserror::Error;

/// Postgres backend result type.
pub type Result<T> = std::result::Result<T, PostgresError>;

/// Errors from the `PostgreSQL` backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PostgresError {
    /// Connection establishment failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A query failed.
    #[error("Query error: {0}")]
    QueryError(String),

    /// Schema initialization failed.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Invalid SQL identifier (table name).
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A stored value could not be decoded.
    #[error("Decode error: {0}")]
    DecodeError(String),
}

impl From<tokio_postgres::Error> for PostgresError {
    fn from(err: tokio_postgres::Error) -> Self {
        PostgresError::QueryError(err.to_string())
    }
}

impl From<PostgresError> for capflow::CapflowError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::ConnectionError(e) => capflow::CapflowError::StorageTransient(e),
            other => capflow::CapflowError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PostgresError::InvalidIdentifier("1bad".to_string());
        assert_eq!(err.to_string(), "Invalid identifier: 1bad");
    }

    #[test]
    fn test_connection_errors_map_to_transient() {
        let err: capflow::CapflowError = PostgresError::ConnectionError("refused".into()).into();
        assert!(matches!(err, capflow::CapflowError::StorageTransient(_)));
    }
}
