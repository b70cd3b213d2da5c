// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the CapFlow discovery engine.

use thiserror::Error;

/// CapFlow result type.
pub type Result<T> = std::result::Result<T, CapflowError>;

/// Errors that can occur in discovery, graph, and training operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CapflowError {
    /// The caller supplied an empty or whitespace-only intent.
    #[error("Missing intent: discovery requires a non-empty intent")]
    MissingIntent,

    /// Neither the attention scorer nor the hybrid fabric is available.
    #[error("No search engine available for this request")]
    NoSearchEngine,

    /// A `contains` edge would introduce a cycle in the capability hierarchy.
    #[error("Hierarchy cycle: adding contains edge {from} -> {to} would create a cycle")]
    HierarchyCycle { from: String, to: String },

    /// A `dependency` edge would introduce a cycle in execution ordering.
    #[error("Dependency cycle: adding dependency edge {from} -> {to} would create a cycle")]
    DependencyCycle { from: String, to: String },

    /// Embedding dimension does not match the configured model dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Imported parameter tensor shapes do not match the model configuration.
    #[error("Parameter shape mismatch for {tensor}: expected {expected}, got {actual}")]
    ParamShapeMismatch {
        tensor: String,
        expected: String,
        actual: String,
    },

    /// A capability FQDN failed validation.
    #[error("Invalid FQDN: {0}")]
    InvalidFqdn(String),

    /// An edge kind was rejected (unknown, or disabled by configuration).
    #[error("Invalid edge kind: {0}")]
    InvalidEdgeKind(String),

    /// The training worker exited non-zero or produced an unparseable frame.
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    /// The training lock is held by another batch or live session.
    #[error("Training busy: {0} training already in progress")]
    TrainingBusy(String),

    /// The vector index is unavailable; caller degrades to keyword search.
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Transient storage failure; retried with bounded backoff at the call site.
    #[error("Transient storage error: {0}")]
    StorageTransient(String),

    /// Permanent storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Referenced node does not exist in the graph store.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Worker pipe IO error.
    #[error("Worker IO error: {0}")]
    WorkerIo(String),

    /// Worker call exceeded its deadline.
    #[error("Training worker timed out after {0} ms")]
    WorkerTimeout(u64),

    /// Request was cancelled at a suspension point.
    #[error("Request cancelled")]
    Cancelled,

    /// Embedding model failure.
    #[error("Embedding error: {0}")]
    Embedding(String),
}

impl From<serde_json::Error> for CapflowError {
    fn from(err: serde_json::Error) -> Self {
        CapflowError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CapflowError {
    fn from(err: std::io::Error) -> Self {
        CapflowError::WorkerIo(err.to_string())
    }
}

impl CapflowError {
    /// Whether the orchestrator may recover from this error by falling back
    /// to a cheaper search stage.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CapflowError::MissingIntent
                | CapflowError::NoSearchEngine
                | CapflowError::HierarchyCycle { .. }
                | CapflowError::DependencyCycle { .. }
                | CapflowError::DimensionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CapflowError::HierarchyCycle {
            from: "c".to_string(),
            to: "a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Hierarchy cycle: adding contains edge c -> a would create a cycle"
        );

        let err = CapflowError::ParamShapeMismatch {
            tensor: "W_proj".to_string(),
            expected: "[64, 3089]".to_string(),
            actual: "[64, 3072]".to_string(),
        };
        assert!(err.to_string().contains("W_proj"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(!CapflowError::MissingIntent.is_recoverable());
        assert!(!CapflowError::NoSearchEngine.is_recoverable());
        assert!(CapflowError::IndexUnavailable("down".into()).is_recoverable());
        assert!(CapflowError::StorageTransient("conn reset".into()).is_recoverable());
        assert!(CapflowError::TrainingFailed("exit 1".into()).is_recoverable());
    }
}
