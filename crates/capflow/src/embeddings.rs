// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Embedding model interface.
//!
//! The engine consumes a single narrow trait: `encode(text)` producing a
//! 1024-d L2-normalized vector. Local ONNX models and remote APIs both fit
//! behind it; the engine never sees the transport.

use async_trait::async_trait;

use crate::constants::{EMBEDDING_DIM, NORM_TOLERANCE};
use crate::error::{CapflowError, Result};
use crate::tensor;

/// Trait for text embedding models.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch).
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.encode(text).await?);
        }
        Ok(results)
    }

    /// Get the embedding dimension.
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Get the model name/identifier.
    fn model_name(&self) -> &str;
}

/// Validate dimension and L2-normalize an embedding before it enters any
/// store or index.
///
/// # Errors
/// Returns `DimensionMismatch` when the vector is not `expected_dim` long.
pub fn normalize_embedding(mut v: Vec<f32>, expected_dim: usize) -> Result<Vec<f32>> {
    if v.len() != expected_dim {
        return Err(CapflowError::DimensionMismatch {
            expected: expected_dim,
            actual: v.len(),
        });
    }
    tensor::l2_normalize(&mut v);
    Ok(v)
}

/// Whether a vector is unit-norm within tolerance. Zero vectors fail.
#[must_use]
pub fn is_normalized(v: &[f32]) -> bool {
    (tensor::norm(v) - 1.0).abs() <= NORM_TOLERANCE
}
