// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shared numeric constants for the discovery engine.

use std::time::Duration;

/// Embedding dimension produced by the embedding model (BGE-class, 1024-d).
pub const EMBEDDING_DIM: usize = 1024;

/// Tolerance for L2-normalization checks.
pub const NORM_TOLERANCE: f32 = 1e-5;

/// Number of scalar trace statistics appended to the per-target feature vector.
pub const TRACE_STATS_DIM: usize = 17;

/// PageRank damping factor for the hypergraph power iteration.
pub const PAGERANK_DAMPING: f64 = 0.85;

/// PageRank convergence tolerance.
pub const PAGERANK_TOLERANCE: f64 = 1e-6;

/// PageRank iteration cap.
pub const PAGERANK_MAX_ITERATIONS: usize = 100;

/// k-means iteration cap.
pub const KMEANS_MAX_ITERATIONS: usize = 100;

/// Jacobi eigendecomposition sweep cap.
pub const JACOBI_MAX_SWEEPS: usize = 100;

/// Jacobi off-diagonal convergence tolerance.
pub const JACOBI_TOLERANCE: f64 = 1e-10;

/// Spectral cluster cache time-to-live.
pub const CLUSTER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Observation count at which an `inferred` edge is promoted to `observed`.
pub const EDGE_PROMOTION_THRESHOLD: u64 = 3;

/// Cold-start priority assigned to freshly appended execution traces.
pub const INITIAL_TRACE_PRIORITY: f64 = 0.5;

/// PER priority exponent (alpha).
pub const PER_PRIORITY_EXPONENT: f64 = 0.6;

/// PER importance-sampling exponent (beta).
pub const PER_IMPORTANCE_EXPONENT: f64 = 0.4;

/// PER priority floor added to |TD error|.
pub const PER_PRIORITY_EPSILON: f64 = 1e-3;

/// Cosine threshold used to cluster tools when excluding hard-negative
/// candidates that are near-duplicates of the anchor's own tools.
pub const NEGATIVE_EXCLUSION_COSINE: f32 = 0.7;

/// Minimum spread of the semi-hard similarity band before random top-up.
pub const SEMI_HARD_MIN_SPREAD: f32 = 0.1;

/// Upper clip applied to capability scores after the reliability multiplier.
pub const CAPABILITY_SCORE_CEILING: f32 = 0.95;

/// Fixed score assigned by the keyword degradation path.
pub const KEYWORD_FALLBACK_SCORE: f32 = 0.5;

/// Success rate reported for records with no usage history (cold start).
pub const COLD_START_SUCCESS_RATE: f64 = 0.5;

/// Literal prefix marking a nested capability reference in a code snippet.
pub const CAPABILITY_REF_PREFIX: &str = "$cap:";
