// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Configuration for the CapFlow discovery engine.
//!
//! A single immutable [`CapflowConfig`] is constructed at startup and shared
//! by reference; nothing on the hot path reads the environment. Defaults
//! follow the tuned values the engine ships with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    CLUSTER_CACHE_TTL, EMBEDDING_DIM, PER_IMPORTANCE_EXPONENT, PER_PRIORITY_EXPONENT,
};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapflowConfig {
    /// Attention model configuration.
    pub shgat: ShgatConfig,
    /// Training schedule and replay configuration.
    pub training: TrainingConfig,
    /// Spectral clustering configuration.
    pub cluster: ClusterConfig,
    /// Local-alpha calculator configuration.
    pub alpha: AlphaConfig,
    /// Confidence and rationale policy.
    pub confidence: ConfidenceConfig,
    /// Orchestrator behavior.
    pub discovery: DiscoveryConfig,
    /// Graph store behavior.
    pub graph: GraphConfig,
}

/// SHGAT attention model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShgatConfig {
    /// Number of attention heads K.
    pub num_heads: usize,
    /// Hidden dimension of the projected feature space.
    pub hidden_dim: usize,
    /// Per-head dimension. Ignored when `preserve_dim` is set.
    pub head_dim: usize,
    /// When true, concatenated heads span the embedding dimension exactly;
    /// `num_heads` must then divide the embedding dimension evenly.
    pub preserve_dim: bool,
    /// Number of V<->E message-passing layers.
    pub num_layers: usize,
    /// Fusion MLP hidden width.
    pub mlp_hidden_dim: usize,
    /// Dropout probability applied during training forward passes.
    pub dropout: f32,
    /// Decoupled L2 regularization strength.
    pub l2_lambda: f32,
    /// Negative slope for LeakyReLU attention scores.
    pub leaky_relu_slope: f32,
    /// Per-level attenuation applied to multi-level messages.
    pub depth_decay: f32,
    /// Number of recent context tools retained when building features.
    pub max_context_length: usize,
    /// Residual weight beta for the V->V co-occurrence enrichment.
    pub residual_weight: f32,
    /// Softmax temperature tau for the V->V enrichment.
    pub temperature: f32,
    /// Whether the V->V enrichment pre-phase runs at all.
    pub use_attention: bool,
    /// Score candidates with propagated (post-message-passing) embeddings
    /// instead of raw intent embeddings.
    pub use_propagated_embeddings: bool,
    /// PRNG seed for initialization, dropout, and sampling.
    pub seed: u64,
}

impl Default for ShgatConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            hidden_dim: 128,
            head_dim: 16,
            preserve_dim: false,
            num_layers: 2,
            mlp_hidden_dim: 64,
            dropout: 0.1,
            l2_lambda: 1e-4,
            leaky_relu_slope: 0.2,
            depth_decay: 0.7,
            max_context_length: 8,
            residual_weight: 0.3,
            temperature: 1.0,
            use_attention: true,
            use_propagated_embeddings: false,
            seed: 42,
        }
    }
}

impl ShgatConfig {
    /// Effective hidden width of one attention layer: either the embedding
    /// dimension (preserved) or `num_heads * head_dim`.
    #[must_use]
    pub fn layer_width(&self) -> usize {
        if self.preserve_dim {
            EMBEDDING_DIM
        } else {
            self.num_heads * self.head_dim
        }
    }

    /// Per-head slice width for a layer.
    #[must_use]
    pub fn head_width(&self) -> usize {
        if self.preserve_dim {
            EMBEDDING_DIM / self.num_heads
        } else {
            self.head_dim
        }
    }
}

/// Pick an attention head count appropriate for the graph size.
///
/// When `preserve_dim` is requested the returned count must divide the
/// embedding dimension evenly; the largest divisor not exceeding the
/// size-appropriate choice is used.
#[must_use]
pub fn adaptive_heads_by_graph_size(node_count: usize, preserve_dim: bool) -> usize {
    let by_size = match node_count {
        n if n < 50 => 4,
        n if n < 200 => 6,
        n if n < 1000 => 8,
        n if n < 5000 => 12,
        _ => 16,
    };
    if !preserve_dim {
        return by_size;
    }
    (1..=by_size)
        .rev()
        .find(|k| EMBEDDING_DIM % k == 0)
        .unwrap_or(1)
}

/// Training schedule and prioritized-replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Epochs for batch (cold-start) training.
    pub epochs: usize,
    /// Epochs for live (per-PER-batch) training.
    pub live_epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Learning rate for the AdamW update.
    pub learning_rate: f32,
    /// Trace count below which the model stays cold.
    pub min_traces_for_training: usize,
    /// PER buffer cap; oldest traces are evicted beyond this.
    pub max_buffer_size: usize,
    /// PER priority exponent (alpha).
    pub per_alpha: f64,
    /// PER importance-sampling exponent (beta).
    pub per_beta: f64,
    /// Percentile band `[low, high]` for semi-hard negative mining.
    pub semi_hard_range: (f32, f32),
    /// Negatives mined per anchor.
    pub num_negatives: usize,
    /// Deadline for a training-worker call, in milliseconds.
    pub worker_timeout_ms: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            live_epochs: 1,
            batch_size: 32,
            learning_rate: 1e-3,
            min_traces_for_training: 50,
            max_buffer_size: 10_000,
            per_alpha: PER_PRIORITY_EXPONENT,
            per_beta: PER_IMPORTANCE_EXPONENT,
            semi_hard_range: (0.25, 0.75),
            num_negatives: 8,
            worker_timeout_ms: 120_000,
        }
    }
}

/// Spectral clustering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Fixed cluster count; `None` selects k by the eigengap heuristic.
    pub num_clusters: Option<usize>,
    /// Cache entry time-to-live.
    #[serde(with = "duration_millis")]
    pub cache_ttl: Duration,
    /// PRNG seed for k-means++ seeding.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_clusters: None,
            cache_ttl: CLUSTER_CACHE_TTL,
            seed: 7,
        }
    }
}

/// Local-alpha calculator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlphaConfig {
    /// Alpha used when no signal is available.
    pub default_alpha: f64,
    /// Beta-prior pseudo-counts for the Bayesian success-rate signal.
    pub prior_success: f64,
    /// Beta-prior pseudo-counts for failures.
    pub prior_failure: f64,
    /// Heat-diffusion step count for the structural fallback.
    pub heat_steps: usize,
    /// Heat-diffusion step size.
    pub heat_rate: f64,
}

impl Default for AlphaConfig {
    fn default() -> Self {
        Self {
            default_alpha: 1.0,
            prior_success: 1.0,
            prior_failure: 1.0,
            heat_steps: 10,
            heat_rate: 0.1,
        }
    }
}

/// Confidence scoring and rationale policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Path confidence by hop count: index 0 = 1 hop. Paths longer than the
    /// table fall through to the final entry.
    pub hop_confidence: Vec<f64>,
    /// Base weight of the hybrid signal before alpha adjustment.
    pub hybrid_weight: f64,
    /// Base weight of the PageRank signal before alpha adjustment.
    pub pagerank_weight: f64,
    /// Base weight of the path signal before alpha adjustment.
    pub path_weight: f64,
    /// Linear adjustment applied per unit of (alpha - 0.5).
    pub alpha_delta: f64,
    /// Additive cap for the community boost contribution.
    pub community_cap: f64,
    /// Additive cap for the co-occurrence contribution.
    pub co_occurrence_cap: f64,
    /// Success rate below which the reliability multiplier penalizes.
    pub reliability_low: f64,
    /// Success rate above which the reliability multiplier rewards.
    pub reliability_high: f64,
    /// Multiplier applied below `reliability_low`.
    pub reliability_penalty: f32,
    /// Multiplier applied above `reliability_high`.
    pub reliability_bonus: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            hop_confidence: vec![0.9, 0.7, 0.5, 0.3],
            hybrid_weight: 0.5,
            pagerank_weight: 0.25,
            path_weight: 0.25,
            alpha_delta: 0.3,
            community_cap: 0.5,
            co_occurrence_cap: 0.3,
            reliability_low: 0.5,
            reliability_high: 0.9,
            reliability_penalty: 0.5,
            reliability_bonus: 1.2,
        }
    }
}

/// Discovery orchestrator behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Default result limit when the caller does not pass one.
    pub default_limit: usize,
    /// Default minimum score threshold.
    pub min_score: f32,
    /// Apply the reliability factor on the hybrid tool path, aligning it
    /// with the capability path.
    pub hybrid_reliability: bool,
    /// Density thresholds at which the vector-search expansion factor grows.
    pub density_thresholds: (f64, f64),
    /// Expansion factors below, between, and above the density thresholds.
    pub expansion_factors: (f64, f64, f64),
    /// Related-tool neighbors attached per direction on the hybrid path.
    pub related_neighbors: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            min_score: 0.0,
            hybrid_reliability: true,
            density_thresholds: (0.01, 0.1),
            expansion_factors: (1.5, 2.0, 3.0),
            related_neighbors: 2,
        }
    }
}

/// Graph store behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Accept the deprecated `alternative` edge kind. When false the kind is
    /// rejected at insert and ignored by spectral weighting and rationale.
    pub enable_alternative_edges: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enable_alternative_edges: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_spec_values() {
        let config = CapflowConfig::default();
        assert_eq!(config.shgat.num_heads, 8);
        assert_eq!(config.shgat.num_layers, 2);
        assert!((config.shgat.dropout - 0.1).abs() < 1e-9);
        assert!((config.shgat.l2_lambda - 1e-4).abs() < 1e-12);
        assert_eq!(config.training.epochs, 20);
        assert_eq!(config.training.live_epochs, 1);
        assert_eq!(config.training.num_negatives, 8);
        assert_eq!(config.cluster.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.confidence.hop_confidence, vec![0.9, 0.7, 0.5, 0.3]);
    }

    #[test]
    fn test_adaptive_heads_by_graph_size() {
        assert_eq!(adaptive_heads_by_graph_size(10, false), 4);
        assert_eq!(adaptive_heads_by_graph_size(100, false), 6);
        assert_eq!(adaptive_heads_by_graph_size(500, false), 8);
        assert_eq!(adaptive_heads_by_graph_size(2000, false), 12);
        assert_eq!(adaptive_heads_by_graph_size(10_000, false), 16);
    }

    #[test]
    fn test_adaptive_heads_preserve_dim_divides_embedding() {
        // 6 does not divide 1024; the largest divisor <= 6 is 4.
        assert_eq!(adaptive_heads_by_graph_size(100, true), 4);
        // 8 and 16 divide 1024 and are kept as-is.
        assert_eq!(adaptive_heads_by_graph_size(500, true), 8);
        assert_eq!(adaptive_heads_by_graph_size(10_000, true), 16);
        // 12 does not divide 1024; falls back to 8.
        assert_eq!(adaptive_heads_by_graph_size(2000, true), 8);
    }

    #[test]
    fn test_layer_width() {
        let mut config = ShgatConfig::default();
        assert_eq!(config.layer_width(), 8 * 16);
        config.preserve_dim = true;
        assert_eq!(config.layer_width(), 1024);
        assert_eq!(config.head_width(), 128);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = CapflowConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CapflowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shgat.num_heads, config.shgat.num_heads);
        assert_eq!(back.cluster.cache_ttl, config.cluster.cache_ttl);
    }
}
