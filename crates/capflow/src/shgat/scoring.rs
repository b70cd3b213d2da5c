// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The K-head scoring forward pass.
//!
//! Every candidate runs the same circuit: project its TraceFeatures into
//! the hidden space, score it against the projected intent with K heads
//! (shared Q/K projection keeps the cosine structure of the hidden space),
//! fuse the head scores through the MLP, and gate capabilities by observed
//! reliability. The full set of intermediates is kept so the trainer can
//! backpropagate through the identical code path.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::features::{TraceFeatures, TRACE_STAT_NAMES};
use super::params::ShgatParams;
use crate::capability::ToolId;
use crate::config::ConfidenceConfig;
use crate::constants::{CAPABILITY_SCORE_CEILING, EMBEDDING_DIM, TRACE_STATS_DIM};
use crate::tensor::{self, apply_dropout, sigmoid, Tensor};

/// A scored tool candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTool {
    pub tool_id: ToolId,
    /// Final score in [0, 1].
    pub score: f32,
    pub head_scores: Vec<f32>,
    /// True when the forward pass produced a non-finite value and the
    /// score was zeroed.
    #[serde(default)]
    pub unstable: bool,
}

/// One named contribution to a capability's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub name: String,
    pub value: f32,
    pub weight: f32,
    pub contribution: f32,
}

/// Legacy three-signal breakdown (semantic / structure / temporal), kept
/// as an interpretability projection of the v1 fusion weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegacyBreakdown {
    pub semantic: f32,
    pub structure: f32,
    pub temporal: f32,
}

/// A scored capability candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCapability {
    pub capability_id: Uuid,
    /// Final score in [0, 0.95] after the reliability multiplier.
    pub score: f32,
    pub head_scores: Vec<f32>,
    /// Per-statistic contributions, index-aligned with the stats block.
    pub feature_contributions: Vec<FeatureContribution>,
    /// V->E attention over the capability's member tools.
    pub tool_attention: Vec<(ToolId, f32)>,
    pub reliability_multiplier: f32,
    pub legacy_breakdown: LegacyBreakdown,
    #[serde(default)]
    pub unstable: bool,
}

/// Intermediates of one forward pass, retained for backprop.
#[derive(Debug, Clone)]
pub struct Forward {
    /// Embedding block input (3 * EMBEDDING_DIM).
    pub x_embed: Vec<f32>,
    /// Stats input.
    pub x_stats: [f32; TRACE_STATS_DIM],
    /// Candidate hidden pre-activation.
    pub h_pre: Vec<f32>,
    /// Candidate hidden activation.
    pub h: Vec<f32>,
    /// Intent hidden pre-activation.
    pub g_pre: Vec<f32>,
    /// Intent hidden activation.
    pub g: Vec<f32>,
    /// Per-head query vectors.
    pub q: Vec<Vec<f32>>,
    /// Per-head key vectors.
    pub k: Vec<Vec<f32>>,
    /// Per-head scaled logits.
    pub z: Vec<f32>,
    /// Per-head sigmoid scores.
    pub head_scores: Vec<f32>,
    /// Fusion hidden pre-activation.
    pub m_pre: Vec<f32>,
    /// Fusion hidden activation.
    pub m: Vec<f32>,
    /// Fused pre-sigmoid logit.
    pub y_pre: f32,
    /// Fused score.
    pub y: f32,
    /// Per-element dropout factors applied to `h` (0 or 1/(1-p)); `None`
    /// outside training.
    pub dropout_mask: Option<Vec<f32>>,
}

impl Forward {
    /// True when any intermediate went non-finite.
    #[must_use]
    pub fn is_unstable(&self) -> bool {
        !self.y.is_finite() || self.head_scores.iter().any(|s| !s.is_finite())
    }
}

fn affine(w: &Tensor, x: &[f32], b: Option<&[f32]>) -> Vec<f32> {
    let mut out = Vec::with_capacity(w.rows);
    for r in 0..w.rows {
        let mut v = tensor::dot(w.row(r), x);
        if let Some(bias) = b {
            v += bias[r];
        }
        out.push(v);
    }
    out
}

/// Run the scoring circuit over one candidate's features.
///
/// `dropout` carries the training-time RNG; inference passes `None` and
/// the pass is deterministic.
#[must_use]
pub fn forward(
    params: &ShgatParams,
    features: &TraceFeatures,
    dropout: Option<(&mut StdRng, f32)>,
) -> Forward {
    let hidden = params.config.hidden_dim;
    let heads = params.config.num_heads;
    let qk_dim = hidden / heads;

    // Candidate-side hidden: embedding block and stats block are two named
    // slices of one affine map.
    let mut h_pre = affine(&params.w_proj, &features.embedding_block, Some(&params.b_proj));
    let stats_part = affine(&params.w_stats, &features.stats, Some(&params.b_stats));
    for (h, s) in h_pre.iter_mut().zip(stats_part.iter()) {
        *h += s;
    }
    let mut h = h_pre.clone();
    tensor::relu_in_place(&mut h);

    let mut dropout_mask = None;
    if let Some((rng, p)) = dropout {
        let mut masked = Tensor::from_vec(1, hidden, vec![1.0; hidden]);
        apply_dropout(&mut masked, p, rng);
        for (v, factor) in h.iter_mut().zip(masked.data.iter()) {
            *v *= factor;
        }
        dropout_mask = Some(masked.data);
    }

    // Intent-side hidden.
    let intent = &features.embedding_block[..EMBEDDING_DIM];
    let g_pre = affine(&params.w_intent, intent, None);
    let mut g = g_pre.clone();
    tensor::relu_in_place(&mut g);

    // K head scores: scaled sigmoid of q.k / sqrt(d) with shared Wq = Wk.
    let scale = 1.0 / (qk_dim as f32).sqrt();
    let mut q = Vec::with_capacity(heads);
    let mut k = Vec::with_capacity(heads);
    let mut z = Vec::with_capacity(heads);
    let mut head_scores = Vec::with_capacity(heads);
    for head in 0..heads {
        let w = params.head_params.head(head);
        let mut q_h = vec![0.0f32; qk_dim];
        let mut k_h = vec![0.0f32; qk_dim];
        for r in 0..qk_dim {
            let row = &w[r * hidden..(r + 1) * hidden];
            q_h[r] = tensor::dot(row, &g);
            k_h[r] = tensor::dot(row, &h);
        }
        let z_h = tensor::dot(&q_h, &k_h) * scale;
        head_scores.push(sigmoid(z_h));
        z.push(z_h);
        q.push(q_h);
        k.push(k_h);
    }

    // Fusion MLP: Linear -> ReLU -> Linear -> Sigmoid.
    let m_pre = affine(&params.fusion_mlp.w1, &head_scores, Some(&params.fusion_mlp.b1));
    let mut m = m_pre.clone();
    tensor::relu_in_place(&mut m);
    let y_pre = tensor::dot(params.fusion_mlp.w2.row(0), &m) + params.fusion_mlp.b2;
    let y = sigmoid(y_pre);

    Forward {
        x_embed: features.embedding_block.clone(),
        x_stats: features.stats,
        h_pre,
        h,
        g_pre,
        g,
        q,
        k,
        z,
        head_scores,
        m_pre,
        m,
        y_pre,
        y,
        dropout_mask,
    }
}

/// Reliability multiplier for learned records: harshly discount anything
/// failing more than it succeeds, reward consistently reliable records.
#[must_use]
pub fn reliability_multiplier(success_rate: f64, config: &ConfidenceConfig) -> f32 {
    if success_rate < config.reliability_low {
        config.reliability_penalty
    } else if success_rate > config.reliability_high {
        config.reliability_bonus
    } else {
        1.0
    }
}

/// Apply the reliability gate and ceiling to a fused capability score.
#[must_use]
pub fn gate_capability_score(fused: f32, success_rate: f64, config: &ConfidenceConfig) -> (f32, f32) {
    let multiplier = reliability_multiplier(success_rate, config);
    ((fused * multiplier).clamp(0.0, CAPABILITY_SCORE_CEILING), multiplier)
}

/// Per-statistic contributions from the interpretability projection.
#[must_use]
pub fn feature_contributions(params: &ShgatParams, stats: &[f32]) -> Vec<FeatureContribution> {
    TRACE_STAT_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let value = stats.get(i).copied().unwrap_or(0.0);
            let weight = params.feature_weights.get(i).copied().unwrap_or(0.0);
            FeatureContribution {
                name: (*name).to_string(),
                value,
                weight,
                contribution: value * weight,
            }
        })
        .collect()
}

/// Legacy v1 breakdown from the stored fusion weights.
#[must_use]
pub fn legacy_breakdown(
    params: &ShgatParams,
    semantic_similarity: f32,
    stats: &[f32],
) -> LegacyBreakdown {
    let w = &params.fusion_weights;
    let (ws, wg, wt) = (
        w.first().copied().unwrap_or(0.0),
        w.get(1).copied().unwrap_or(0.0),
        w.get(2).copied().unwrap_or(0.0),
    );
    // Structure folds PageRank and the community boost; temporal is recency.
    let structure = (stats.get(3).copied().unwrap_or(0.0) + stats.get(4).copied().unwrap_or(0.0)) / 2.0;
    let temporal = stats.get(7).copied().unwrap_or(0.0);
    LegacyBreakdown {
        semantic: ws * semantic_similarity,
        structure: wg * structure,
        temporal: wt * temporal,
    }
}

/// Stable descending sort by score with ascending-id tie-break.
pub fn sort_scored_tools(results: &mut [ScoredTool]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tool_id.cmp(&b.tool_id))
    });
}

/// Stable descending sort by score with ascending-id tie-break.
pub fn sort_scored_capabilities(results: &mut [ScoredCapability]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.capability_id.cmp(&b.capability_id))
    });
}
