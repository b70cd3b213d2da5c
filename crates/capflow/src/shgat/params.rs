// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SHGAT parameter store: initialization, serialization, shape checks.
//!
//! All tensors live in flat row-major buffers; the JSON export nests them as
//! arrays-of-arrays (row-major) so the blob is storage- and
//! language-agnostic. Import validates every shape against the embedded
//! config and rejects the whole blob on the first mismatch, leaving the
//! serving parameters untouched.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ShgatConfig;
use crate::constants::{EMBEDDING_DIM, TRACE_STATS_DIM};
use crate::error::{CapflowError, Result};
use crate::tensor::{HeadTensor, Tensor};

/// Parameters of one attention phase (a V->E or E->V direction of one
/// layer): per-head source/target projections plus the concatenated
/// attention vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseParams {
    /// Per-head source projection, `[head][head_width][src_dim]`.
    pub w_src: HeadTensor,
    /// Per-head target projection, `[head][head_width][dst_dim]`.
    pub w_dst: HeadTensor,
    /// Per-head attention vector over `[Wx || Wy]`, `[head][2 * head_width]`.
    pub attention: Tensor,
}

/// Parameters of one V<->E message-passing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    /// Tools-to-capabilities phase.
    pub v2e: PhaseParams,
    /// Capabilities-to-tools phase.
    pub e2v: PhaseParams,
}

/// Parameters of one multi-level boundary (level k to k+1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelParams {
    pub w_child: HeadTensor,
    pub w_parent: HeadTensor,
    pub a_upward: Tensor,
    pub a_downward: Tensor,
}

/// The fusion MLP: Linear -> ReLU -> Linear -> Sigmoid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionMlp {
    /// `[mlp_hidden x num_heads]`.
    pub w1: Tensor,
    pub b1: Vec<f32>,
    /// `[1 x mlp_hidden]`.
    pub w2: Tensor,
    pub b2: f32,
}

/// Complete parameter set for the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShgatParams {
    /// Configuration the shapes were derived from.
    pub config: ShgatConfig,
    /// V<->E message-passing layers.
    pub layer_params: Vec<LayerParams>,
    /// Multi-level boundaries, index k = levels k -> k+1.
    pub level_params: Vec<LevelParams>,
    /// Shared Q/K projection per scoring head,
    /// `[head][qk_dim][hidden_dim]`; sharing preserves cosine structure.
    pub head_params: HeadTensor,
    /// Legacy v1 fusion weights (semantic/structure/temporal), kept as an
    /// interpretability projection only.
    pub fusion_weights: Vec<f32>,
    /// Per-statistic interpretability weights for feature contributions.
    pub feature_weights: Vec<f32>,
    /// Intent projection into the hidden space, `[hidden x EMBEDDING_DIM]`.
    pub w_intent: Tensor,
    /// Embedding-block projection, `[hidden x 3 * EMBEDDING_DIM]`.
    pub w_proj: Tensor,
    pub b_proj: Vec<f32>,
    /// Fusion MLP over head scores.
    pub fusion_mlp: FusionMlp,
    /// Trace-statistics projection, `[hidden x TRACE_STATS_DIM]`.
    pub w_stats: Tensor,
    pub b_stats: Vec<f32>,
}

fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Tensor {
    let limit = (6.0f32 / (rows + cols) as f32).sqrt();
    let data = (0..rows * cols)
        .map(|_| rng.gen_range(-limit..limit))
        .collect();
    Tensor::from_vec(rows, cols, data)
}

fn xavier_heads(heads: usize, rows: usize, cols: usize, rng: &mut StdRng) -> HeadTensor {
    let limit = (6.0f32 / (rows + cols) as f32).sqrt();
    let mut t = HeadTensor::zeros(heads, rows, cols);
    for v in &mut t.data {
        *v = rng.gen_range(-limit..limit);
    }
    t
}

/// Identity-like per-head projection with small noise, used when the layer
/// preserves the embedding dimension: head `h` reads its own
/// `head_width`-wide slice of the input, so concatenating untouched heads
/// reproduces the input.
fn identity_heads(heads: usize, head_width: usize, in_dim: usize, rng: &mut StdRng) -> HeadTensor {
    let mut t = HeadTensor::zeros(heads, head_width, in_dim);
    for h in 0..heads {
        let slice = t.head_mut(h);
        for r in 0..head_width {
            for c in 0..in_dim {
                let noise: f32 = rng.gen_range(-0.01..0.01);
                let identity = if c == h * head_width + r { 1.0 } else { 0.0 };
                slice[r * in_dim + c] = identity + noise;
            }
        }
    }
    t
}

fn phase(
    heads: usize,
    head_width: usize,
    src_dim: usize,
    dst_dim: usize,
    rng: &mut StdRng,
) -> PhaseParams {
    let preserves = src_dim == heads * head_width;
    let w_src = if preserves {
        identity_heads(heads, head_width, src_dim, rng)
    } else {
        xavier_heads(heads, head_width, src_dim, rng)
    };
    let w_dst = if dst_dim == heads * head_width {
        identity_heads(heads, head_width, dst_dim, rng)
    } else {
        xavier_heads(heads, head_width, dst_dim, rng)
    };
    PhaseParams {
        w_src,
        w_dst,
        attention: xavier(heads, 2 * head_width, rng),
    }
}

impl ShgatParams {
    /// Initialize parameters for a config and the current hierarchy depth.
    ///
    /// Message-passing layers preserve the embedding dimension (per-head
    /// slices of width `EMBEDDING_DIM / num_heads`), so residual
    /// connections stay well-typed; the scoring head projects into
    /// `hidden_dim`. Deterministic given `config.seed`.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` when `num_heads` divides neither the
    /// embedding dimension nor `hidden_dim`.
    pub fn init(config: &ShgatConfig, max_level: usize) -> Result<Self> {
        if EMBEDDING_DIM % config.num_heads != 0 {
            return Err(CapflowError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: config.num_heads,
            });
        }
        if config.hidden_dim % config.num_heads != 0 {
            return Err(CapflowError::DimensionMismatch {
                expected: config.hidden_dim,
                actual: config.num_heads,
            });
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let heads = config.num_heads;
        let pass_width = EMBEDDING_DIM / heads;

        let layer_params = (0..config.num_layers)
            .map(|_| LayerParams {
                v2e: phase(heads, pass_width, EMBEDDING_DIM, EMBEDDING_DIM, &mut rng),
                e2v: phase(heads, pass_width, EMBEDDING_DIM, EMBEDDING_DIM, &mut rng),
            })
            .collect();

        let level_params = (0..max_level)
            .map(|_| LevelParams {
                w_child: identity_heads(heads, pass_width, EMBEDDING_DIM, &mut rng),
                w_parent: identity_heads(heads, pass_width, EMBEDDING_DIM, &mut rng),
                a_upward: xavier(heads, 2 * pass_width, &mut rng),
                a_downward: xavier(heads, 2 * pass_width, &mut rng),
            })
            .collect();

        let qk_dim = config.hidden_dim / heads;
        Ok(Self {
            config: config.clone(),
            layer_params,
            level_params,
            head_params: xavier_heads(heads, qk_dim, config.hidden_dim, &mut rng),
            fusion_weights: vec![0.5, 0.3, 0.2],
            feature_weights: vec![1.0 / TRACE_STATS_DIM as f32; TRACE_STATS_DIM],
            w_intent: xavier(config.hidden_dim, EMBEDDING_DIM, &mut rng),
            w_proj: xavier(config.hidden_dim, 3 * EMBEDDING_DIM, &mut rng),
            b_proj: vec![0.0; config.hidden_dim],
            fusion_mlp: FusionMlp {
                w1: xavier(config.mlp_hidden_dim, heads, &mut rng),
                b1: vec![0.0; config.mlp_hidden_dim],
                w2: xavier(1, config.mlp_hidden_dim, &mut rng),
                b2: 0.0,
            },
            w_stats: xavier(config.hidden_dim, TRACE_STATS_DIM, &mut rng),
            b_stats: vec![0.0; config.hidden_dim],
        })
    }

    /// Ensure multi-level parameters exist for `max_level` boundaries,
    /// creating missing ones deterministically. Called when the hierarchy
    /// deepens.
    pub fn ensure_levels(&mut self, max_level: usize) {
        if self.level_params.len() >= max_level {
            return;
        }
        let heads = self.config.num_heads;
        let pass_width = EMBEDDING_DIM / heads;
        // Offset the seed so new levels do not replay layer-0 noise.
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (self.level_params.len() as u64 + 1));
        while self.level_params.len() < max_level {
            self.level_params.push(LevelParams {
                w_child: identity_heads(heads, pass_width, EMBEDDING_DIM, &mut rng),
                w_parent: identity_heads(heads, pass_width, EMBEDDING_DIM, &mut rng),
                a_upward: xavier(heads, 2 * pass_width, &mut rng),
                a_downward: xavier(heads, 2 * pass_width, &mut rng),
            });
        }
    }

    /// Serialize to the flat JSON blob format.
    ///
    /// # Errors
    /// Returns `Serialization` on encoder failure.
    pub fn export(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a params blob, validating every tensor shape against the
    /// embedded config.
    ///
    /// # Errors
    /// `ParamShapeMismatch` names the first offending tensor; the caller
    /// keeps its previous parameters.
    pub fn import(blob: &str) -> Result<Self> {
        let params: ShgatParams = serde_json::from_str(blob)?;
        params.validate_shapes()?;
        Ok(params)
    }

    /// Validate tensor shapes against the embedded config.
    pub fn validate_shapes(&self) -> Result<()> {
        let heads = self.config.num_heads;
        let hidden = self.config.hidden_dim;
        let pass_width = EMBEDDING_DIM / heads.max(1);

        let check = |name: &str, ok: bool, expected: String, actual: String| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(CapflowError::ParamShapeMismatch {
                    tensor: name.to_string(),
                    expected,
                    actual,
                })
            }
        };

        check(
            "w_intent",
            self.w_intent.rows == hidden && self.w_intent.cols == EMBEDDING_DIM,
            format!("[{hidden}, {EMBEDDING_DIM}]"),
            format!("[{}, {}]", self.w_intent.rows, self.w_intent.cols),
        )?;
        check(
            "w_proj",
            self.w_proj.rows == hidden && self.w_proj.cols == 3 * EMBEDDING_DIM,
            format!("[{hidden}, {}]", 3 * EMBEDDING_DIM),
            format!("[{}, {}]", self.w_proj.rows, self.w_proj.cols),
        )?;
        check(
            "b_proj",
            self.b_proj.len() == hidden,
            format!("[{hidden}]"),
            format!("[{}]", self.b_proj.len()),
        )?;
        check(
            "w_stats",
            self.w_stats.rows == hidden && self.w_stats.cols == TRACE_STATS_DIM,
            format!("[{hidden}, {TRACE_STATS_DIM}]"),
            format!("[{}, {}]", self.w_stats.rows, self.w_stats.cols),
        )?;
        check(
            "b_stats",
            self.b_stats.len() == hidden,
            format!("[{hidden}]"),
            format!("[{}]", self.b_stats.len()),
        )?;
        check(
            "head_params",
            self.head_params.heads == heads
                && self.head_params.rows == hidden / heads.max(1)
                && self.head_params.cols == hidden,
            format!("[{heads}, {}, {hidden}]", hidden / heads.max(1)),
            format!(
                "[{}, {}, {}]",
                self.head_params.heads, self.head_params.rows, self.head_params.cols
            ),
        )?;
        check(
            "fusion_mlp.w1",
            self.fusion_mlp.w1.rows == self.config.mlp_hidden_dim
                && self.fusion_mlp.w1.cols == heads,
            format!("[{}, {heads}]", self.config.mlp_hidden_dim),
            format!("[{}, {}]", self.fusion_mlp.w1.rows, self.fusion_mlp.w1.cols),
        )?;
        check(
            "fusion_mlp.w2",
            self.fusion_mlp.w2.rows == 1 && self.fusion_mlp.w2.cols == self.config.mlp_hidden_dim,
            format!("[1, {}]", self.config.mlp_hidden_dim),
            format!("[{}, {}]", self.fusion_mlp.w2.rows, self.fusion_mlp.w2.cols),
        )?;
        check(
            "feature_weights",
            self.feature_weights.len() == TRACE_STATS_DIM,
            format!("[{TRACE_STATS_DIM}]"),
            format!("[{}]", self.feature_weights.len()),
        )?;
        for (i, layer) in self.layer_params.iter().enumerate() {
            for (phase_name, phase) in [("v2e", &layer.v2e), ("e2v", &layer.e2v)] {
                check(
                    &format!("layer_params[{i}].{phase_name}.w_src"),
                    phase.w_src.heads == heads && phase.w_src.rows == pass_width,
                    format!("[{heads}, {pass_width}, _]"),
                    format!("[{}, {}, {}]", phase.w_src.heads, phase.w_src.rows, phase.w_src.cols),
                )?;
                check(
                    &format!("layer_params[{i}].{phase_name}.attention"),
                    phase.attention.rows == heads && phase.attention.cols == 2 * pass_width,
                    format!("[{heads}, {}]", 2 * pass_width),
                    format!("[{}, {}]", phase.attention.rows, phase.attention.cols),
                )?;
            }
        }
        for (i, level) in self.level_params.iter().enumerate() {
            check(
                &format!("level_params[{i}].w_child"),
                level.w_child.heads == heads && level.w_child.rows == pass_width,
                format!("[{heads}, {pass_width}, _]"),
                format!(
                    "[{}, {}, {}]",
                    level.w_child.heads, level.w_child.rows, level.w_child.cols
                ),
            )?;
        }
        Ok(())
    }

    /// Count of trainable scalars (scoring head only; message-passing
    /// parameters stay at their structural initialization).
    #[must_use]
    pub fn trainable_len(&self) -> usize {
        self.w_intent.data.len()
            + self.w_proj.data.len()
            + self.b_proj.len()
            + self.w_stats.data.len()
            + self.b_stats.len()
            + self.head_params.data.len()
            + self.fusion_mlp.w1.data.len()
            + self.fusion_mlp.b1.len()
            + self.fusion_mlp.w2.data.len()
            + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ShgatConfig {
        ShgatConfig {
            num_heads: 4,
            hidden_dim: 32,
            mlp_hidden_dim: 16,
            num_layers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_shapes() {
        let params = ShgatParams::init(&small_config(), 1).unwrap();
        assert_eq!(params.layer_params.len(), 2);
        assert_eq!(params.level_params.len(), 1);
        assert_eq!(params.w_proj.shape(), (32, 3 * EMBEDDING_DIM));
        assert_eq!(params.w_stats.shape(), (32, TRACE_STATS_DIM));
        assert_eq!(params.head_params.heads, 4);
        assert_eq!(params.head_params.rows, 8);
        params.validate_shapes().unwrap();
    }

    #[test]
    fn test_init_rejects_nondividing_heads() {
        let config = ShgatConfig {
            num_heads: 7,
            ..Default::default()
        };
        assert!(ShgatParams::init(&config, 0).is_err());
    }

    #[test]
    fn test_deterministic_init() {
        let a = ShgatParams::init(&small_config(), 1).unwrap();
        let b = ShgatParams::init(&small_config(), 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_like_heads_reconstruct_input() {
        let mut rng = StdRng::seed_from_u64(0);
        let heads = 4;
        let width = EMBEDDING_DIM / heads;
        let w = identity_heads(heads, width, EMBEDDING_DIM, &mut rng);
        // Head h row r should be ~1 at column h * width + r.
        let h = 2;
        let r = 5;
        let row = &w.head(h)[r * EMBEDDING_DIM..(r + 1) * EMBEDDING_DIM];
        assert!((row[h * width + r] - 1.0).abs() < 0.011);
        assert!(row[0].abs() < 0.011);
    }

    #[test]
    fn test_export_import_round_trip() {
        let params = ShgatParams::init(&small_config(), 2).unwrap();
        let blob = params.export().unwrap();
        let back = ShgatParams::import(&blob).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_import_rejects_shape_mismatch() {
        let mut params = ShgatParams::init(&small_config(), 0).unwrap();
        params.w_proj = Tensor::zeros(32, 100);
        let blob = params.export().unwrap();
        let err = ShgatParams::import(&blob).unwrap_err();
        match err {
            CapflowError::ParamShapeMismatch { tensor, .. } => assert_eq!(tensor, "w_proj"),
            other => panic!("expected ParamShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_ensure_levels_extends() {
        let mut params = ShgatParams::init(&small_config(), 0).unwrap();
        assert!(params.level_params.is_empty());
        params.ensure_levels(3);
        assert_eq!(params.level_params.len(), 3);
        params.validate_shapes().unwrap();
        // Idempotent.
        params.ensure_levels(2);
        assert_eq!(params.level_params.len(), 3);
    }
}
