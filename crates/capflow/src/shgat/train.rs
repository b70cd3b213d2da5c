// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Batch training of the scoring head.
//!
//! The trainer owns a deep copy of the parameters (the serving model keeps
//! its snapshot until new params are committed), runs epochs of shuffled
//! mini-batches with an AdamW update, and reports per-example |TD| errors
//! from the final epoch so the replay buffer can re-prioritize. Hard
//! negatives are mined per anchor from the semi-hard band of the cosine
//! distribution before the first epoch.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::features::{RequestContext, TraceFeatures};
use super::params::ShgatParams;
use super::scoring::{forward, Forward};
use crate::capability::ToolId;
use crate::config::TrainingConfig;
use crate::constants::{
    EMBEDDING_DIM, NEGATIVE_EXCLUSION_COSINE, SEMI_HARD_MIN_SPREAD, TRACE_STATS_DIM,
};
use crate::tensor::{cosine, mean_pool, HeadTensor, Tensor};

/// A candidate the trainer can score: a capability or a tool, flattened to
/// what scoring needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingCandidate {
    pub id: String,
    /// L2-normalized embedding (intent embedding for capabilities,
    /// description embedding for tools).
    pub embedding: Vec<f32>,
    /// Direct tools (empty for tool candidates).
    #[serde(default)]
    pub tools: Vec<ToolId>,
    pub success_rate: f64,
    /// True for capability candidates.
    #[serde(default)]
    pub is_capability: bool,
}

/// One training example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainExample {
    /// Originating trace, for priority write-back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    pub intent_embedding: Vec<f32>,
    #[serde(default)]
    pub context_tools: Vec<ToolId>,
    pub candidate_id: String,
    /// 1.0 for success, 0.0 for failure.
    pub outcome: f32,
    /// Mined hard negatives; filled by the trainer when empty.
    #[serde(default)]
    pub negative_ids: Vec<String>,
    /// Importance-sampling weight from the replay buffer.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Result of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub final_loss: f64,
    pub final_accuracy: f64,
    /// Per-example TD errors (anchor only) from the last epoch, in input
    /// order.
    pub td_errors: Vec<f64>,
    pub epochs_run: usize,
}

/// Gradient accumulator over the trainable tensors.
struct Grads {
    w_proj: Tensor,
    b_proj: Vec<f32>,
    w_stats: Tensor,
    b_stats: Vec<f32>,
    w_intent: Tensor,
    head_params: HeadTensor,
    w1: Tensor,
    b1: Vec<f32>,
    w2: Tensor,
    b2: f32,
}

impl Grads {
    fn zeros(params: &ShgatParams) -> Self {
        Self {
            w_proj: Tensor::zeros(params.w_proj.rows, params.w_proj.cols),
            b_proj: vec![0.0; params.b_proj.len()],
            w_stats: Tensor::zeros(params.w_stats.rows, params.w_stats.cols),
            b_stats: vec![0.0; params.b_stats.len()],
            w_intent: Tensor::zeros(params.w_intent.rows, params.w_intent.cols),
            head_params: HeadTensor::zeros(
                params.head_params.heads,
                params.head_params.rows,
                params.head_params.cols,
            ),
            w1: Tensor::zeros(params.fusion_mlp.w1.rows, params.fusion_mlp.w1.cols),
            b1: vec![0.0; params.fusion_mlp.b1.len()],
            w2: Tensor::zeros(params.fusion_mlp.w2.rows, params.fusion_mlp.w2.cols),
            b2: 0.0,
        }
    }

    fn scale(&mut self, factor: f32) {
        for v in self
            .w_proj
            .data
            .iter_mut()
            .chain(self.b_proj.iter_mut())
            .chain(self.w_stats.data.iter_mut())
            .chain(self.b_stats.iter_mut())
            .chain(self.w_intent.data.iter_mut())
            .chain(self.head_params.data.iter_mut())
            .chain(self.w1.data.iter_mut())
            .chain(self.b1.iter_mut())
            .chain(self.w2.data.iter_mut())
        {
            *v *= factor;
        }
        self.b2 *= factor;
    }

    fn global_norm(&self) -> f32 {
        let mut sum = 0.0f32;
        for v in self
            .w_proj
            .data
            .iter()
            .chain(self.b_proj.iter())
            .chain(self.w_stats.data.iter())
            .chain(self.b_stats.iter())
            .chain(self.w_intent.data.iter())
            .chain(self.head_params.data.iter())
            .chain(self.w1.data.iter())
            .chain(self.b1.iter())
            .chain(self.w2.data.iter())
        {
            sum += v * v;
        }
        (sum + self.b2 * self.b2).sqrt()
    }
}

/// AdamW first/second-moment state for one tensor.
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Moments {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }
}

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;
const GRAD_CLIP_NORM: f32 = 5.0;

struct AdamState {
    step: u64,
    slots: HashMap<&'static str, Moments>,
}

impl AdamState {
    fn new(params: &ShgatParams) -> Self {
        let mut slots = HashMap::new();
        slots.insert("w_proj", Moments::zeros(params.w_proj.data.len()));
        slots.insert("b_proj", Moments::zeros(params.b_proj.len()));
        slots.insert("w_stats", Moments::zeros(params.w_stats.data.len()));
        slots.insert("b_stats", Moments::zeros(params.b_stats.len()));
        slots.insert("w_intent", Moments::zeros(params.w_intent.data.len()));
        slots.insert("head_params", Moments::zeros(params.head_params.data.len()));
        slots.insert("w1", Moments::zeros(params.fusion_mlp.w1.data.len()));
        slots.insert("b1", Moments::zeros(params.fusion_mlp.b1.len()));
        slots.insert("w2", Moments::zeros(params.fusion_mlp.w2.data.len()));
        slots.insert("b2", Moments::zeros(1));
        Self { step: 0, slots }
    }

    /// One decoupled-weight-decay Adam update on a flat buffer.
    fn update(
        &mut self,
        name: &'static str,
        param: &mut [f32],
        grad: &[f32],
        lr: f32,
        weight_decay: f32,
    ) {
        let t = self.step as f32;
        let Some(moments) = self.slots.get_mut(name) else {
            return;
        };
        let bias1 = 1.0 - ADAM_BETA1.powf(t);
        let bias2 = 1.0 - ADAM_BETA2.powf(t);
        for i in 0..param.len() {
            let g = grad[i];
            moments.m[i] = ADAM_BETA1 * moments.m[i] + (1.0 - ADAM_BETA1) * g;
            moments.v[i] = ADAM_BETA2 * moments.v[i] + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = moments.m[i] / bias1;
            let v_hat = moments.v[i] / bias2;
            param[i] -= lr * (m_hat / (v_hat.sqrt() + ADAM_EPS) + weight_decay * param[i]);
        }
    }
}

/// The trainer: owns its parameter copy and optimizer state.
pub struct Trainer {
    params: ShgatParams,
    config: TrainingConfig,
    adam: AdamState,
    rng: StdRng,
}

impl Trainer {
    /// Create a trainer over a deep copy of `params`.
    #[must_use]
    pub fn new(params: ShgatParams, config: TrainingConfig) -> Self {
        let adam = AdamState::new(&params);
        let seed = params.config.seed ^ 0x7261696e;
        Self {
            params,
            config,
            adam,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Consume the trainer and return the trained parameters.
    #[must_use]
    pub fn into_params(self) -> ShgatParams {
        self.params
    }

    /// Borrow the current parameters.
    #[must_use]
    pub fn params(&self) -> &ShgatParams {
        &self.params
    }

    /// Run `epochs` of training.
    ///
    /// An empty example set is a no-op reporting zero loss and accuracy.
    /// Examples with no mined negatives get them mined here, once, before
    /// the first epoch.
    pub fn train(
        &mut self,
        candidates: &[TrainingCandidate],
        examples: &[TrainExample],
        epochs: usize,
        batch_size: usize,
    ) -> TrainReport {
        if examples.is_empty() {
            return TrainReport {
                final_loss: 0.0,
                final_accuracy: 0.0,
                td_errors: Vec::new(),
                epochs_run: 0,
            };
        }
        let by_id: HashMap<&str, &TrainingCandidate> =
            candidates.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut examples: Vec<TrainExample> = examples.to_vec();
        for example in &mut examples {
            if example.negative_ids.is_empty() {
                example.negative_ids = mine_hard_negatives(
                    &example.intent_embedding,
                    &example.candidate_id,
                    candidates,
                    self.config.num_negatives,
                    self.config.semi_hard_range,
                    &mut self.rng,
                );
            }
        }

        let batch_size = batch_size.max(1);
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut final_loss = 0.0;
        let mut final_accuracy = 0.0;
        let mut td_errors = vec![0.0f64; examples.len()];

        for epoch in 0..epochs {
            order.shuffle(&mut self.rng);
            let mut epoch_loss = 0.0f64;
            let mut correct = 0usize;
            let mut counted = 0usize;
            let last_epoch = epoch + 1 == epochs;

            for chunk in order.chunks(batch_size) {
                let mut grads = Grads::zeros(&self.params);
                let mut batch_items = 0usize;
                for &idx in chunk {
                    let example = &examples[idx];
                    let Some(anchor) = by_id.get(example.candidate_id.as_str()) else {
                        continue;
                    };
                    // Anchor item.
                    let features = self.build_features(example, anchor, &by_id);
                    let out = self.backward(&features, example.outcome, example.weight as f32, &mut grads);
                    epoch_loss += bce_loss(out.y, example.outcome, example.weight as f32) as f64;
                    if (out.y >= 0.5) == (example.outcome >= 0.5) {
                        correct += 1;
                    }
                    counted += 1;
                    batch_items += 1;
                    if last_epoch {
                        td_errors[idx] = (example.outcome - out.y) as f64;
                    }
                    // Mined negatives train toward 0.
                    for negative_id in &example.negative_ids {
                        let Some(negative) = by_id.get(negative_id.as_str()) else {
                            continue;
                        };
                        let features = self.build_features(example, negative, &by_id);
                        let out =
                            self.backward(&features, 0.0, example.weight as f32, &mut grads);
                        epoch_loss += bce_loss(out.y, 0.0, example.weight as f32) as f64;
                        if out.y < 0.5 {
                            correct += 1;
                        }
                        counted += 1;
                        batch_items += 1;
                    }
                }
                if batch_items == 0 {
                    continue;
                }
                grads.scale(1.0 / batch_items as f32);
                let norm = grads.global_norm();
                if norm > GRAD_CLIP_NORM {
                    grads.scale(GRAD_CLIP_NORM / norm);
                }
                self.apply(&grads);
            }

            if counted > 0 {
                final_loss = epoch_loss / counted as f64;
                final_accuracy = correct as f64 / counted as f64;
            }
            debug!(epoch, loss = final_loss, accuracy = final_accuracy, "epoch complete");
        }

        info!(
            examples = examples.len(),
            loss = final_loss,
            accuracy = final_accuracy,
            "training run complete"
        );
        TrainReport {
            final_loss,
            final_accuracy,
            td_errors,
            epochs_run: epochs,
        }
    }

    fn build_features(
        &self,
        example: &TrainExample,
        candidate: &TrainingCandidate,
        by_id: &HashMap<&str, &TrainingCandidate>,
    ) -> TraceFeatures {
        let context_rows: Vec<&[f32]> = example
            .context_tools
            .iter()
            .filter_map(|t| by_id.get(t.as_str()).map(|c| c.embedding.as_slice()))
            .collect();
        let request = RequestContext {
            intent_embedding: pad(&example.intent_embedding),
            context_tools: example.context_tools.clone(),
            context_embedding: mean_pool(&context_rows, EMBEDDING_DIM),
        };
        let mut stats = [0.0f32; TRACE_STATS_DIM];
        stats[0] = candidate.success_rate as f32;
        stats[13] = candidate.tools.len() as f32 / (candidate.tools.len() as f32 + 10.0);
        stats[14] = if candidate.tools.is_empty() {
            0.0
        } else {
            candidate
                .tools
                .iter()
                .filter(|t| example.context_tools.contains(t))
                .count() as f32
                / candidate.tools.len() as f32
        };
        stats[16] = if (candidate.success_rate - 0.5).abs() < f64::EPSILON {
            1.0
        } else {
            0.0
        };
        let mut embedding_block = Vec::with_capacity(3 * EMBEDDING_DIM);
        embedding_block.extend_from_slice(&request.intent_embedding);
        embedding_block.extend_from_slice(&pad(&candidate.embedding));
        embedding_block.extend_from_slice(&request.context_embedding);
        TraceFeatures {
            embedding_block,
            stats,
        }
    }

    /// Forward with dropout, then accumulate gradients for one item.
    fn backward(&mut self, features: &TraceFeatures, target: f32, weight: f32, grads: &mut Grads) -> Forward {
        let dropout = self.params.config.dropout;
        let out = forward(&self.params, features, Some((&mut self.rng, dropout)));
        if out.is_unstable() {
            return out;
        }
        let params = &self.params;
        let hidden = params.config.hidden_dim;
        let heads = params.config.num_heads;
        let qk_dim = hidden / heads;
        let scale = 1.0 / (qk_dim as f32).sqrt();

        // dL/dy_pre for weighted BCE through the sigmoid.
        let dy_pre = weight * (out.y - target);

        // Fusion MLP.
        grads.b2 += dy_pre;
        let mut dm_pre = vec![0.0f32; out.m.len()];
        for j in 0..out.m.len() {
            grads.w2.data[j] += dy_pre * out.m[j];
            if out.m_pre[j] > 0.0 {
                dm_pre[j] = params.fusion_mlp.w2.get(0, j) * dy_pre;
            }
        }
        let mut du = vec![0.0f32; heads];
        for r in 0..dm_pre.len() {
            if dm_pre[r] == 0.0 {
                continue;
            }
            grads.b1[r] += dm_pre[r];
            for c in 0..heads {
                grads.w1.data[r * heads + c] += dm_pre[r] * out.head_scores[c];
                du[c] += params.fusion_mlp.w1.get(r, c) * dm_pre[r];
            }
        }

        // Heads.
        let mut dg = vec![0.0f32; hidden];
        let mut dh = vec![0.0f32; hidden];
        for h_idx in 0..heads {
            let s = out.head_scores[h_idx];
            let dz = du[h_idx] * s * (1.0 - s);
            if dz == 0.0 {
                continue;
            }
            let w = params.head_params.head(h_idx);
            let gslot = grads.head_params.head_mut(h_idx);
            for r in 0..qk_dim {
                let dq = dz * scale * out.k[h_idx][r];
                let dk = dz * scale * out.q[h_idx][r];
                let row = &w[r * hidden..(r + 1) * hidden];
                let grow = &mut gslot[r * hidden..(r + 1) * hidden];
                for c in 0..hidden {
                    grow[c] += dq * out.g[c] + dk * out.h[c];
                    dg[c] += row[c] * dq;
                    dh[c] += row[c] * dk;
                }
            }
        }

        // Candidate-side projection (through the dropout mask and ReLU).
        let intent = &out.x_embed[..EMBEDDING_DIM];
        for r in 0..hidden {
            let mut grad = dh[r];
            if let Some(mask) = &out.dropout_mask {
                grad *= mask[r];
            }
            if out.h_pre[r] <= 0.0 {
                grad = 0.0;
            }
            if grad == 0.0 {
                continue;
            }
            grads.b_proj[r] += grad;
            grads.b_stats[r] += grad;
            let wrow = &mut grads.w_proj.data[r * out.x_embed.len()..(r + 1) * out.x_embed.len()];
            for (c, &x) in out.x_embed.iter().enumerate() {
                if x != 0.0 {
                    wrow[c] += grad * x;
                }
            }
            let srow = &mut grads.w_stats.data[r * TRACE_STATS_DIM..(r + 1) * TRACE_STATS_DIM];
            for (c, &x) in out.x_stats.iter().enumerate() {
                srow[c] += grad * x;
            }
        }

        // Intent-side projection.
        for r in 0..hidden {
            if out.g_pre[r] <= 0.0 || dg[r] == 0.0 {
                continue;
            }
            let grad = dg[r];
            let wrow = &mut grads.w_intent.data[r * EMBEDDING_DIM..(r + 1) * EMBEDDING_DIM];
            for (c, &x) in intent.iter().enumerate() {
                if x != 0.0 {
                    wrow[c] += grad * x;
                }
            }
        }
        out
    }

    fn apply(&mut self, grads: &Grads) {
        self.adam.step += 1;
        let lr = self.config.learning_rate;
        let wd = self.params.config.l2_lambda;
        self.adam
            .update("w_proj", &mut self.params.w_proj.data, &grads.w_proj.data, lr, wd);
        self.adam
            .update("b_proj", &mut self.params.b_proj, &grads.b_proj, lr, 0.0);
        self.adam
            .update("w_stats", &mut self.params.w_stats.data, &grads.w_stats.data, lr, wd);
        self.adam
            .update("b_stats", &mut self.params.b_stats, &grads.b_stats, lr, 0.0);
        self.adam
            .update("w_intent", &mut self.params.w_intent.data, &grads.w_intent.data, lr, wd);
        self.adam.update(
            "head_params",
            &mut self.params.head_params.data,
            &grads.head_params.data,
            lr,
            wd,
        );
        self.adam
            .update("w1", &mut self.params.fusion_mlp.w1.data, &grads.w1.data, lr, wd);
        self.adam
            .update("b1", &mut self.params.fusion_mlp.b1, &grads.b1, lr, 0.0);
        self.adam
            .update("w2", &mut self.params.fusion_mlp.w2.data, &grads.w2.data, lr, wd);
        let mut b2 = [self.params.fusion_mlp.b2];
        self.adam.update("b2", &mut b2, &[grads.b2], lr, 0.0);
        self.params.fusion_mlp.b2 = b2[0];
    }
}

fn pad(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    out.resize(EMBEDDING_DIM, 0.0);
    out
}

fn bce_loss(y: f32, target: f32, weight: f32) -> f32 {
    let y = y.clamp(1e-7, 1.0 - 1e-7);
    -weight * (target * y.ln() + (1.0 - target) * (1.0 - y).ln())
}

/// Mine semi-hard negatives for one anchor.
///
/// Pool: every candidate except the anchor, its direct tools, and any tool
/// within a 0.7-cosine cluster of those tools. Candidates whose
/// intent-similarity falls in the `[p_low, p_high]` percentile band are
/// preferred (band widened to a minimum spread of 0.1 around its midpoint),
/// topped up randomly when the band is thin.
#[must_use]
pub fn mine_hard_negatives(
    intent_embedding: &[f32],
    anchor_id: &str,
    candidates: &[TrainingCandidate],
    num_negatives: usize,
    semi_hard_range: (f32, f32),
    rng: &mut StdRng,
) -> Vec<String> {
    let anchor_tools: Vec<&TrainingCandidate> = candidates
        .iter()
        .find(|c| c.id == anchor_id)
        .map(|anchor| {
            candidates
                .iter()
                .filter(|c| anchor.tools.contains(&c.id))
                .collect()
        })
        .unwrap_or_default();

    let excluded = |candidate: &TrainingCandidate| -> bool {
        if candidate.id == anchor_id {
            return true;
        }
        if anchor_tools.iter().any(|t| t.id == candidate.id) {
            return true;
        }
        // Tools in a tight cosine cluster with the anchor's tools are
        // near-duplicates, not negatives.
        !candidate.is_capability
            && anchor_tools
                .iter()
                .any(|t| cosine(&t.embedding, &candidate.embedding) >= NEGATIVE_EXCLUSION_COSINE)
    };

    let mut scored: Vec<(&TrainingCandidate, f32)> = candidates
        .iter()
        .filter(|c| !excluded(c))
        .map(|c| (c, cosine(intent_embedding, &c.embedding)))
        .collect();
    if scored.is_empty() {
        return Vec::new();
    }
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let percentile = |q: f32| -> f32 {
        let pos = q * (scored.len() - 1) as f32;
        scored[pos.round() as usize].1
    };
    let mut low = percentile(semi_hard_range.0);
    let mut high = percentile(semi_hard_range.1);
    if high - low < SEMI_HARD_MIN_SPREAD {
        let mid = (high + low) / 2.0;
        low = mid - SEMI_HARD_MIN_SPREAD / 2.0;
        high = mid + SEMI_HARD_MIN_SPREAD / 2.0;
    }

    let mut band: Vec<&TrainingCandidate> = scored
        .iter()
        .filter(|(_, sim)| (low..=high).contains(sim))
        .map(|(c, _)| *c)
        .collect();
    band.shuffle(rng);
    let mut picked: Vec<String> = band
        .into_iter()
        .take(num_negatives)
        .map(|c| c.id.clone())
        .collect();

    // Top up with random candidates outside the band.
    if picked.len() < num_negatives {
        let mut rest: Vec<&TrainingCandidate> = scored
            .iter()
            .map(|(c, _)| *c)
            .filter(|c| !picked.contains(&c.id))
            .collect();
        rest.shuffle(rng);
        for c in rest {
            if picked.len() >= num_negatives {
                break;
            }
            picked.push(c.id.clone());
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShgatConfig;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn small_params() -> ShgatParams {
        let config = ShgatConfig {
            num_heads: 4,
            hidden_dim: 32,
            mlp_hidden_dim: 16,
            num_layers: 1,
            dropout: 0.0,
            ..Default::default()
        };
        ShgatParams::init(&config, 0).unwrap()
    }

    fn candidates() -> Vec<TrainingCandidate> {
        let mut out = vec![TrainingCandidate {
            id: "cap-fetch".into(),
            embedding: unit(0),
            tools: vec!["net:get".into(), "json:parse".into()],
            success_rate: 0.9,
            is_capability: true,
        }];
        for (i, id) in ["net:get", "json:parse", "fs:read", "fs:write", "db:query"]
            .iter()
            .enumerate()
        {
            out.push(TrainingCandidate {
                id: (*id).to_string(),
                embedding: unit(i + 1),
                tools: Vec::new(),
                success_rate: 0.5,
                is_capability: false,
            });
        }
        out
    }

    fn examples(n: usize) -> Vec<TrainExample> {
        (0..n)
            .map(|i| TrainExample {
                trace_id: None,
                intent_embedding: unit(0),
                context_tools: vec!["net:get".into()],
                candidate_id: "cap-fetch".into(),
                outcome: if i % 4 == 0 { 0.0 } else { 1.0 },
                negative_ids: Vec::new(),
                weight: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_empty_training_is_noop() {
        let mut trainer = Trainer::new(small_params(), TrainingConfig::default());
        let report = trainer.train(&candidates(), &[], 5, 8);
        assert_eq!(report.final_loss, 0.0);
        assert_eq!(report.final_accuracy, 0.0);
        assert!(report.td_errors.is_empty());
        assert_eq!(report.epochs_run, 0);
    }

    #[test]
    fn test_training_reduces_loss() {
        let params = small_params();
        let config = TrainingConfig {
            num_negatives: 2,
            learning_rate: 0.01,
            ..Default::default()
        };
        let candidate_pool = candidates();
        let positive: Vec<TrainExample> = (0..8)
            .map(|_| TrainExample {
                trace_id: None,
                intent_embedding: unit(0),
                context_tools: vec!["net:get".into()],
                candidate_id: "cap-fetch".into(),
                outcome: 1.0,
                negative_ids: Vec::new(),
                weight: 1.0,
            })
            .collect();

        let mut probe = Trainer::new(params.clone(), config.clone());
        let before = probe.train(&candidate_pool, &positive, 1, 4).final_loss;
        let mut trainer = Trainer::new(params, config);
        let after = trainer.train(&candidate_pool, &positive, 30, 4).final_loss;
        assert!(
            after < before,
            "loss should drop after training: before={before}, after={after}"
        );
    }

    #[test]
    fn test_td_errors_reported_per_example() {
        let mut trainer = Trainer::new(small_params(), TrainingConfig::default());
        let examples = examples(6);
        let report = trainer.train(&candidates(), &examples, 2, 4);
        assert_eq!(report.td_errors.len(), 6);
        for td in &report.td_errors {
            assert!(td.abs() <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_mined_negatives_exclude_anchor_and_its_tools() {
        let pool = candidates();
        let mut rng = StdRng::seed_from_u64(3);
        let negatives = mine_hard_negatives(&unit(0), "cap-fetch", &pool, 8, (0.25, 0.75), &mut rng);
        assert!(!negatives.contains(&"cap-fetch".to_string()));
        assert!(!negatives.contains(&"net:get".to_string()));
        assert!(!negatives.contains(&"json:parse".to_string()));
        assert!(!negatives.is_empty());
    }

    #[test]
    fn test_mined_negatives_exclude_near_duplicate_tools() {
        let mut pool = candidates();
        // A near-duplicate of net:get (cosine 1.0 > 0.7).
        pool.push(TrainingCandidate {
            id: "net:get2".into(),
            embedding: unit(1),
            tools: Vec::new(),
            success_rate: 0.5,
            is_capability: false,
        });
        let mut rng = StdRng::seed_from_u64(3);
        let negatives = mine_hard_negatives(&unit(0), "cap-fetch", &pool, 8, (0.25, 0.75), &mut rng);
        assert!(!negatives.contains(&"net:get2".to_string()));
    }

    #[test]
    fn test_mined_negatives_top_up_to_requested_count() {
        let pool = candidates();
        let mut rng = StdRng::seed_from_u64(3);
        let negatives = mine_hard_negatives(&unit(0), "cap-fetch", &pool, 3, (0.25, 0.75), &mut rng);
        assert_eq!(negatives.len(), 3);
        let mut dedup = negatives.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_gradient_clipping_bounds_update() {
        let params = small_params();
        let mut grads = Grads::zeros(&params);
        for v in grads.w_proj.data.iter_mut() {
            *v = 100.0;
        }
        let norm = grads.global_norm();
        assert!(norm > GRAD_CLIP_NORM);
        grads.scale(GRAD_CLIP_NORM / norm);
        assert!((grads.global_norm() - GRAD_CLIP_NORM).abs() < 1e-2);
    }
}
