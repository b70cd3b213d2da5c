// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Message passing over the superhypergraph.
//!
//! Three passes, all masked by structure and all dimension-preserving so
//! residual connections stay well-typed:
//!
//! 1. Optional V->V enrichment from the sparse tool co-occurrence matrix.
//! 2. Per-layer V->E (tools into level-0 capabilities) and E->V phases
//!    with per-head additive attention.
//! 3. Multi-level E^k -> E^(k+1) upward then downward, with residuals on
//!    the downward pass and at the final level-0 -> tools step.

use std::collections::HashMap;

use super::params::{LevelParams, PhaseParams, ShgatParams};
use crate::capability::ToolId;
use crate::constants::EMBEDDING_DIM;
use crate::graph::{ContainmentMatrix, GraphSnapshot};
use crate::tensor::{self, concat, cosine, elu, leaky_relu, masked_softmax, softmax};

/// Sparse tool co-occurrence weights feeding the V->V enrichment.
#[derive(Debug, Clone, Default)]
pub struct CoOccurrenceMatrix {
    /// `tool -> [(other_tool, weight)]`, symmetric by construction.
    weights: HashMap<ToolId, Vec<(ToolId, f64)>>,
}

impl CoOccurrenceMatrix {
    /// Build from undirected pair counts.
    #[must_use]
    pub fn from_pairs(pairs: &[((ToolId, ToolId), u64)]) -> Self {
        let mut weights: HashMap<ToolId, Vec<(ToolId, f64)>> = HashMap::new();
        for ((a, b), count) in pairs {
            let w = *count as f64;
            weights.entry(a.clone()).or_default().push((b.clone(), w));
            weights.entry(b.clone()).or_default().push((a.clone(), w));
        }
        Self { weights }
    }

    /// Co-occurring tools for `tool`.
    #[must_use]
    pub fn neighbors(&self, tool: &str) -> &[(ToolId, f64)] {
        self.weights.get(tool).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Node states during propagation: row per node key.
#[derive(Debug, Clone)]
pub struct NodeStates {
    pub keys: Vec<String>,
    pub index: HashMap<String, usize>,
    /// Row-major `n x EMBEDDING_DIM`.
    pub rows: Vec<Vec<f32>>,
}

impl NodeStates {
    /// Build states from `(key, embedding)` pairs; embeddings shorter than
    /// the model dimension are zero-padded.
    #[must_use]
    pub fn new(entries: Vec<(String, Vec<f32>)>) -> Self {
        let mut keys = Vec::with_capacity(entries.len());
        let mut rows = Vec::with_capacity(entries.len());
        for (key, mut embedding) in entries {
            embedding.resize(EMBEDDING_DIM, 0.0);
            keys.push(key);
            rows.push(embedding);
        }
        let index = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        Self { keys, index, rows }
    }

    /// Row for a key.
    #[must_use]
    pub fn row(&self, key: &str) -> Option<&[f32]> {
        self.index.get(key).map(|&i| self.rows[i].as_slice())
    }
}

/// Attention rows captured from the last V->E phase:
/// `capability -> [(tool, mean-head weight)]`.
pub type AttentionRows = HashMap<String, Vec<(ToolId, f32)>>;

/// Output of a full propagation pass.
#[derive(Debug, Clone)]
pub struct PropagatedStates {
    pub tools: NodeStates,
    /// Per-level capability states, index = hierarchy level.
    pub capability_levels: Vec<NodeStates>,
    /// V->E attention from the final layer, for interpretability output.
    pub tool_attention: AttentionRows,
}

/// V->V enrichment: each tool absorbs a residual of its co-occurring
/// neighbors, attention-weighted by `cos(H_i, H_j) * w_ij / tau` (or by raw
/// co-occurrence weight when attention is disabled), then re-normalized.
#[must_use]
pub fn enrich_tools(
    states: &NodeStates,
    co_occurrence: &CoOccurrenceMatrix,
    beta: f32,
    tau: f32,
    use_attention: bool,
) -> NodeStates {
    if co_occurrence.is_empty() || beta == 0.0 {
        return states.clone();
    }
    let mut out = states.clone();
    for (i, key) in states.keys.iter().enumerate() {
        let neighbors = co_occurrence.neighbors(key);
        let present: Vec<(usize, f64)> = neighbors
            .iter()
            .filter_map(|(n, w)| states.index.get(n).map(|&j| (j, *w)))
            .collect();
        if present.is_empty() {
            continue;
        }
        let scores: Vec<f32> = present
            .iter()
            .map(|&(j, w)| {
                if use_attention {
                    cosine(&states.rows[i], &states.rows[j]) * (w as f32) / tau.max(1e-6)
                } else {
                    w as f32
                }
            })
            .collect();
        let alphas = softmax(&scores);
        let row = &mut out.rows[i];
        for (&(j, _), &alpha) in present.iter().zip(alphas.iter()) {
            for (dst, &src) in row.iter_mut().zip(states.rows[j].iter()) {
                *dst += beta * alpha * src;
            }
        }
        tensor::l2_normalize(row);
    }
    out
}

/// One masked attention phase: every target aggregates from its masked
/// sources with per-head additive attention, ELU activation, heads
/// concatenated. Returns new target rows plus per-target attention
/// weights averaged over heads.
///
/// `mask(source_idx, target_idx)` gates which pairs attend; sources and
/// targets index into their respective states.
fn attention_phase<F: Fn(usize, usize) -> bool>(
    sources: &NodeStates,
    targets: &NodeStates,
    params: &PhaseParams,
    slope: f32,
    mask: F,
) -> (Vec<Vec<f32>>, Vec<Vec<(usize, f32)>>) {
    let heads = params.w_src.heads;
    let width = params.w_src.rows;
    let n_src = sources.rows.len();
    let mut new_rows: Vec<Vec<f32>> = Vec::with_capacity(targets.rows.len());
    let mut weights_out: Vec<Vec<(usize, f32)>> = Vec::with_capacity(targets.rows.len());

    // Pre-project every source once per head.
    let mut projected_src: Vec<Vec<f32>> = Vec::with_capacity(heads);
    for h in 0..heads {
        let w = params.w_src.head(h);
        let mut rows = Vec::with_capacity(n_src * width);
        for src in &sources.rows {
            for r in 0..width {
                rows.push(tensor::dot(&w[r * src.len()..(r + 1) * src.len()], src));
            }
        }
        projected_src.push(rows);
    }

    for (t_idx, target) in targets.rows.iter().enumerate() {
        let admitted: Vec<usize> = (0..n_src).filter(|&s| mask(s, t_idx)).collect();
        if admitted.is_empty() {
            new_rows.push(target.clone());
            weights_out.push(Vec::new());
            continue;
        }

        let mut head_outputs: Vec<f32> = Vec::with_capacity(heads * width);
        let mut mean_weights = vec![0.0f32; admitted.len()];
        for h in 0..heads {
            let w_dst = params.w_dst.head(h);
            let mut y = vec![0.0f32; width];
            for r in 0..width {
                y[r] = tensor::dot(&w_dst[r * target.len()..(r + 1) * target.len()], target);
            }
            let a = params.attention.row(h);
            let scores: Vec<f32> = admitted
                .iter()
                .map(|&s| {
                    let x = &projected_src[h][s * width..(s + 1) * width];
                    let pair = concat(x, &y);
                    leaky_relu(tensor::dot(a, &pair), slope)
                })
                .collect();
            let mask_vec = vec![true; scores.len()];
            let alphas = masked_softmax(&scores, &mask_vec);

            let mut aggregated = vec![0.0f32; width];
            for (slot, &s) in admitted.iter().enumerate() {
                let x = &projected_src[h][s * width..(s + 1) * width];
                for (dst, &v) in aggregated.iter_mut().zip(x.iter()) {
                    *dst += alphas[slot] * v;
                }
            }
            for v in &mut aggregated {
                *v = elu(*v);
            }
            head_outputs.extend_from_slice(&aggregated);
            for (slot, &alpha) in alphas.iter().enumerate() {
                mean_weights[slot] += alpha / heads as f32;
            }
        }

        new_rows.push(head_outputs);
        weights_out.push(admitted.into_iter().zip(mean_weights).collect());
    }
    (new_rows, weights_out)
}

/// Full propagation: enrichment (caller-applied), layered V<->E phases,
/// then the multi-level ladder with downward residuals.
pub struct Propagator<'a> {
    pub params: &'a ShgatParams,
    pub snapshot: &'a GraphSnapshot,
}

impl<'a> Propagator<'a> {
    /// Run message passing and return propagated states for tools and every
    /// capability level.
    #[must_use]
    pub fn propagate(&self, tools: NodeStates) -> PropagatedStates {
        let slope = self.params.config.leaky_relu_slope;
        let containment = &self.snapshot.containment;

        // Level states seeded from intent embeddings.
        let mut levels: Vec<NodeStates> = Vec::new();
        let max_level = self.snapshot.levels.values().copied().max();
        if let Some(max) = max_level {
            for level in 0..=max {
                let entries: Vec<(String, Vec<f32>)> = self
                    .snapshot
                    .capabilities
                    .iter()
                    .filter(|c| c.hierarchy_level == level)
                    .map(|c| (c.id.to_string(), c.intent_embedding.clone()))
                    .collect();
                levels.push(NodeStates::new(entries));
            }
        }

        let mut tool_states = tools;
        let mut tool_attention: AttentionRows = HashMap::new();

        if !containment.is_empty() && !levels.is_empty() {
            let incidence = &containment[0];
            for layer in &self.params.layer_params {
                // V->E: capabilities aggregate their member tools.
                let (cap_rows, cap_weights) = {
                    let level0 = &levels[0];
                    attention_phase(&tool_states, level0, &layer.v2e, slope, |s, t| {
                        member_mask(incidence, &tool_states, level0, s, t)
                    })
                };
                record_attention(&mut tool_attention, &tool_states, &levels[0], &cap_weights);
                for (row, new) in levels[0].rows.iter_mut().zip(cap_rows) {
                    *row = new;
                }

                // E->V: tools aggregate their containing capabilities, with
                // a residual back onto the previous tool states.
                let (tool_rows, _) = {
                    let level0 = &levels[0];
                    attention_phase(level0, &tool_states, &layer.e2v, slope, |s, t| {
                        member_mask(incidence, &tool_states, level0, t, s)
                    })
                };
                for (row, new) in tool_states.rows.iter_mut().zip(tool_rows) {
                    for (dst, v) in row.iter_mut().zip(new.iter()) {
                        *dst += v;
                    }
                    tensor::l2_normalize(row);
                }
            }
        }

        // Multi-level ladder: upward E^k -> E^(k+1), then downward with
        // residuals, attenuated by depth decay per boundary.
        let decay = self.params.config.depth_decay;
        for k in 0..levels.len().saturating_sub(1) {
            let Some(level) = self.params.level_params.get(k) else {
                break;
            };
            let Some(matrix) = containment.get(k + 1) else {
                break;
            };
            let factor = decay.powi(k as i32);
            let (children, parents) = split_pair(&mut levels, k);
            upward_pass(children, parents, level, matrix, slope, factor);
        }
        for k in (0..levels.len().saturating_sub(1)).rev() {
            let Some(level) = self.params.level_params.get(k) else {
                continue;
            };
            let Some(matrix) = containment.get(k + 1) else {
                continue;
            };
            let factor = decay.powi(k as i32);
            let (children, parents) = split_pair(&mut levels, k);
            downward_pass(children, parents, level, matrix, slope, factor);
        }

        PropagatedStates {
            tools: tool_states,
            capability_levels: levels,
            tool_attention,
        }
    }
}

fn member_mask(
    incidence: &ContainmentMatrix,
    tools: &NodeStates,
    caps: &NodeStates,
    tool_idx: usize,
    cap_idx: usize,
) -> bool {
    let Some(tool_key) = tools.keys.get(tool_idx) else {
        return false;
    };
    let Some(cap_key) = caps.keys.get(cap_idx) else {
        return false;
    };
    let (Some(&row), Some(&col)) = (
        incidence.child_index.get(tool_key),
        incidence.parent_index.get(cap_key),
    ) else {
        return false;
    };
    incidence.pairs.binary_search(&(row, col)).is_ok()
}

fn record_attention(
    attention: &mut AttentionRows,
    tools: &NodeStates,
    caps: &NodeStates,
    weights: &[Vec<(usize, f32)>],
) {
    for (cap_idx, row) in weights.iter().enumerate() {
        if row.is_empty() {
            continue;
        }
        let Some(cap_key) = caps.keys.get(cap_idx) else {
            continue;
        };
        let resolved: Vec<(ToolId, f32)> = row
            .iter()
            .filter_map(|&(tool_idx, w)| tools.keys.get(tool_idx).map(|k| (k.clone(), w)))
            .collect();
        attention.insert(cap_key.clone(), resolved);
    }
}

fn split_pair(levels: &mut [NodeStates], k: usize) -> (&mut NodeStates, &mut NodeStates) {
    let (lo, hi) = levels.split_at_mut(k + 1);
    (&mut lo[k], &mut hi[0])
}

fn boundary_mask(
    matrix: &ContainmentMatrix,
    children: &NodeStates,
    parents: &NodeStates,
    child_idx: usize,
    parent_idx: usize,
) -> bool {
    let (Some(child_key), Some(parent_key)) =
        (children.keys.get(child_idx), parents.keys.get(parent_idx))
    else {
        return false;
    };
    let (Some(&row), Some(&col)) = (
        matrix.child_index.get(child_key),
        matrix.parent_index.get(parent_key),
    ) else {
        return false;
    };
    matrix.pairs.binary_search(&(row, col)).is_ok()
}

fn upward_pass(
    children: &NodeStates,
    parents: &mut NodeStates,
    level: &LevelParams,
    matrix: &ContainmentMatrix,
    slope: f32,
    factor: f32,
) {
    let phase = PhaseParams {
        w_src: level.w_child.clone(),
        w_dst: level.w_parent.clone(),
        attention: level.a_upward.clone(),
    };
    let (rows, _) = {
        let parents_view: &NodeStates = parents;
        attention_phase(children, parents_view, &phase, slope, |s, t| {
            boundary_mask(matrix, children, parents_view, s, t)
        })
    };
    for (row, new) in parents.rows.iter_mut().zip(rows) {
        for (dst, v) in row.iter_mut().zip(new.iter()) {
            *dst = factor * v + (1.0 - factor) * *dst;
        }
        tensor::l2_normalize(row);
    }
}

fn downward_pass(
    children: &mut NodeStates,
    parents: &NodeStates,
    level: &LevelParams,
    matrix: &ContainmentMatrix,
    slope: f32,
    factor: f32,
) {
    let phase = PhaseParams {
        w_src: level.w_parent.clone(),
        w_dst: level.w_child.clone(),
        attention: level.a_downward.clone(),
    };
    // Residual: E^k keeps its pre-pass state plus the concatenated heads.
    let (rows, _) = {
        let children_view: &NodeStates = children;
        attention_phase(parents, children_view, &phase, slope, |s, t| {
            boundary_mask(matrix, children_view, parents, t, s)
        })
    };
    for (row, new) in children.rows.iter_mut().zip(rows) {
        for (dst, v) in row.iter_mut().zip(new.iter()) {
            *dst += factor * v;
        }
        tensor::l2_normalize(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Member;
    use crate::config::ShgatConfig;
    use crate::graph::ToolGraph;
    use uuid::Uuid;

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
            ..Default::default()
        };
        ShgatParams::init(&config, 2).unwrap()
    }

    fn snapshot_with_capability() -> (crate::graph::GraphSnapshot, Uuid) {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("fs:read", "r", unit(0)).unwrap();
        g.upsert_tool("fs:write", "w", unit(1)).unwrap();
        g.upsert_tool("net:get", "g", unit(2)).unwrap();
        let cap = Uuid::new_v4();
        let mut record = crate::graph::tests::make_capability(
            cap,
            vec![
                Member::Tool("fs:read".to_string()),
                Member::Tool("fs:write".to_string()),
            ],
        );
        record.intent_embedding = unit(3);
        g.upsert_capability(record).unwrap();
        let snapshot = g.publish();
        (
            std::sync::Arc::try_unwrap(snapshot).unwrap_or_else(|arc| (*arc).clone()),
            cap,
        )
    }

    #[test]
    fn test_enrichment_noop_without_cooccurrence() {
        let states = NodeStates::new(vec![
            ("a".to_string(), unit(0)),
            ("b".to_string(), unit(1)),
        ]);
        let out = enrich_tools(&states, &CoOccurrenceMatrix::default(), 0.3, 1.0, true);
        assert_eq!(out.rows, states.rows);
    }

    #[test]
    fn test_enrichment_pulls_cooccurring_tools_together() {
        let states = NodeStates::new(vec![
            ("a".to_string(), unit(0)),
            ("b".to_string(), unit(1)),
        ]);
        let co = CoOccurrenceMatrix::from_pairs(&[(("a".to_string(), "b".to_string()), 5)]);
        let out = enrich_tools(&states, &co, 0.3, 1.0, true);
        let sim_after = cosine(&out.rows[0], &out.rows[1]);
        let sim_before = cosine(&states.rows[0], &states.rows[1]);
        assert!(sim_after > sim_before);
        // Rows stay unit-norm.
        assert!((tensor::norm(&out.rows[0]) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_propagation_shapes_and_attention() {
        let (snapshot, cap) = snapshot_with_capability();
        let params = small_params();
        let propagator = Propagator {
            params: &params,
            snapshot: &snapshot,
        };
        let tools = NodeStates::new(
            snapshot
                .tools
                .iter()
                .map(|t| (t.id.clone(), t.embedding.clone()))
                .collect(),
        );
        let out = propagator.propagate(tools);
        assert_eq!(out.tools.rows.len(), 3);
        for row in &out.tools.rows {
            assert_eq!(row.len(), EMBEDDING_DIM);
        }
        assert_eq!(out.capability_levels.len(), 1);
        // The capability attended over exactly its two member tools.
        let attention = out.tool_attention.get(&cap.to_string()).unwrap();
        assert_eq!(attention.len(), 2);
        let sum: f32 = attention.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let attended: Vec<&str> = attention.iter().map(|(t, _)| t.as_str()).collect();
        assert!(attended.contains(&"fs:read"));
        assert!(!attended.contains(&"net:get"));
    }

    #[test]
    fn test_propagation_without_capabilities_keeps_tools() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("fs:read", "r", unit(0)).unwrap();
        let snapshot = (*g.publish()).clone();
        let params = small_params();
        let propagator = Propagator {
            params: &params,
            snapshot: &snapshot,
        };
        let tools = NodeStates::new(vec![("fs:read".to_string(), unit(0))]);
        let out = propagator.propagate(tools.clone());
        assert_eq!(out.tools.rows, tools.rows);
        assert!(out.tool_attention.is_empty());
    }
}
