// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-target feature assembly.
//!
//! Every candidate scored by the attention heads sees the same feature
//! layout: three embedding blocks (intent, candidate, mean-pooled recent
//! context) plus seventeen scalar trace statistics. The scalar block is
//! where graph structure, reliability history, and replay-derived intent
//! statistics enter the scorer.

use crate::capability::{Capability, GraphFeatures, Tool, ToolId};
use crate::constants::{EMBEDDING_DIM, TRACE_STATS_DIM};
use crate::replay::{IntentStats, TargetStats};
use crate::tensor::mean_pool;

/// Scalar statistics block, ordered; the layout is part of the params-blob
/// contract (feature_weights indexes into it).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceStats {
    pub success_rate: f32,
    pub usage: f32,
    pub avg_duration: f32,
    pub page_rank: f32,
    pub community_boost: f32,
    pub adamic_adar: f32,
    pub co_occurrence: f32,
    pub recency: f32,
    pub heat: f32,
    pub intent_success: f32,
    pub intent_similarity: f32,
    pub intent_samples: f32,
    pub hierarchy_level: f32,
    pub member_count: f32,
    pub context_overlap: f32,
    pub degree: f32,
    pub cold_start: f32,
}

/// Human-readable names for the stats block, index-aligned with
/// [`TraceStats::to_array`]. Used by feature-contribution output.
pub const TRACE_STAT_NAMES: [&str; TRACE_STATS_DIM] = [
    "success_rate",
    "usage",
    "avg_duration",
    "page_rank",
    "community_boost",
    "adamic_adar",
    "co_occurrence",
    "recency",
    "heat",
    "intent_success",
    "intent_similarity",
    "intent_samples",
    "hierarchy_level",
    "member_count",
    "context_overlap",
    "degree",
    "cold_start",
];

impl TraceStats {
    /// Flatten into the fixed-order scalar array.
    #[must_use]
    pub fn to_array(&self) -> [f32; TRACE_STATS_DIM] {
        [
            self.success_rate,
            self.usage,
            self.avg_duration,
            self.page_rank,
            self.community_boost,
            self.adamic_adar,
            self.co_occurrence,
            self.recency,
            self.heat,
            self.intent_success,
            self.intent_similarity,
            self.intent_samples,
            self.hierarchy_level,
            self.member_count,
            self.context_overlap,
            self.degree,
            self.cold_start,
        ]
    }
}

/// Compressors keeping unbounded counters inside [0, 1].
fn squash_count(count: u64) -> f32 {
    let c = count as f32;
    c / (c + 10.0)
}

fn squash_duration(ms: f64) -> f32 {
    let m = ms as f32;
    m / (m + 60_000.0)
}

/// Inputs shared by every candidate of one scoring request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// L2-normalized intent embedding.
    pub intent_embedding: Vec<f32>,
    /// Context tool ids, most recent last, already truncated to the
    /// configured window.
    pub context_tools: Vec<ToolId>,
    /// Mean-pooled embedding of the context tools (zero vector when the
    /// context is empty).
    pub context_embedding: Vec<f32>,
}

impl RequestContext {
    /// Build from the intent embedding and resolved context tools.
    #[must_use]
    pub fn new(intent_embedding: Vec<f32>, context: &[(&ToolId, &[f32])]) -> Self {
        let rows: Vec<&[f32]> = context.iter().map(|(_, e)| *e).collect();
        Self {
            intent_embedding,
            context_tools: context.iter().map(|(id, _)| (*id).clone()).collect(),
            context_embedding: mean_pool(&rows, EMBEDDING_DIM),
        }
    }
}

/// The assembled per-target feature vector.
#[derive(Debug, Clone)]
pub struct TraceFeatures {
    /// `[intent || candidate || context]`, `3 * EMBEDDING_DIM` long.
    pub embedding_block: Vec<f32>,
    /// Seventeen scalars.
    pub stats: [f32; TRACE_STATS_DIM],
}

impl TraceFeatures {
    /// Assemble features for a tool candidate.
    #[must_use]
    pub fn for_tool(
        request: &RequestContext,
        tool: &Tool,
        candidate_embedding: &[f32],
        target: &TargetStats,
        intent: &IntentStats,
        community_boost: f64,
        heat: f64,
        degree: usize,
    ) -> Self {
        let stats = TraceStats {
            success_rate: target.success_rate() as f32,
            usage: squash_count(target.usage_count),
            avg_duration: squash_duration(if target.usage_count == 0 {
                0.0
            } else {
                target.total_duration_ms as f64 / target.usage_count as f64
            }),
            community_boost: community_boost as f32,
            heat: heat as f32,
            intent_success: intent.success_rate as f32,
            intent_similarity: intent.mean_similarity as f32,
            intent_samples: squash_count(intent.sample_count as u64),
            hierarchy_level: 0.0,
            member_count: 0.0,
            context_overlap: context_overlap(&request.context_tools, std::slice::from_ref(&tool.id)),
            degree: squash_count(degree as u64),
            cold_start: if target.usage_count == 0 { 1.0 } else { 0.0 },
            ..from_graph_features(&tool.features)
        };
        Self::assemble(request, candidate_embedding, stats)
    }

    /// Assemble features for a capability candidate.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn for_capability(
        request: &RequestContext,
        capability: &Capability,
        candidate_embedding: &[f32],
        intent: &IntentStats,
        community_boost: f64,
        heat: f64,
        degree: usize,
        max_level: usize,
    ) -> Self {
        let tool_ids: Vec<ToolId> = capability.tool_members().into_iter().cloned().collect();
        let stats = TraceStats {
            success_rate: capability.success_rate() as f32,
            usage: squash_count(capability.usage_count),
            avg_duration: squash_duration(capability.avg_duration_ms),
            community_boost: community_boost as f32,
            heat: heat as f32,
            intent_success: intent.success_rate as f32,
            intent_similarity: intent.mean_similarity as f32,
            intent_samples: squash_count(intent.sample_count as u64),
            hierarchy_level: if max_level == 0 {
                0.0
            } else {
                capability.hierarchy_level as f32 / max_level as f32
            },
            member_count: squash_count(capability.members.len() as u64),
            context_overlap: context_overlap(&request.context_tools, &tool_ids),
            degree: squash_count(degree as u64),
            cold_start: if capability.usage_count == 0 { 1.0 } else { 0.0 },
            ..from_graph_features(&capability.features)
        };
        Self::assemble(request, candidate_embedding, stats)
    }

    fn assemble(request: &RequestContext, candidate_embedding: &[f32], stats: TraceStats) -> Self {
        let mut embedding_block = Vec::with_capacity(3 * EMBEDDING_DIM);
        extend_padded(&mut embedding_block, &request.intent_embedding);
        extend_padded(&mut embedding_block, candidate_embedding);
        extend_padded(&mut embedding_block, &request.context_embedding);
        Self {
            embedding_block,
            stats: stats.to_array(),
        }
    }
}

fn from_graph_features(features: &GraphFeatures) -> TraceStats {
    TraceStats {
        page_rank: features.page_rank as f32,
        adamic_adar: (features.adamic_adar / (features.adamic_adar + 1.0)) as f32,
        co_occurrence: (features.co_occurrence / (features.co_occurrence + 10.0)) as f32,
        recency: features.recency as f32,
        ..Default::default()
    }
}

/// Fraction of the candidate's tools already present in the context.
fn context_overlap(context: &[ToolId], candidate_tools: &[ToolId]) -> f32 {
    if candidate_tools.is_empty() {
        return 0.0;
    }
    let hits = candidate_tools
        .iter()
        .filter(|t| context.contains(t))
        .count();
    hits as f32 / candidate_tools.len() as f32
}

fn extend_padded(block: &mut Vec<f32>, v: &[f32]) {
    if v.len() >= EMBEDDING_DIM {
        block.extend_from_slice(&v[..EMBEDDING_DIM]);
    } else {
        block.extend_from_slice(v);
        block.extend(std::iter::repeat(0.0).take(EMBEDDING_DIM - v.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilitySource, Fqdn, Member};
    use chrono::Utc;
    use uuid::Uuid;

    fn request() -> RequestContext {
        let mut intent = vec![0.0; EMBEDDING_DIM];
        intent[0] = 1.0;
        RequestContext {
            intent_embedding: intent,
            context_tools: vec!["fs:read".to_string()],
            context_embedding: vec![0.0; EMBEDDING_DIM],
        }
    }

    fn tool() -> Tool {
        let mut e = vec![0.0; EMBEDDING_DIM];
        e[1] = 1.0;
        Tool {
            id: "fs:read".to_string(),
            description: "read".to_string(),
            embedding: e,
            features: GraphFeatures {
                page_rank: 0.4,
                recency: 1.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_feature_vector_dimensions() {
        let t = tool();
        let f = TraceFeatures::for_tool(
            &request(),
            &t,
            &t.embedding,
            &TargetStats::default(),
            &IntentStats::default(),
            0.0,
            0.0,
            3,
        );
        assert_eq!(f.embedding_block.len(), 3 * EMBEDDING_DIM);
        assert_eq!(f.stats.len(), TRACE_STATS_DIM);
    }

    #[test]
    fn test_stats_carry_graph_features() {
        let t = tool();
        let f = TraceFeatures::for_tool(
            &request(),
            &t,
            &t.embedding,
            &TargetStats::default(),
            &IntentStats::default(),
            0.25,
            0.1,
            3,
        );
        // page_rank is index 3, community_boost 4, recency 7 per the layout.
        assert!((f.stats[3] - 0.4).abs() < 1e-6);
        assert!((f.stats[4] - 0.25).abs() < 1e-6);
        assert!((f.stats[7] - 1.0).abs() < 1e-6);
        // Cold start flag set with no usage.
        assert_eq!(f.stats[16], 1.0);
    }

    #[test]
    fn test_context_overlap_for_tool_in_context() {
        let t = tool();
        let f = TraceFeatures::for_tool(
            &request(),
            &t,
            &t.embedding,
            &TargetStats::default(),
            &IntentStats::default(),
            0.0,
            0.0,
            0,
        );
        assert_eq!(f.stats[14], 1.0);
    }

    #[test]
    fn test_capability_stats() {
        let cap = Capability {
            id: Uuid::new_v4(),
            fqdn: Fqdn::new("a", "b", "c", "d", "e").unwrap(),
            members: vec![
                Member::Tool("fs:read".to_string()),
                Member::Tool("net:get".to_string()),
            ],
            hierarchy_level: 1,
            intent_embedding: vec![0.0; EMBEDDING_DIM],
            success_count: 19,
            usage_count: 20,
            avg_duration_ms: 1200.0,
            source: CapabilitySource::Emergent,
            code_snippet: None,
            structure: None,
            features: GraphFeatures::default(),
            updated_at: Utc::now(),
        };
        let f = TraceFeatures::for_capability(
            &request(),
            &cap,
            &cap.intent_embedding,
            &IntentStats::default(),
            0.5,
            0.0,
            4,
            2,
        );
        assert!((f.stats[0] - 0.95).abs() < 1e-6);
        assert!((f.stats[12] - 0.5).abs() < 1e-6);
        // One of two member tools in context.
        assert!((f.stats[14] - 0.5).abs() < 1e-6);
        assert_eq!(f.stats[16], 0.0);
    }

    #[test]
    fn test_short_candidate_embedding_padded() {
        let t = tool();
        let f = TraceFeatures::for_tool(
            &request(),
            &t,
            &[1.0, 2.0],
            &TargetStats::default(),
            &IntentStats::default(),
            0.0,
            0.0,
            0,
        );
        assert_eq!(f.embedding_block.len(), 3 * EMBEDDING_DIM);
        assert_eq!(f.embedding_block[EMBEDDING_DIM], 1.0);
        assert_eq!(f.embedding_block[EMBEDDING_DIM + 2], 0.0);
    }
}
