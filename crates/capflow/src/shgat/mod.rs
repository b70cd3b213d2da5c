// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SHGAT: the superhypergraph attention scorer.
//!
//! The model owns its parameters exclusively; the training worker receives
//! a deep copy and commits a new copy, swapped in atomically. Scoring
//! requests capture the parameter snapshot for their whole lifetime, so a
//! hot-reload landing mid-request never tears a forward pass.
//!
//! Training states: `Cold` (too few traces) -> `Batch` (full epochs) ->
//! `Live` (one epoch per replay batch) -> `Saved` (params hot-loaded from
//! storage). Transitions are driven by the training worker and the sync
//! controller.

mod attention;
mod features;
mod params;
mod scoring;
mod train;

pub use attention::{enrich_tools, CoOccurrenceMatrix, NodeStates, PropagatedStates, Propagator};
pub use features::{RequestContext, TraceFeatures, TraceStats, TRACE_STAT_NAMES};
pub use params::{FusionMlp, LayerParams, LevelParams, PhaseParams, ShgatParams};
pub use scoring::{
    feature_contributions, forward, gate_capability_score, legacy_breakdown,
    reliability_multiplier, sort_scored_capabilities, sort_scored_tools, Forward,
    FeatureContribution, LegacyBreakdown, ScoredCapability, ScoredTool,
};
pub use train::{
    mine_hard_negatives, TrainExample, TrainReport, Trainer, TrainingCandidate,
};

use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::capability::ToolId;
use crate::config::{CapflowConfig, ShgatConfig};
use crate::error::Result;
use crate::graph::{GraphSnapshot, SnapshotCell};
use crate::replay::{IntentStats, TraceStore};
use crate::spectral::SpectralModel;
use crate::tensor::cosine;

/// Training lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    /// Not enough traces to train; scoring runs on initialization params.
    Cold,
    /// Full-epoch batch training has produced the serving params.
    Batch,
    /// Live per-replay-batch refinement is active.
    Live,
    /// Params were hot-loaded from the parameter store.
    Saved,
}

/// Everything a scoring request needs beyond the intent.
pub struct ScoringInputs<'a> {
    pub snapshot: &'a GraphSnapshot,
    pub spectral: Option<&'a SpectralModel>,
    pub traces: Option<&'a TraceStore>,
    pub co_occurrence: &'a CoOccurrenceMatrix,
}

/// The serving model.
pub struct ShgatModel {
    config: ShgatConfig,
    confidence: crate::config::ConfidenceConfig,
    params: SnapshotCell<ShgatParams>,
    state: RwLock<TrainingState>,
    unstable_forwards: AtomicU64,
}

impl ShgatModel {
    /// Initialize a cold model.
    ///
    /// # Errors
    /// Fails when the head count divides neither the embedding nor hidden
    /// dimension; this is an init-time configuration error.
    pub fn new(config: &CapflowConfig, max_level: usize) -> Result<Self> {
        let params = ShgatParams::init(&config.shgat, max_level)?;
        Ok(Self {
            config: config.shgat.clone(),
            confidence: config.confidence.clone(),
            params: SnapshotCell::new(Arc::new(params)),
            state: RwLock::new(TrainingState::Cold),
            unstable_forwards: AtomicU64::new(0),
        })
    }

    /// Current training state.
    #[must_use]
    pub fn state(&self) -> TrainingState {
        *self.state.read()
    }

    /// Advance the training state machine.
    pub fn set_state(&self, state: TrainingState) {
        *self.state.write() = state;
    }

    /// Number of forward passes that went non-finite since startup.
    #[must_use]
    pub fn unstable_forward_count(&self) -> u64 {
        self.unstable_forwards.load(Ordering::Relaxed)
    }

    /// Capture the current parameter snapshot (deep-copied by the caller if
    /// it intends to train).
    #[must_use]
    pub fn params(&self) -> Arc<ShgatParams> {
        self.params.load()
    }

    /// Commit new parameters, swapping the serving pointer. Shapes are
    /// validated first; on mismatch the previous parameters stay in place.
    pub fn install_params(&self, params: ShgatParams, state: TrainingState) -> Result<()> {
        params.validate_shapes()?;
        self.params.store(Arc::new(params));
        self.set_state(state);
        info!(?state, "installed new SHGAT params");
        Ok(())
    }

    /// Import a params blob from storage. On any shape mismatch the blob is
    /// rejected and the previous parameters retained.
    pub fn import_params_blob(&self, blob: &str) -> Result<()> {
        let params = ShgatParams::import(blob)?;
        self.install_params(params, TrainingState::Saved)
    }

    /// Export the serving params as a blob.
    pub fn export_params_blob(&self) -> Result<String> {
        self.params.load().export()
    }

    /// React to hierarchy-depth changes from the sync controller: extend
    /// the multi-level parameter ladder without disturbing trained tensors.
    pub fn notify_structure_changed(&self, max_level: usize) {
        let current = self.params.load();
        if current.level_params.len() >= max_level {
            return;
        }
        let mut next = (*current).clone();
        next.ensure_levels(max_level);
        self.params.store(Arc::new(next));
        info!(max_level, "extended multi-level attention parameters");
    }

    /// Score every tool in the snapshot against an intent.
    ///
    /// Results are sorted descending with ascending-id tie-break. Scores
    /// are in [0, 1]; tools are not reliability-gated on this path.
    #[must_use]
    pub fn score_all_tools(
        &self,
        request: &RequestContext,
        inputs: &ScoringInputs<'_>,
    ) -> Vec<ScoredTool> {
        let params = self.params.load();
        let candidate_states = self.candidate_tool_states(&params, inputs);
        let intent_stats = self.intent_stats(request, inputs);

        let mut results: Vec<ScoredTool> = inputs
            .snapshot
            .tools
            .par_iter()
            .map(|tool| {
                let embedding = Self::candidate_row(&candidate_states, tool);
                let target = inputs
                    .traces
                    .map(|t| t.target_stats(&tool.id))
                    .unwrap_or_default();
                let boost = inputs
                    .spectral
                    .map(|s| {
                        if s.cluster_of(&tool.id).is_some() {
                            s.active_cluster(&request.context_tools)
                                .filter(|(active, _)| s.cluster_of(&tool.id) == Some(*active))
                                .map(|_| 0.5)
                                .unwrap_or(0.0)
                        } else {
                            0.0
                        }
                    })
                    .unwrap_or(0.0);
                let features = TraceFeatures::for_tool(
                    request,
                    tool,
                    embedding,
                    &target,
                    &intent_stats,
                    boost,
                    tool.features.heat,
                    inputs.snapshot.degree(&tool.id),
                );
                let out = forward(&params, &features, None);
                if out.is_unstable() {
                    self.unstable_forwards.fetch_add(1, Ordering::Relaxed);
                    warn!(tool = %tool.id, "unstable forward; scoring 0");
                    return ScoredTool {
                        tool_id: tool.id.clone(),
                        score: 0.0,
                        head_scores: vec![0.0; self.config.num_heads],
                        unstable: true,
                    };
                }
                ScoredTool {
                    tool_id: tool.id.clone(),
                    score: out.y.clamp(0.0, 1.0),
                    head_scores: out.head_scores,
                    unstable: false,
                }
            })
            .collect();
        sort_scored_tools(&mut results);
        results
    }

    /// Score every capability in the snapshot against an intent.
    ///
    /// Capability scores are reliability-gated and clipped to [0, 0.95];
    /// each result carries head scores, per-feature contributions, and the
    /// V->E attention over the capability's member tools.
    #[must_use]
    pub fn score_all_capabilities(
        &self,
        request: &RequestContext,
        inputs: &ScoringInputs<'_>,
    ) -> Vec<ScoredCapability> {
        let params = self.params.load();
        let intent_stats = self.intent_stats(request, inputs);

        // Propagation supplies both the interpretability attention rows and
        // (optionally) the candidate embeddings.
        let tool_states = self.enriched_tool_states(&params, inputs);
        let propagator = Propagator {
            params: params.as_ref(),
            snapshot: inputs.snapshot,
        };
        let propagated = propagator.propagate(tool_states);

        let mut results: Vec<ScoredCapability> = inputs
            .snapshot
            .capabilities
            .par_iter()
            .map(|capability| {
                let key = capability.id.to_string();
                let propagated_row = propagated
                    .capability_levels
                    .get(capability.hierarchy_level)
                    .and_then(|level| level.row(&key));
                let embedding = if self.config.use_propagated_embeddings {
                    propagated_row.unwrap_or(capability.intent_embedding.as_slice())
                } else {
                    capability.intent_embedding.as_slice()
                };
                let boost = inputs
                    .spectral
                    .map(|s| s.community_boost(&key, &request.context_tools))
                    .unwrap_or(0.0);
                let max_level = inputs.snapshot.levels.values().copied().max().unwrap_or(0);
                let features = TraceFeatures::for_capability(
                    request,
                    capability,
                    embedding,
                    &intent_stats,
                    boost,
                    capability.features.heat,
                    inputs.snapshot.degree(&key),
                    max_level,
                );
                let out = forward(&params, &features, None);
                if out.is_unstable() {
                    self.unstable_forwards.fetch_add(1, Ordering::Relaxed);
                    warn!(capability = %key, "unstable forward; scoring 0");
                    return ScoredCapability {
                        capability_id: capability.id,
                        score: 0.0,
                        head_scores: vec![0.0; self.config.num_heads],
                        feature_contributions: Vec::new(),
                        tool_attention: Vec::new(),
                        reliability_multiplier: 1.0,
                        legacy_breakdown: LegacyBreakdown {
                            semantic: 0.0,
                            structure: 0.0,
                            temporal: 0.0,
                        },
                        unstable: true,
                    };
                }
                let (score, multiplier) =
                    gate_capability_score(out.y, capability.success_rate(), &self.confidence);
                let semantic = cosine(&request.intent_embedding, &capability.intent_embedding);
                ScoredCapability {
                    capability_id: capability.id,
                    score,
                    head_scores: out.head_scores,
                    feature_contributions: feature_contributions(&params, &features.stats),
                    tool_attention: propagated
                        .tool_attention
                        .get(&key)
                        .cloned()
                        .unwrap_or_default(),
                    reliability_multiplier: multiplier,
                    legacy_breakdown: legacy_breakdown(&params, semantic, &features.stats),
                    unstable: false,
                }
            })
            .collect();
        sort_scored_capabilities(&mut results);
        results
    }

    /// Score a single known target; unknown ids score 0.
    #[must_use]
    pub fn score_tool(&self, tool_id: &str, request: &RequestContext, inputs: &ScoringInputs<'_>) -> f32 {
        if inputs.snapshot.tool(tool_id).is_none() {
            return 0.0;
        }
        self.score_all_tools(request, inputs)
            .into_iter()
            .find(|t| t.tool_id == tool_id)
            .map(|t| t.score)
            .unwrap_or(0.0)
    }

    fn intent_stats(&self, request: &RequestContext, inputs: &ScoringInputs<'_>) -> IntentStats {
        inputs
            .traces
            .map(|t| t.query_intent_similar(&request.intent_embedding, 10))
            .unwrap_or_default()
    }

    /// Tool states after the optional V->V enrichment.
    fn enriched_tool_states(
        &self,
        params: &ShgatParams,
        inputs: &ScoringInputs<'_>,
    ) -> NodeStates {
        let base = NodeStates::new(
            inputs
                .snapshot
                .tools
                .iter()
                .map(|t| (t.id.clone(), t.embedding.clone()))
                .collect(),
        );
        if !params.config.use_attention {
            return base;
        }
        enrich_tools(
            &base,
            inputs.co_occurrence,
            params.config.residual_weight,
            params.config.temperature,
            true,
        )
    }

    /// Candidate tool embeddings for scoring: enriched, and propagated when
    /// the v3 switch is on.
    fn candidate_tool_states(
        &self,
        params: &ShgatParams,
        inputs: &ScoringInputs<'_>,
    ) -> NodeStates {
        let enriched = self.enriched_tool_states(params, inputs);
        if !self.config.use_propagated_embeddings {
            return enriched;
        }
        let propagator = Propagator {
            params,
            snapshot: inputs.snapshot,
        };
        propagator.propagate(enriched).tools
    }

    /// Score candidate embeddings for the tool path, resolving the row a
    /// tool would be scored with (raw, enriched, or propagated).
    fn candidate_row<'a>(states: &'a NodeStates, tool: &'a crate::capability::Tool) -> &'a [f32] {
        states.row(&tool.id).unwrap_or(tool.embedding.as_slice())
    }

    /// Keep only the most recent `max_context_length` context tools.
    #[must_use]
    pub fn truncate_context(&self, context: &[ToolId]) -> Vec<ToolId> {
        let keep = self.config.max_context_length;
        if context.len() <= keep {
            context.to_vec()
        } else {
            context[context.len() - keep..].to_vec()
        }
    }
}
