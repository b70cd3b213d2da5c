// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Discovery orchestrator.
//!
//! Composes the attention scorer, the hybrid semantic+graph fabric, the
//! spectral manager, and the local-alpha calculator behind a degradation
//! chain: SHGAT -> hybrid -> semantic-only -> keyword. Each stage either
//! produces a ranked list or reports why it could not, and the orchestrator
//! short-circuits on the first non-empty success. Recoverable conditions
//! never surface to the caller; the reason lands in the decision log
//! instead.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alpha::{AlphaCalculator, AlphaSignals};
use crate::capability::{Capability, CapabilityId, ToolId};
use crate::config::CapflowConfig;
use crate::constants::KEYWORD_FALLBACK_SCORE;
use crate::embeddings::{normalize_embedding, Embedder};
use crate::error::{CapflowError, Result};
use crate::graph::{GraphSnapshot, SnapshotCell};
use crate::index::VectorIndex;
use crate::rationale::{hybrid_confidence, Confidence, ConfidenceSignals};
use crate::replay::TraceStore;
use crate::shgat::{
    reliability_multiplier, CoOccurrenceMatrix, RequestContext, ScoringInputs, ShgatModel,
};
use crate::spectral::{CapabilityNode, SpectralInput, SpectralManager, SpectralModel};
use crate::storage::{CapabilityRegistry, ToolRepository};
use crate::telemetry::{DecisionLog, EngineMetrics};
use crate::tensor::{cosine, mean_pool};
use crate::trace::{
    DecisionRecord, DiscoveryMode, RankingAlgorithm, TargetType, Verdict,
};

/// Why a stage could not produce results; recorded, never surfaced.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    ModelUnavailable,
    EmbedderUnavailable,
    IndexUnavailable,
    EmptyResult,
    Failed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::ModelUnavailable => write!(f, "model_unavailable"),
            FallbackReason::EmbedderUnavailable => write!(f, "embedder_unavailable"),
            FallbackReason::IndexUnavailable => write!(f, "index_unavailable"),
            FallbackReason::EmptyResult => write!(f, "empty_result"),
            FallbackReason::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A ranked tool result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDiscovery {
    pub tool_id: ToolId,
    pub score: f32,
    pub algorithm: RankingAlgorithm,
    pub head_scores: Option<Vec<f32>>,
    pub semantic_score: Option<f32>,
    pub graph_score: Option<f64>,
    pub alpha: Option<f64>,
    pub server_id: Option<String>,
    pub input_schema: Option<JsonValue>,
    /// Up to two in- and two out-neighbors, hybrid path only.
    pub related_tools: Vec<ToolId>,
}

/// A nested capability referenced by a meta-capability's code.
#[derive(Debug, Clone, PartialEq)]
pub struct CalledCapability {
    pub id: CapabilityId,
    pub call_name: String,
    pub input_schema: Option<JsonValue>,
}

/// A ranked capability result.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDiscovery {
    pub capability_id: CapabilityId,
    pub score: f32,
    pub algorithm: RankingAlgorithm,
    pub semantic_score: Option<f32>,
    pub call_name: Option<String>,
    pub code_snippet: Option<String>,
    /// Inner capabilities for meta-capabilities, in discovery order.
    pub called_capabilities: Vec<CalledCapability>,
    pub confidence: Option<Confidence>,
}

/// The orchestrator. Construct with [`DiscoveryOrchestrator::builder`].
pub struct DiscoveryOrchestrator {
    config: CapflowConfig,
    snapshot: Arc<SnapshotCell<GraphSnapshot>>,
    co_occurrence: Arc<SnapshotCell<CoOccurrenceMatrix>>,
    index: Arc<VectorIndex>,
    spectral: Arc<SpectralManager>,
    alpha: AlphaCalculator,
    traces: Arc<TraceStore>,
    model: Option<Arc<ShgatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    tool_repo: Option<Arc<dyn ToolRepository>>,
    registry: Option<Arc<dyn CapabilityRegistry>>,
    decision_log: Option<DecisionLog>,
    metrics: Arc<EngineMetrics>,
}

/// Builder for [`DiscoveryOrchestrator`].
pub struct DiscoveryBuilder {
    config: CapflowConfig,
    snapshot: Arc<SnapshotCell<GraphSnapshot>>,
    co_occurrence: Arc<SnapshotCell<CoOccurrenceMatrix>>,
    index: Arc<VectorIndex>,
    spectral: Arc<SpectralManager>,
    traces: Arc<TraceStore>,
    model: Option<Arc<ShgatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    tool_repo: Option<Arc<dyn ToolRepository>>,
    registry: Option<Arc<dyn CapabilityRegistry>>,
    decision_log: Option<DecisionLog>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl DiscoveryOrchestrator {
    /// Start a builder over the shared read surfaces.
    #[must_use]
    pub fn builder(
        config: CapflowConfig,
        snapshot: Arc<SnapshotCell<GraphSnapshot>>,
        co_occurrence: Arc<SnapshotCell<CoOccurrenceMatrix>>,
        index: Arc<VectorIndex>,
        spectral: Arc<SpectralManager>,
        traces: Arc<TraceStore>,
    ) -> DiscoveryBuilder {
        DiscoveryBuilder {
            config,
            snapshot,
            co_occurrence,
            index,
            spectral,
            traces,
            model: None,
            embedder: None,
            tool_repo: None,
            registry: None,
            decision_log: None,
            metrics: None,
        }
    }

    /// Discover tools for an intent.
    ///
    /// # Errors
    /// `MissingIntent` on empty input; `NoSearchEngine` when every stage is
    /// structurally unavailable. Recoverable stage failures degrade
    /// silently.
    pub async fn discover_tools(
        &self,
        intent: &str,
        limit: usize,
        min_score: f32,
        context: &[ToolId],
        mode: DiscoveryMode,
    ) -> Result<Vec<ToolDiscovery>> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(CapflowError::MissingIntent);
        }
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();
        let limit = if limit == 0 {
            self.config.discovery.default_limit
        } else {
            limit
        };
        let snapshot = self.snapshot.load();

        if self.model.is_none() && self.embedder.is_none() && snapshot.tools.is_empty() {
            return Err(CapflowError::NoSearchEngine);
        }

        let embedding = self.embed_intent(intent).await;
        let mut results = match self
            .shgat_tools(intent, &embedding, limit, min_score, context, mode, &snapshot, correlation_id)
            .await
        {
            Ok(results) => results,
            Err(reason) => {
                debug!(%reason, "SHGAT tool stage unavailable, trying hybrid");
                match self
                    .hybrid_tools(intent, &embedding, limit, min_score, context, mode, &snapshot, correlation_id)
                    .await
                {
                    Ok(results) => results,
                    Err(reason) => {
                        debug!(%reason, "hybrid stage unavailable, trying semantic");
                        match self.semantic_tools(intent, &embedding, limit, min_score, mode, correlation_id) {
                            Ok(results) => results,
                            Err(reason) => {
                                debug!(%reason, "semantic stage unavailable, trying keyword");
                                self.keyword_tools(intent, limit, mode, &snapshot, correlation_id)
                            }
                        }
                    }
                }
            }
        };

        if let Some(repo) = &self.tool_repo {
            let ids: Vec<ToolId> = results.iter().map(|r| r.tool_id.clone()).collect();
            if let Ok(metas) = repo.find_by_ids(&ids).await {
                for result in &mut results {
                    if let Some(meta) = metas.iter().find(|m| m.id == result.tool_id) {
                        result.server_id = Some(meta.server_id.clone());
                        result.input_schema = meta.input_schema.clone();
                    }
                }
            }
        }

        self.metrics
            .query_latency_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics
            .cache_hit_rate
            .set(self.spectral.cache_stats().hit_rate());
        Ok(results)
    }

    /// Discover capabilities for an intent.
    ///
    /// # Errors
    /// `MissingIntent` on empty input. All other conditions degrade.
    pub async fn discover_capabilities(
        &self,
        intent: &str,
        limit: usize,
        min_score: f32,
        context: &[ToolId],
        mode: DiscoveryMode,
    ) -> Result<Vec<CapabilityDiscovery>> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(CapflowError::MissingIntent);
        }
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();
        let limit = if limit == 0 {
            self.config.discovery.default_limit
        } else {
            limit
        };
        let snapshot = self.snapshot.load();
        let embedding = self.embed_intent(intent).await;

        let ranked = match self
            .shgat_capabilities(intent, &embedding, limit, min_score, context, mode, &snapshot, correlation_id)
            .await
        {
            Ok(results) => results,
            Err(reason) => {
                debug!(%reason, "SHGAT capability stage unavailable, using legacy matcher");
                self.legacy_capabilities(intent, &embedding, limit, min_score, mode, &snapshot, correlation_id)
            }
        };

        let mut results = Vec::with_capacity(ranked.len());
        for mut item in ranked {
            if let Some(capability) = snapshot.capability(&item.capability_id) {
                item.code_snippet = capability.code_snippet.clone();
                item.call_name = Some(self.resolve_call_name(capability).await);
                item.called_capabilities = self
                    .resolve_called_capabilities(capability, &snapshot)
                    .await;
            }
            results.push(item);
        }

        self.metrics
            .query_latency_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        Ok(results)
    }

    async fn embed_intent(&self, intent: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.encode(intent).await {
            Ok(raw) => match normalize_embedding(raw, embedder.dimension()) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "embedder returned a bad vector");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "intent embedding failed");
                None
            }
        }
    }

    fn spectral_model(&self, snapshot: &GraphSnapshot) -> Option<Arc<SpectralModel>> {
        if snapshot.tools.is_empty() && snapshot.capabilities.is_empty() {
            return None;
        }
        let input = SpectralInput {
            tools: snapshot.tools.iter().map(|t| t.id.clone()).collect(),
            capabilities: snapshot
                .capabilities
                .iter()
                .map(|c| CapabilityNode {
                    id: c.id.to_string(),
                    tools: c.tool_members().into_iter().cloned().collect(),
                })
                .collect(),
            cap_edges: snapshot.capability_edges(self.config.graph.enable_alternative_edges),
        };
        Some(self.spectral.model_for(&input))
    }

    fn request_context(
        &self,
        embedding: &[f32],
        context: &[ToolId],
        snapshot: &GraphSnapshot,
    ) -> RequestContext {
        let truncated: Vec<ToolId> = match &self.model {
            Some(model) => model.truncate_context(context),
            None => context.to_vec(),
        };
        let resolved: Vec<(&ToolId, &[f32])> = truncated
            .iter()
            .filter_map(|id| {
                snapshot
                    .tool(id)
                    .map(|t| (id, t.embedding.as_slice()))
            })
            .collect();
        RequestContext::new(embedding.to_vec(), &resolved)
    }

    #[allow(clippy::too_many_arguments)]
    async fn shgat_tools(
        &self,
        intent: &str,
        embedding: &Option<Vec<f32>>,
        limit: usize,
        min_score: f32,
        context: &[ToolId],
        mode: DiscoveryMode,
        snapshot: &GraphSnapshot,
        correlation_id: Uuid,
    ) -> std::result::Result<Vec<ToolDiscovery>, FallbackReason> {
        let model = self.model.as_ref().ok_or(FallbackReason::ModelUnavailable)?;
        let embedding = embedding.as_ref().ok_or(FallbackReason::EmbedderUnavailable)?;
        if snapshot.tools.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }

        let request = self.request_context(embedding, context, snapshot);
        let spectral = self.spectral_model(snapshot);
        let co_occurrence = self.co_occurrence.load();
        let inputs = ScoringInputs {
            snapshot,
            spectral: spectral.as_deref(),
            traces: Some(self.traces.as_ref()),
            co_occurrence: co_occurrence.as_ref(),
        };
        let scored = model.score_all_tools(&request, &inputs);
        let unstable = scored.iter().filter(|s| s.unstable).count();
        if unstable > 0 {
            self.metrics.unstable_forwards.inc_by(unstable as u64);
        }

        let mut out = Vec::new();
        for item in scored {
            let accepted = item.score >= min_score && out.len() < limit;
            self.log_decision(
                RankingAlgorithm::Shgat,
                mode,
                TargetType::Tool,
                &item.tool_id,
                intent,
                serde_json::json!({ "head_scores": item.head_scores, "unstable": item.unstable }),
                item.score,
                min_score,
                accepted,
                correlation_id,
            );
            if accepted {
                out.push(ToolDiscovery {
                    tool_id: item.tool_id,
                    score: item.score,
                    algorithm: RankingAlgorithm::Shgat,
                    head_scores: Some(item.head_scores),
                    semantic_score: None,
                    graph_score: None,
                    alpha: None,
                    server_id: None,
                    input_schema: None,
                    related_tools: Vec::new(),
                });
            }
        }
        if out.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn hybrid_tools(
        &self,
        intent: &str,
        embedding: &Option<Vec<f32>>,
        limit: usize,
        min_score: f32,
        context: &[ToolId],
        mode: DiscoveryMode,
        snapshot: &GraphSnapshot,
        correlation_id: Uuid,
    ) -> std::result::Result<Vec<ToolDiscovery>, FallbackReason> {
        let embedding = embedding.as_ref().ok_or(FallbackReason::EmbedderUnavailable)?;
        if self.index.tool_count() == 0 {
            return Err(FallbackReason::IndexUnavailable);
        }

        // Expansion factor grows with graph density so graph re-ranking has
        // headroom to reorder the semantic shortlist.
        let density = snapshot.density();
        let (low, high) = self.config.discovery.density_thresholds;
        let (sparse, medium, dense) = self.config.discovery.expansion_factors;
        let expansion = if density < low {
            sparse
        } else if density < high {
            medium
        } else {
            dense
        };
        let fetch = ((limit as f64 * expansion).ceil() as usize).max(limit);
        let hits = self.index.search_tools(embedding, fetch, -1.0);
        if hits.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }

        let spectral = self.spectral_model(snapshot);
        let context_rows: Vec<&[f32]> = context
            .iter()
            .filter_map(|id| snapshot.tool(id).map(|t| t.embedding.as_slice()))
            .collect();
        let context_embedding = mean_pool(&context_rows, embedding.len());

        let mut scored: Vec<ToolDiscovery> = Vec::with_capacity(hits.len());
        for hit in hits {
            let graph_score = snapshot.graph_relatedness(&hit.id, context);
            let stats = self.traces.target_stats(&hit.id);
            let signals = AlphaSignals {
                target: hit.id.as_str(),
                semantic: snapshot.tool(&hit.id).map(|t| t.embedding.as_slice()),
                context_semantic: Some(&context_embedding),
                context_tools: context,
                usage_count: stats.usage_count,
                success_count: stats.success_count,
            };
            let alpha = self.alpha.calculate(&signals, spectral.as_deref(), mode);
            let mut final_score =
                (alpha.alpha * hit.score as f64 + (1.0 - alpha.alpha) * graph_score) as f32;
            if self.config.discovery.hybrid_reliability {
                final_score *=
                    reliability_multiplier(stats.success_rate(), &self.config.confidence);
            }
            let final_score = final_score.clamp(0.0, 1.0);
            scored.push(ToolDiscovery {
                tool_id: hit.id,
                score: final_score,
                algorithm: RankingAlgorithm::Hybrid,
                head_scores: None,
                semantic_score: Some(hit.score),
                graph_score: Some(graph_score),
                alpha: Some(alpha.alpha),
                server_id: None,
                input_schema: None,
                related_tools: Vec::new(),
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });

        let neighbors = self.config.discovery.related_neighbors;
        let mut out = Vec::new();
        for mut item in scored {
            let accepted = item.score >= min_score && out.len() < limit;
            self.log_decision(
                RankingAlgorithm::Hybrid,
                mode,
                TargetType::Tool,
                &item.tool_id,
                intent,
                serde_json::json!({
                    "semantic": item.semantic_score,
                    "graph": item.graph_score,
                    "alpha": item.alpha,
                    "density": density,
                }),
                item.score,
                min_score,
                accepted,
                correlation_id,
            );
            if accepted {
                item.related_tools = snapshot
                    .in_neighbors(&item.tool_id)
                    .into_iter()
                    .take(neighbors)
                    .chain(snapshot.out_neighbors(&item.tool_id).into_iter().take(neighbors))
                    .map(String::from)
                    .collect();
                item.related_tools.dedup();
                out.push(item);
            }
        }
        if out.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }
        Ok(out)
    }

    fn semantic_tools(
        &self,
        intent: &str,
        embedding: &Option<Vec<f32>>,
        limit: usize,
        min_score: f32,
        mode: DiscoveryMode,
        correlation_id: Uuid,
    ) -> std::result::Result<Vec<ToolDiscovery>, FallbackReason> {
        let embedding = embedding.as_ref().ok_or(FallbackReason::EmbedderUnavailable)?;
        if self.index.tool_count() == 0 {
            return Err(FallbackReason::IndexUnavailable);
        }
        let hits = self.index.search_tools(embedding, limit, min_score);
        if hits.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }
        let out: Vec<ToolDiscovery> = hits
            .into_iter()
            .map(|hit| {
                self.log_decision(
                    RankingAlgorithm::SemanticOnly,
                    mode,
                    TargetType::Tool,
                    &hit.id,
                    intent,
                    serde_json::json!({ "semantic": hit.score }),
                    hit.score,
                    min_score,
                    true,
                    correlation_id,
                );
                ToolDiscovery {
                    tool_id: hit.id,
                    score: hit.score,
                    algorithm: RankingAlgorithm::SemanticOnly,
                    head_scores: None,
                    semantic_score: Some(hit.score),
                    graph_score: None,
                    alpha: None,
                    server_id: None,
                    input_schema: None,
                    related_tools: Vec::new(),
                }
            })
            .collect();
        Ok(out)
    }

    /// Last-resort substring match over tool ids and descriptions at a
    /// fixed score.
    fn keyword_tools(
        &self,
        intent: &str,
        limit: usize,
        mode: DiscoveryMode,
        snapshot: &GraphSnapshot,
        correlation_id: Uuid,
    ) -> Vec<ToolDiscovery> {
        let needle = intent.to_lowercase();
        let mut out = Vec::new();
        for tool in &snapshot.tools {
            if out.len() >= limit {
                break;
            }
            let haystack = format!("{} {}", tool.id, tool.description).to_lowercase();
            let hit = needle
                .split_whitespace()
                .any(|word| haystack.contains(word));
            if hit {
                self.log_decision(
                    RankingAlgorithm::Keyword,
                    mode,
                    TargetType::Tool,
                    &tool.id,
                    intent,
                    serde_json::json!({ "keyword": true }),
                    KEYWORD_FALLBACK_SCORE,
                    0.0,
                    true,
                    correlation_id,
                );
                out.push(ToolDiscovery {
                    tool_id: tool.id.clone(),
                    score: KEYWORD_FALLBACK_SCORE,
                    algorithm: RankingAlgorithm::Keyword,
                    head_scores: None,
                    semantic_score: None,
                    graph_score: None,
                    alpha: None,
                    server_id: None,
                    input_schema: None,
                    related_tools: Vec::new(),
                });
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    async fn shgat_capabilities(
        &self,
        intent: &str,
        embedding: &Option<Vec<f32>>,
        limit: usize,
        min_score: f32,
        context: &[ToolId],
        mode: DiscoveryMode,
        snapshot: &GraphSnapshot,
        correlation_id: Uuid,
    ) -> std::result::Result<Vec<CapabilityDiscovery>, FallbackReason> {
        let model = self.model.as_ref().ok_or(FallbackReason::ModelUnavailable)?;
        let embedding = embedding.as_ref().ok_or(FallbackReason::EmbedderUnavailable)?;
        if snapshot.capabilities.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }

        let request = self.request_context(embedding, context, snapshot);
        let spectral = self.spectral_model(snapshot);
        let co_occurrence = self.co_occurrence.load();
        let inputs = ScoringInputs {
            snapshot,
            spectral: spectral.as_deref(),
            traces: Some(self.traces.as_ref()),
            co_occurrence: co_occurrence.as_ref(),
        };
        let scored = model.score_all_capabilities(&request, &inputs);
        let unstable = scored.iter().filter(|s| s.unstable).count();
        if unstable > 0 {
            self.metrics.unstable_forwards.inc_by(unstable as u64);
        }

        let mut out = Vec::new();
        for item in scored {
            let accepted = item.score >= min_score && out.len() < limit;
            let key = item.capability_id.to_string();
            let confidence = self.capability_confidence(
                &key,
                item.score,
                context,
                spectral.as_deref(),
                snapshot,
            );
            self.log_decision(
                RankingAlgorithm::Shgat,
                mode,
                TargetType::Capability,
                &key,
                intent,
                serde_json::json!({
                    "head_scores": item.head_scores,
                    "reliability_multiplier": item.reliability_multiplier,
                    "legacy": item.legacy_breakdown,
                    "tool_attention": item.tool_attention,
                }),
                item.score,
                min_score,
                accepted,
                correlation_id,
            );
            if accepted {
                let semantic_score = snapshot
                    .capability(&item.capability_id)
                    .map(|c| cosine(embedding, &c.intent_embedding));
                out.push(CapabilityDiscovery {
                    capability_id: item.capability_id,
                    score: item.score,
                    algorithm: RankingAlgorithm::Shgat,
                    semantic_score,
                    call_name: None,
                    code_snippet: None,
                    called_capabilities: Vec::new(),
                    confidence: Some(confidence),
                });
            }
        }
        if out.is_empty() {
            return Err(FallbackReason::EmptyResult);
        }
        Ok(out)
    }

    /// Legacy matcher: semantic similarity times the reliability
    /// multiplier, no attention.
    #[allow(clippy::too_many_arguments)]
    fn legacy_capabilities(
        &self,
        intent: &str,
        embedding: &Option<Vec<f32>>,
        limit: usize,
        min_score: f32,
        mode: DiscoveryMode,
        snapshot: &GraphSnapshot,
        correlation_id: Uuid,
    ) -> Vec<CapabilityDiscovery> {
        let Some(embedding) = embedding.as_ref() else {
            return Vec::new();
        };
        let mut scored: Vec<(f32, f32, &Capability)> = snapshot
            .capabilities
            .iter()
            .map(|capability| {
                let semantic = cosine(embedding, &capability.intent_embedding).clamp(-1.0, 1.0);
                let gated = (semantic
                    * reliability_multiplier(capability.success_rate(), &self.config.confidence))
                .clamp(0.0, 1.0);
                (gated, semantic, capability)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.2.id.cmp(&b.2.id))
        });

        let mut out = Vec::new();
        for (score, semantic, capability) in scored {
            let accepted = score >= min_score && out.len() < limit;
            self.log_decision(
                RankingAlgorithm::SemanticOnly,
                mode,
                TargetType::Capability,
                &capability.id.to_string(),
                intent,
                serde_json::json!({ "semantic": semantic, "success_rate": capability.success_rate() }),
                score,
                min_score,
                accepted,
                correlation_id,
            );
            if accepted {
                out.push(CapabilityDiscovery {
                    capability_id: capability.id,
                    score,
                    algorithm: RankingAlgorithm::SemanticOnly,
                    semantic_score: Some(semantic),
                    call_name: None,
                    code_snippet: None,
                    called_capabilities: Vec::new(),
                    confidence: None,
                });
            }
        }
        out
    }

    fn capability_confidence(
        &self,
        key: &str,
        score: f32,
        context: &[ToolId],
        spectral: Option<&SpectralModel>,
        snapshot: &GraphSnapshot,
    ) -> Confidence {
        let stats = self.traces.target_stats(key);
        let signals_alpha = self
            .alpha
            .calculate(
                &AlphaSignals {
                    target: key,
                    semantic: None,
                    context_semantic: None,
                    context_tools: context,
                    usage_count: stats.usage_count,
                    success_count: stats.success_count,
                },
                spectral,
                DiscoveryMode::ActiveSearch,
            )
            .alpha;
        let pagerank_top: Vec<f64> = spectral
            .map(|s| {
                let mut ranks: Vec<f64> = std::iter::once(s.pagerank_of(key))
                    .chain(context.iter().map(|t| s.pagerank_of(t)))
                    .collect();
                ranks.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
                ranks
            })
            .unwrap_or_default();
        let path_hops: Vec<usize> = context
            .iter()
            .filter_map(|t| snapshot.dependency_distance(t, key, 4))
            .collect();
        let community_boost = spectral
            .map(|s| s.community_boost(key, context))
            .unwrap_or(0.0);
        let co_occurrence = snapshot
            .capability_by_key(key)
            .map(|c| c.features.co_occurrence / (c.features.co_occurrence + 10.0))
            .unwrap_or(0.0);
        hybrid_confidence(
            &ConfidenceSignals {
                hybrid_score: score as f64,
                pagerank_top,
                path_hops,
                community_boost,
                co_occurrence,
                alpha: signals_alpha,
            },
            &self.config.confidence,
        )
    }

    async fn resolve_call_name(&self, capability: &Capability) -> String {
        if let Some(registry) = &self.registry {
            if let Ok(Some(record)) = registry.get_by_workflow_pattern_id(&capability.id).await {
                return record.call_name();
            }
        }
        capability.fqdn.call_name()
    }

    async fn resolve_called_capabilities(
        &self,
        capability: &Capability,
        snapshot: &GraphSnapshot,
    ) -> Vec<CalledCapability> {
        let refs = capability.referenced_capabilities();
        let mut out = Vec::with_capacity(refs.len());
        for id in refs {
            let mut call_name = None;
            let mut input_schema = None;
            if let Some(registry) = &self.registry {
                if let Ok(Some(record)) = registry.get_by_workflow_pattern_id(&id).await {
                    call_name = Some(record.call_name());
                    input_schema = record.input_schema;
                }
            }
            let call_name = call_name.unwrap_or_else(|| {
                snapshot
                    .capability(&id)
                    .map(|c| c.fqdn.call_name())
                    .unwrap_or_else(|| format!("unknown:{id}"))
            });
            out.push(CalledCapability {
                id,
                call_name,
                input_schema,
            });
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn log_decision(
        &self,
        algorithm: RankingAlgorithm,
        mode: DiscoveryMode,
        target_type: TargetType,
        target_id: &str,
        intent: &str,
        signals: JsonValue,
        final_score: f32,
        threshold: f32,
        accepted: bool,
        correlation_id: Uuid,
    ) {
        let Some(log) = &self.decision_log else {
            return;
        };
        log.emit(DecisionRecord {
            algorithm,
            mode,
            target_type,
            target_id: target_id.to_string(),
            intent: intent.to_string(),
            signals,
            params: serde_json::json!({
                "hybrid_reliability": self.config.discovery.hybrid_reliability,
                "default_alpha": self.config.alpha.default_alpha,
            }),
            final_score,
            threshold,
            decision: if accepted {
                Verdict::Accepted
            } else {
                Verdict::Rejected
            },
            correlation_id,
            recorded_at: chrono::Utc::now(),
        });
    }
}

impl DiscoveryBuilder {
    /// Attach the attention model.
    #[must_use]
    pub fn with_model(mut self, model: Arc<ShgatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Attach the embedding model.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Attach the tool repository for metadata enrichment.
    #[must_use]
    pub fn with_tool_repository(mut self, repo: Arc<dyn ToolRepository>) -> Self {
        self.tool_repo = Some(repo);
        self
    }

    /// Attach the capability registry for call-name resolution.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach the decision log.
    #[must_use]
    pub fn with_decision_log(mut self, log: DecisionLog) -> Self {
        self.decision_log = Some(log);
        self
    }

    /// Attach shared metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finish the build.
    ///
    /// # Errors
    /// Fails only when the fallback metrics registry cannot be created.
    pub fn build(self) -> Result<DiscoveryOrchestrator> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(EngineMetrics::new()?),
        };
        Ok(DiscoveryOrchestrator {
            alpha: AlphaCalculator::new(self.config.alpha.clone()),
            config: self.config,
            snapshot: self.snapshot,
            co_occurrence: self.co_occurrence,
            index: self.index,
            spectral: self.spectral,
            traces: self.traces,
            model: self.model,
            embedder: self.embedder,
            tool_repo: self.tool_repo,
            registry: self.registry,
            decision_log: self.decision_log,
            metrics,
        })
    }
}
