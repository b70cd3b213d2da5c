// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph-sync controller.
//!
//! The single writer over the graph store: pulls structural rows from
//! storage on a schedule (and on explicit `sync_now` calls), upserts the
//! deltas, refreshes derived graph features, publishes a fresh read
//! snapshot, invalidates the spectral cache, and tells the attention model
//! when the hierarchy deepened. Readers never see a half-applied sync.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capability::ToolId;
use crate::error::Result;
use crate::graph::{EdgeKind, EdgeSource, GraphSnapshot, SnapshotCell, ToolGraph};
use crate::index::VectorIndex;
use crate::replay::TraceStore;
use crate::shgat::{CoOccurrenceMatrix, ShgatModel};
use crate::spectral::{CapabilityNode, SpectralInput, SpectralManager};
use crate::storage::Storage;
use crate::trace::ExecutionTrace;

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub node_count: usize,
    pub edge_count: usize,
    pub snapshot_version: u64,
    /// False when storage was unchanged and the snapshot version held.
    pub changed: bool,
}

/// The controller. Owns the mutable [`ToolGraph`]; everything else reads
/// through the published snapshot.
pub struct GraphSyncController {
    graph: Mutex<ToolGraph>,
    snapshot: Arc<SnapshotCell<GraphSnapshot>>,
    co_occurrence: Arc<SnapshotCell<CoOccurrenceMatrix>>,
    index: Arc<VectorIndex>,
    spectral: Arc<SpectralManager>,
    model: Option<Arc<ShgatModel>>,
    traces: Arc<TraceStore>,
    storage: Arc<dyn Storage>,
}

impl GraphSyncController {
    /// Build a controller around an empty graph.
    #[must_use]
    pub fn new(
        accept_alternative: bool,
        index: Arc<VectorIndex>,
        spectral: Arc<SpectralManager>,
        model: Option<Arc<ShgatModel>>,
        traces: Arc<TraceStore>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            graph: Mutex::new(ToolGraph::new(accept_alternative)),
            snapshot: Arc::new(SnapshotCell::new(ToolGraph::empty_snapshot())),
            co_occurrence: Arc::new(SnapshotCell::new(Arc::new(CoOccurrenceMatrix::default()))),
            index,
            spectral,
            model,
            traces,
            storage,
        }
    }

    /// Shared handle readers load snapshots from.
    #[must_use]
    pub fn snapshot_cell(&self) -> Arc<SnapshotCell<GraphSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Shared handle to the co-occurrence matrix.
    #[must_use]
    pub fn co_occurrence_cell(&self) -> Arc<SnapshotCell<CoOccurrenceMatrix>> {
        Arc::clone(&self.co_occurrence)
    }

    /// Pull storage and apply deltas. Idempotent: unchanged storage yields
    /// an unchanged snapshot version and `changed = false`.
    ///
    /// Transient storage failures are retried with bounded backoff before
    /// the error surfaces.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let structure = self.load_structure_with_retry().await?;

        let before_version;
        let report = {
            let mut graph = self.graph.lock();
            before_version = graph.version();

            // One malformed row must not wedge the whole sync; it is
            // logged and the rest of the delta still lands.
            for tool in &structure.tools {
                match graph.upsert_tool(&tool.id, &tool.description, tool.embedding.clone()) {
                    Ok(()) => self.index.upsert_tool(
                        &tool.id,
                        tool.embedding.clone(),
                        serde_json::json!({ "server_id": tool.server_id, "description": tool.description }),
                    ),
                    Err(e) => warn!(tool = %tool.id, error = %e, "skipping tool row"),
                }
            }
            for capability in &structure.capabilities {
                match graph.upsert_capability(capability.clone()) {
                    Ok(()) => self.index.upsert_capability(
                        &capability.id.to_string(),
                        capability.intent_embedding.clone(),
                        serde_json::json!({ "fqdn": capability.fqdn.to_string() }),
                    ),
                    Err(e) => warn!(capability = %capability.id, error = %e, "skipping capability row"),
                }
            }
            for edge in &structure.edges {
                if let Err(e) = graph.add_edge(
                    &edge.from_id,
                    &edge.to_id,
                    edge.kind,
                    edge.source,
                    edge.weight,
                    edge.observed_count,
                ) {
                    warn!(from = %edge.from_id, to = %edge.to_id, error = %e, "skipping edge row");
                }
            }

            self.refresh_features(&mut graph);

            let snapshot = graph.publish();
            let changed = snapshot.version != before_version;
            let report = SyncReport {
                node_count: snapshot.node_count(),
                edge_count: snapshot.edge_count(),
                snapshot_version: snapshot.version,
                changed,
            };
            self.snapshot.store(snapshot);
            report
        };

        self.co_occurrence
            .store(Arc::new(CoOccurrenceMatrix::from_pairs(
                &self.traces.co_occurrence_pairs(),
            )));

        if report.changed {
            self.spectral.invalidate();
            if let Some(model) = &self.model {
                let max_level = self.graph.lock().max_level().unwrap_or(0);
                model.notify_structure_changed(max_level);
            }
            info!(
                nodes = report.node_count,
                edges = report.edge_count,
                version = report.snapshot_version,
                "graph sync applied deltas"
            );
        } else {
            debug!("graph sync: storage unchanged");
        }
        Ok(report)
    }

    /// Bounded-backoff retry around the structural read: three attempts at
    /// 50ms/200ms for transient failures; permanent errors surface at once.
    async fn load_structure_with_retry(&self) -> Result<crate::storage::StorageSnapshot> {
        let mut delay = Duration::from_millis(50);
        for attempt in 0..2 {
            match self.storage.load_structure().await {
                Ok(structure) => return Ok(structure),
                Err(crate::error::CapflowError::StorageTransient(reason)) => {
                    warn!(attempt, %reason, "transient storage failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 4;
                }
                Err(e) => return Err(e),
            }
        }
        self.storage.load_structure().await
    }

    /// Record a live execution: append to the replay buffer, persist, and
    /// observe sequence co-occurrence edges between adjacent tools.
    pub async fn observe_trace(&self, trace: ExecutionTrace) -> Result<()> {
        let tools = trace.tools_used();
        {
            let mut graph = self.graph.lock();
            for pair in tools.windows(2) {
                // Both endpoints must already exist; traces can mention
                // tools storage has not synced yet.
                if graph.tool(&pair[0]).is_none() || graph.tool(&pair[1]).is_none() {
                    continue;
                }
                graph.add_edge(
                    &pair[0],
                    &pair[1],
                    EdgeKind::Sequence,
                    EdgeSource::Inferred,
                    1.0,
                    1,
                )?;
            }
            self.snapshot.store(graph.publish());
        }
        self.storage.append_trace(&trace).await?;
        self.traces.append(trace);
        self.co_occurrence
            .store(Arc::new(CoOccurrenceMatrix::from_pairs(
                &self.traces.co_occurrence_pairs(),
            )));
        Ok(())
    }

    /// Refresh derived graph features (PageRank, community, co-occurrence
    /// mass, recency) on every node from the current spectral model.
    fn refresh_features(&self, graph: &mut ToolGraph) {
        let input = {
            let snapshot = GraphSnapshot::capture(graph);
            SpectralInput {
                tools: snapshot.tools.iter().map(|t| t.id.clone()).collect(),
                capabilities: snapshot
                    .capabilities
                    .iter()
                    .map(|c| CapabilityNode {
                        id: c.id.to_string(),
                        tools: c.tool_members().into_iter().cloned().collect(),
                    })
                    .collect(),
                cap_edges: snapshot.capability_edges(false),
            }
        };
        if input.tools.is_empty() && input.capabilities.is_empty() {
            return;
        }
        let model = self.spectral.model_for(&input);

        let recent_tools: Vec<ToolId> = {
            let mut traces = self.traces.all();
            traces.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
            traces
                .iter()
                .take(20)
                .flat_map(|t| t.tools_used())
                .collect()
        };

        let tool_ids: Vec<String> = input.tools.clone();
        for id in &tool_ids {
            let page_rank = model.pagerank_of(id);
            let community = model.cluster_of(id);
            let co_mass: f64 = self
                .co_occurrence
                .load()
                .neighbors(id)
                .iter()
                .map(|(_, w)| w)
                .sum();
            let recency = if recent_tools.contains(id) { 1.0 } else { 0.0 };
            if let Some(tool) = graph.tool_mut(id) {
                tool.features.page_rank = page_rank;
                tool.features.community = community;
                tool.features.co_occurrence = co_mass;
                tool.features.recency = recency;
            }
        }
        let cap_ids: Vec<String> = input.capabilities.iter().map(|c| c.id.clone()).collect();
        for id in &cap_ids {
            let page_rank = model.pagerank_of(id);
            let community = model.cluster_of(id);
            if let Ok(uuid) = uuid::Uuid::parse_str(id) {
                if let Some(capability) = graph.capability_mut(&uuid) {
                    capability.features.page_rank = page_rank;
                    capability.features.community = community;
                }
            }
        }
    }

    /// Spawn the periodic sync loop. The returned handle aborts the loop.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        let controller = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = controller.sync_now().await {
                    error!(error = %e, "periodic graph sync failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::constants::EMBEDDING_DIM;
    use crate::storage::{StorageSnapshot, ToolRow};
    use crate::test_support::MemoryStorage;
    use chrono::Utc;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn tool_row(id: &str, axis: usize) -> ToolRow {
        ToolRow {
            id: id.to_string(),
            server_id: id.split(':').next().unwrap_or("s").to_string(),
            description: format!("tool {id}"),
            embedding: unit(axis),
            updated_at: Utc::now(),
        }
    }

    fn controller_with(structure: StorageSnapshot) -> Arc<GraphSyncController> {
        let storage = Arc::new(MemoryStorage::with_structure(structure));
        Arc::new(GraphSyncController::new(
            false,
            Arc::new(VectorIndex::new()),
            Arc::new(SpectralManager::new(ClusterConfig::default())),
            None,
            Arc::new(TraceStore::new(1000, 0.6, 0.4, 1)),
            storage,
        ))
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let controller = controller_with(StorageSnapshot {
            tools: vec![tool_row("fs:read", 0), tool_row("fs:write", 1)],
            ..Default::default()
        });
        let first = controller.sync_now().await.unwrap();
        assert!(first.changed);
        assert_eq!(first.node_count, 2);
        let second = controller.sync_now().await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.snapshot_version, first.snapshot_version);
        assert_eq!(second.node_count, first.node_count);
        assert_eq!(second.edge_count, first.edge_count);
    }

    #[tokio::test]
    async fn test_sync_publishes_snapshot_and_index() {
        let controller = controller_with(StorageSnapshot {
            tools: vec![tool_row("fs:read", 0)],
            ..Default::default()
        });
        controller.sync_now().await.unwrap();
        let snapshot = controller.snapshot_cell().load();
        assert!(snapshot.tool("fs:read").is_some());
        // Features were refreshed from the spectral model.
        assert!(snapshot.tool("fs:read").unwrap().features.page_rank >= 0.0);
    }

    #[tokio::test]
    async fn test_observe_trace_records_sequence_edges() {
        let controller = controller_with(StorageSnapshot {
            tools: vec![tool_row("a:x", 0), tool_row("a:y", 1)],
            ..Default::default()
        });
        controller.sync_now().await.unwrap();

        let mk = |tool: &str| crate::trace::TaskResult {
            task_id: tool.to_string(),
            tool: tool.to_string(),
            args: serde_json::Value::Null,
            result: serde_json::Value::Null,
            success: true,
            duration_ms: 5,
            layer_index: 0,
        };
        let trace = ExecutionTrace::new("do x then y", unit(0), true)
            .with_task_results(vec![mk("a:x"), mk("a:y")]);
        controller.observe_trace(trace).await.unwrap();

        let snapshot = controller.snapshot_cell().load();
        let edge = snapshot.edge("a:x", "a:y", EdgeKind::Sequence).unwrap();
        assert_eq!(edge.observed_count, 1);
        assert_eq!(edge.source, EdgeSource::Inferred);
        assert!(!controller.co_occurrence_cell().load().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_observations_promote_edges() {
        let controller = controller_with(StorageSnapshot {
            tools: vec![tool_row("a:x", 0), tool_row("a:y", 1)],
            ..Default::default()
        });
        controller.sync_now().await.unwrap();
        let mk = |tool: &str| crate::trace::TaskResult {
            task_id: tool.to_string(),
            tool: tool.to_string(),
            args: serde_json::Value::Null,
            result: serde_json::Value::Null,
            success: true,
            duration_ms: 5,
            layer_index: 0,
        };
        for _ in 0..3 {
            let trace = ExecutionTrace::new("do x then y", unit(0), true)
                .with_task_results(vec![mk("a:x"), mk("a:y")]);
            controller.observe_trace(trace).await.unwrap();
        }
        let snapshot = controller.snapshot_cell().load();
        let edge = snapshot.edge("a:x", "a:y", EdgeKind::Sequence).unwrap();
        assert_eq!(edge.observed_count, 3);
        assert_eq!(edge.source, EdgeSource::Observed);
    }
}
