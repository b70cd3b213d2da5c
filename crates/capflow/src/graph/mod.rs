// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph store over tools and capabilities.
//!
//! The store exclusively owns tool and capability records; every other
//! component holds ids or borrowed read views. It is single-writer (the
//! sync controller) with readers observing consistent [`GraphSnapshot`]s
//! published through an atomic pointer swap.
//!
//! Four edge kinds with distinct cycle rules:
//!
//! | kind | cycles | carries |
//! |------|--------|---------|
//! | contains | no (DAG) | membership |
//! | dependency | no (DAG) | execution order |
//! | sequence | yes | temporal co-occurrence |
//! | provides | yes | data flow |

mod hierarchy;
mod snapshot;

pub use hierarchy::ContainmentMatrix;
pub use snapshot::{GraphSnapshot, SnapshotCell};

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction as PetDirection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::capability::{Capability, CapabilityId, Member, Tool};
use crate::constants::{EDGE_PROMOTION_THRESHOLD, EMBEDDING_DIM};
use crate::embeddings::normalize_embedding;
use crate::error::{CapflowError, Result};

/// Graph-level edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Membership; parent -> member. Acyclic.
    Contains,
    /// Execution ordering; prerequisite -> dependent. Acyclic.
    Dependency,
    /// Temporal co-occurrence. Cycles allowed.
    Sequence,
    /// Data flow. Cycles allowed.
    Provides,
    /// Deprecated alternative-of relation; accepted only when
    /// `GraphConfig::enable_alternative_edges` is set.
    Alternative,
}

impl EdgeKind {
    /// Whether inserts of this kind must preserve acyclicity.
    #[must_use]
    pub fn requires_dag(self) -> bool {
        matches!(self, EdgeKind::Contains | EdgeKind::Dependency)
    }

    /// Spectral type weight used when folding capability-capability edges
    /// into the clustering adjacency.
    #[must_use]
    pub fn spectral_weight(self) -> f64 {
        match self {
            EdgeKind::Dependency => 1.0,
            EdgeKind::Contains => 0.8,
            EdgeKind::Alternative => 0.6,
            EdgeKind::Sequence => 0.5,
            EdgeKind::Provides => 0.5,
        }
    }
}

/// Provenance of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    /// Authored as part of a workflow template.
    Template,
    /// Inferred by analysis; promoted to observed after repeated sightings.
    Inferred,
    /// Confirmed by execution traces.
    Observed,
}

/// A stored edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub kind: EdgeKind,
    pub source: EdgeSource,
    pub weight: f64,
    pub observed_count: u64,
    /// Monotone non-decreasing confidence in [0, 1].
    pub confidence: f64,
}

impl EdgeRecord {
    fn confidence_for(source: EdgeSource, observed_count: u64) -> f64 {
        let observational = observed_count as f64 / (observed_count as f64 + 3.0);
        match source {
            EdgeSource::Template => observational.max(0.8),
            EdgeSource::Inferred | EdgeSource::Observed => observational,
        }
    }
}

/// Neighbor query direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// A node: tool or capability.
#[derive(Debug, Clone)]
pub enum NodeData {
    Tool(Tool),
    Capability(Capability),
}

impl NodeData {
    /// Stable node key: tool id or capability uuid string.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            NodeData::Tool(t) => t.id.clone(),
            NodeData::Capability(c) => c.id.to_string(),
        }
    }

    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, NodeData::Capability(_))
    }
}

/// The in-memory graph store. Single-writer; see [`GraphSnapshot`] for the
/// read side.
pub struct ToolGraph {
    pub(crate) graph: StableDiGraph<NodeData, EdgeRecord>,
    pub(crate) ids: HashMap<String, NodeIndex>,
    /// Derived hierarchy levels for capabilities, by node key.
    pub(crate) levels: HashMap<String, usize>,
    version: u64,
    dirty: bool,
    accept_alternative: bool,
}

impl ToolGraph {
    /// Create an empty store.
    #[must_use]
    pub fn new(accept_alternative: bool) -> Self {
        Self {
            graph: StableDiGraph::new(),
            ids: HashMap::new(),
            levels: HashMap::new(),
            version: 0,
            dirty: false,
            accept_alternative,
        }
    }

    /// Node count.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Edge count.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Current published version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Insert or replace a tool. The embedding is validated and
    /// L2-normalized on write.
    pub fn upsert_tool(&mut self, id: &str, description: &str, embedding: Vec<f32>) -> Result<()> {
        let embedding = normalize_embedding(embedding, EMBEDDING_DIM)?;
        let tool = Tool {
            id: id.to_string(),
            description: description.to_string(),
            embedding,
            features: Default::default(),
        };
        match self.ids.get(id) {
            Some(&idx) => {
                if let Some(NodeData::Tool(existing)) = self.graph.node_weight_mut(idx) {
                    // Preserve derived features across metadata refreshes.
                    let features = existing.features;
                    *existing = Tool { features, ..tool };
                }
            }
            None => {
                let idx = self.graph.add_node(NodeData::Tool(tool));
                self.ids.insert(id.to_string(), idx);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Insert or replace a capability. Membership is materialized as
    /// `contains` edges; the hierarchy level map is recomputed on success.
    ///
    /// # Errors
    /// Returns `HierarchyCycle` (and leaves the store unchanged) when the
    /// members would introduce a cycle in `contains`.
    pub fn upsert_capability(&mut self, mut record: Capability) -> Result<()> {
        record.intent_embedding = normalize_embedding(record.intent_embedding, EMBEDDING_DIM)?;
        let key = record.id.to_string();

        // Reject membership cycles before mutating: a member that can reach
        // this capability through contains edges would close a loop.
        for member in &record.members {
            if let Member::Capability(child) = member {
                let child_key = child.to_string();
                if child_key == key || self.has_path_of_kind(&child_key, &key, EdgeKind::Contains) {
                    return Err(CapflowError::HierarchyCycle {
                        from: key,
                        to: child_key,
                    });
                }
            }
        }

        let idx = match self.ids.get(&key) {
            Some(&idx) => {
                // Drop stale membership edges; they are re-derived below.
                let stale: Vec<_> = self
                    .graph
                    .edges_directed(idx, PetDirection::Outgoing)
                    .filter(|e| e.weight().kind == EdgeKind::Contains)
                    .map(|e| e.id())
                    .collect();
                for edge in stale {
                    self.graph.remove_edge(edge);
                }
                if let Some(node) = self.graph.node_weight_mut(idx) {
                    *node = NodeData::Capability(record.clone());
                }
                idx
            }
            None => {
                let idx = self.graph.add_node(NodeData::Capability(record.clone()));
                self.ids.insert(key.clone(), idx);
                idx
            }
        };

        for member in &record.members {
            let member_key = member.node_key();
            let member_idx = self.ensure_placeholder(&member_key, member);
            self.graph.add_edge(
                idx,
                member_idx,
                EdgeRecord {
                    kind: EdgeKind::Contains,
                    source: EdgeSource::Template,
                    weight: 1.0,
                    observed_count: 1,
                    confidence: EdgeRecord::confidence_for(EdgeSource::Template, 1),
                },
            );
        }

        self.recompute_hierarchy_levels();
        self.dirty = true;
        debug!(capability = %key, level = self.levels.get(&key), "upserted capability");
        Ok(())
    }

    /// Members may arrive before their own records; hold a placeholder node
    /// so edges resolve, to be overwritten by the real upsert.
    fn ensure_placeholder(&mut self, key: &str, member: &Member) -> NodeIndex {
        if let Some(&idx) = self.ids.get(key) {
            return idx;
        }
        let data = match member {
            Member::Tool(id) => NodeData::Tool(Tool {
                id: id.clone(),
                description: String::new(),
                embedding: Vec::new(),
                features: Default::default(),
            }),
            Member::Capability(id) => NodeData::Capability(Capability {
                id: *id,
                fqdn: crate::capability::Fqdn {
                    org: "unresolved".into(),
                    project: "unresolved".into(),
                    namespace: "unresolved".into(),
                    action: "unresolved".into(),
                    hash4: "0000".into(),
                },
                members: Vec::new(),
                hierarchy_level: 0,
                intent_embedding: Vec::new(),
                success_count: 0,
                usage_count: 0,
                avg_duration_ms: 0.0,
                source: crate::capability::CapabilitySource::Emergent,
                code_snippet: None,
                structure: None,
                features: Default::default(),
                updated_at: chrono::Utc::now(),
            }),
        };
        let idx = self.graph.add_node(data);
        self.ids.insert(key.to_string(), idx);
        idx
    }

    /// Weighted edge upsert.
    ///
    /// Repeated observations accumulate `observed_count`; an `inferred` edge
    /// seen at least [`EDGE_PROMOTION_THRESHOLD`] times is promoted to
    /// `observed` on the next observation. Confidence is monotone
    /// non-decreasing across upserts.
    ///
    /// # Errors
    /// - `UnknownNode` when either endpoint is missing.
    /// - `HierarchyCycle` / `DependencyCycle` when a DAG-kind edge would
    ///   close a cycle.
    /// - `InvalidEdgeKind` for `alternative` when disabled.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        kind: EdgeKind,
        source: EdgeSource,
        weight: f64,
        count: u64,
    ) -> Result<()> {
        if kind == EdgeKind::Alternative && !self.accept_alternative {
            return Err(CapflowError::InvalidEdgeKind(
                "alternative edges are disabled".to_string(),
            ));
        }
        let from_idx = *self
            .ids
            .get(from)
            .ok_or_else(|| CapflowError::UnknownNode(from.to_string()))?;
        let to_idx = *self
            .ids
            .get(to)
            .ok_or_else(|| CapflowError::UnknownNode(to.to_string()))?;

        let existing = self
            .graph
            .edges_directed(from_idx, PetDirection::Outgoing)
            .find(|e| e.target() == to_idx && e.weight().kind == kind)
            .map(|e| e.id());

        if existing.is_none() && kind.requires_dag() && self.has_path_of_kind(to, from, kind) {
            return Err(match kind {
                EdgeKind::Contains => CapflowError::HierarchyCycle {
                    from: from.to_string(),
                    to: to.to_string(),
                },
                _ => CapflowError::DependencyCycle {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            });
        }

        match existing {
            Some(edge_id) => {
                if let Some(record) = self.graph.edge_weight_mut(edge_id) {
                    let was = record.source;
                    record.observed_count += count;
                    record.weight = record.weight.max(weight);
                    if record.source == EdgeSource::Inferred
                        && record.observed_count >= EDGE_PROMOTION_THRESHOLD
                    {
                        record.source = EdgeSource::Observed;
                    }
                    if source == EdgeSource::Observed {
                        record.source = EdgeSource::Observed;
                    }
                    record.confidence = record
                        .confidence
                        .max(EdgeRecord::confidence_for(record.source, record.observed_count));
                    if was != record.source {
                        debug!(from, to, ?kind, "edge promoted to observed");
                    }
                }
            }
            None => {
                self.graph.add_edge(
                    from_idx,
                    to_idx,
                    EdgeRecord {
                        kind,
                        source,
                        weight,
                        observed_count: count,
                        confidence: EdgeRecord::confidence_for(source, count),
                    },
                );
            }
        }

        if kind == EdgeKind::Contains {
            self.recompute_hierarchy_levels();
        }
        self.dirty = true;
        Ok(())
    }

    /// DFS over edges of one kind only.
    fn has_path_of_kind(&self, from: &str, to: &str, kind: EdgeKind) -> bool {
        let (Some(&start), Some(&goal)) = (self.ids.get(from), self.ids.get(to)) else {
            return false;
        };
        let mut stack = vec![start];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == goal {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, PetDirection::Outgoing) {
                if edge.weight().kind == kind {
                    stack.push(edge.target());
                }
            }
        }
        false
    }

    /// Neighbor keys in the requested direction, across all edge kinds,
    /// deduplicated, sorted for determinism.
    #[must_use]
    pub fn neighbors(&self, node: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.ids.get(node) else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        let mut push = |n: NodeIndex| {
            if let Some(data) = self.graph.node_weight(n) {
                let key = data.key();
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        };
        if matches!(direction, Direction::Out | Direction::Both) {
            for n in self.graph.neighbors_directed(idx, PetDirection::Outgoing) {
                push(n);
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            for n in self.graph.neighbors_directed(idx, PetDirection::Incoming) {
                push(n);
            }
        }
        out.sort();
        out
    }

    /// In-neighbors only.
    #[must_use]
    pub fn in_neighbors(&self, node: &str) -> Vec<String> {
        self.neighbors(node, Direction::In)
    }

    /// Out-neighbors only.
    #[must_use]
    pub fn out_neighbors(&self, node: &str) -> Vec<String> {
        self.neighbors(node, Direction::Out)
    }

    /// Total degree across all edge kinds.
    #[must_use]
    pub fn degree(&self, node: &str) -> usize {
        let Some(&idx) = self.ids.get(node) else {
            return 0;
        };
        self.graph
            .edges_directed(idx, PetDirection::Outgoing)
            .count()
            + self
                .graph
                .edges_directed(idx, PetDirection::Incoming)
                .count()
    }

    /// Fetch a tool by id.
    #[must_use]
    pub fn tool(&self, id: &str) -> Option<&Tool> {
        self.ids.get(id).and_then(|&idx| {
            if let Some(NodeData::Tool(t)) = self.graph.node_weight(idx) {
                Some(t)
            } else {
                None
            }
        })
    }

    /// Fetch a capability by id.
    #[must_use]
    pub fn capability(&self, id: &CapabilityId) -> Option<&Capability> {
        self.ids.get(&id.to_string()).and_then(|&idx| {
            if let Some(NodeData::Capability(c)) = self.graph.node_weight(idx) {
                Some(c)
            } else {
                None
            }
        })
    }

    /// Mutable access to a capability record (counter updates from sync).
    pub fn capability_mut(&mut self, id: &CapabilityId) -> Option<&mut Capability> {
        self.dirty = true;
        self.ids.get(&id.to_string()).and_then(|&idx| {
            if let Some(NodeData::Capability(c)) = self.graph.node_weight_mut(idx) {
                Some(c)
            } else {
                None
            }
        })
    }

    /// Mutable access to a tool record.
    pub fn tool_mut(&mut self, id: &str) -> Option<&mut Tool> {
        self.dirty = true;
        self.ids.get(id).and_then(|&idx| {
            if let Some(NodeData::Tool(t)) = self.graph.node_weight_mut(idx) {
                Some(t)
            } else {
                None
            }
        })
    }

    /// All tools.
    #[must_use]
    pub fn tools(&self) -> Vec<&Tool> {
        let mut out: Vec<&Tool> = self
            .graph
            .node_weights()
            .filter_map(|n| match n {
                NodeData::Tool(t) => Some(t),
                NodeData::Capability(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// All capabilities.
    #[must_use]
    pub fn capabilities(&self) -> Vec<&Capability> {
        let mut out: Vec<&Capability> = self
            .graph
            .node_weights()
            .filter_map(|n| match n {
                NodeData::Capability(c) => Some(c),
                NodeData::Tool(_) => None,
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Hierarchy level of a capability node key, when known.
    #[must_use]
    pub fn level_of(&self, key: &str) -> Option<usize> {
        self.levels.get(key).copied()
    }

    /// Publish a read snapshot. The version advances only when the store
    /// changed since the last publish, which keeps repeated syncs of
    /// unchanged storage idempotent.
    pub fn publish(&mut self) -> std::sync::Arc<GraphSnapshot> {
        if self.dirty {
            self.version += 1;
            self.dirty = false;
        }
        std::sync::Arc::new(GraphSnapshot::capture(self))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{CapabilitySource, Fqdn};
    use chrono::Utc;
    use uuid::Uuid;

    pub(crate) fn unit_embedding(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    pub(crate) fn make_capability(id: Uuid, members: Vec<Member>) -> Capability {
        Capability {
            id,
            fqdn: Fqdn::new("acme", "flow", "ns", "act", "code").unwrap(),
            members,
            hierarchy_level: 0,
            intent_embedding: unit_embedding(0),
            success_count: 0,
            usage_count: 0,
            avg_duration_ms: 0.0,
            source: CapabilitySource::Emergent,
            code_snippet: None,
            structure: None,
            features: Default::default(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_tool_normalizes_embedding() {
        let mut g = ToolGraph::new(false);
        let mut raw = vec![0.0; EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        g.upsert_tool("fs:read", "read a file", raw).unwrap();
        let tool = g.tool("fs:read").unwrap();
        assert!((crate::tensor::norm(&tool.embedding) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_upsert_tool_rejects_wrong_dimension() {
        let mut g = ToolGraph::new(false);
        let err = g.upsert_tool("fs:read", "read", vec![1.0; 3]).unwrap_err();
        assert!(matches!(err, CapflowError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_contains_cycle_rejected_with_no_state_change() {
        let mut g = ToolGraph::new(false);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.upsert_capability(make_capability(c, vec![])).unwrap();
        g.upsert_capability(make_capability(b, vec![Member::Capability(c)]))
            .unwrap();
        g.upsert_capability(make_capability(a, vec![Member::Capability(b)]))
            .unwrap();

        let nodes_before = g.node_count();
        let edges_before = g.edge_count();
        let err = g
            .upsert_capability(make_capability(c, vec![Member::Capability(a)]))
            .unwrap_err();
        match err {
            CapflowError::HierarchyCycle { from, to } => {
                assert_eq!(from, c.to_string());
                assert_eq!(to, a.to_string());
            }
            other => panic!("expected HierarchyCycle, got {other:?}"),
        }
        assert_eq!(g.node_count(), nodes_before);
        assert_eq!(g.edge_count(), edges_before);
        // The original (empty) record for C is still in place.
        assert!(g.capability(&c).unwrap().members.is_empty());
    }

    #[test]
    fn test_hierarchy_levels_follow_membership() {
        let mut g = ToolGraph::new(false);
        let leaf = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let top = Uuid::new_v4();
        g.upsert_tool("fs:read", "r", unit_embedding(0)).unwrap();
        g.upsert_capability(make_capability(
            leaf,
            vec![Member::Tool("fs:read".to_string())],
        ))
        .unwrap();
        g.upsert_capability(make_capability(mid, vec![Member::Capability(leaf)]))
            .unwrap();
        g.upsert_capability(make_capability(
            top,
            vec![Member::Capability(mid), Member::Capability(leaf)],
        ))
        .unwrap();

        assert_eq!(g.level_of(&leaf.to_string()), Some(0));
        assert_eq!(g.level_of(&mid.to_string()), Some(1));
        assert_eq!(g.level_of(&top.to_string()), Some(2));
        assert_eq!(g.capability(&top).unwrap().hierarchy_level, 2);
    }

    #[test]
    fn test_edge_promotion_at_threshold() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Sequence, EdgeSource::Inferred, 1.0, 1)
            .unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Sequence, EdgeSource::Inferred, 1.0, 1)
            .unwrap();
        // Two observations: still inferred.
        let snapshot = g.publish();
        assert_eq!(
            snapshot.edge("a:x", "a:y", EdgeKind::Sequence).unwrap().source,
            EdgeSource::Inferred
        );
        g.add_edge("a:x", "a:y", EdgeKind::Sequence, EdgeSource::Inferred, 1.0, 1)
            .unwrap();
        let snapshot = g.publish();
        let edge = snapshot.edge("a:x", "a:y", EdgeKind::Sequence).unwrap();
        assert_eq!(edge.source, EdgeSource::Observed);
        assert_eq!(edge.observed_count, 3);
    }

    #[test]
    fn test_add_edge_twice_accumulates_and_confidence_monotone() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Provides, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        let c1 = g
            .publish()
            .edge("a:x", "a:y", EdgeKind::Provides)
            .unwrap()
            .confidence;
        g.add_edge("a:x", "a:y", EdgeKind::Provides, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        let edge = g.publish().edge("a:x", "a:y", EdgeKind::Provides).unwrap().clone();
        assert_eq!(edge.observed_count, 2);
        assert!(edge.confidence >= c1);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Dependency, EdgeSource::Template, 1.0, 1)
            .unwrap();
        let err = g
            .add_edge("a:y", "a:x", EdgeKind::Dependency, EdgeSource::Template, 1.0, 1)
            .unwrap_err();
        assert!(matches!(err, CapflowError::DependencyCycle { .. }));
        // Sequence edges may close cycles.
        g.add_edge("a:x", "a:y", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        g.add_edge("a:y", "a:x", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
    }

    #[test]
    fn test_alternative_edges_gated() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        let err = g
            .add_edge("a:x", "a:y", EdgeKind::Alternative, EdgeSource::Inferred, 1.0, 1)
            .unwrap_err();
        assert!(matches!(err, CapflowError::InvalidEdgeKind(_)));

        let mut g = ToolGraph::new(true);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Alternative, EdgeSource::Inferred, 1.0, 1)
            .unwrap();
    }

    #[test]
    fn test_neighbors_directions() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        g.upsert_tool("a:z", "z", unit_embedding(2)).unwrap();
        g.add_edge("a:x", "a:y", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        g.add_edge("a:z", "a:x", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        assert_eq!(g.out_neighbors("a:x"), vec!["a:y"]);
        assert_eq!(g.in_neighbors("a:x"), vec!["a:z"]);
        assert_eq!(g.neighbors("a:x", Direction::Both), vec!["a:y", "a:z"]);
        assert_eq!(g.degree("a:x"), 2);
    }

    #[test]
    fn test_publish_version_advances_only_on_change() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:x", "x", unit_embedding(0)).unwrap();
        let s1 = g.publish();
        let s2 = g.publish();
        assert_eq!(s1.version, s2.version);
        g.upsert_tool("a:y", "y", unit_embedding(1)).unwrap();
        let s3 = g.publish();
        assert_eq!(s3.version, s1.version + 1);
    }
}
