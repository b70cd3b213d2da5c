// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Read-side graph snapshot.
//!
//! The writer publishes an immutable [`GraphSnapshot`] behind an atomic
//! pointer; concurrent discovery requests hold the `Arc` for their whole
//! lifetime, so a sync landing mid-request never tears a view.

use parking_lot::RwLock;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{ContainmentMatrix, EdgeKind, EdgeRecord, ToolGraph};
use crate::capability::{Capability, CapabilityId, Tool};

/// Atomic pointer cell readers load snapshots from.
///
/// `load` is wait-free for practical purposes (a read lock around an `Arc`
/// clone); `store` swaps the pointer without disturbing in-flight readers.
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    /// Create a cell holding an initial value.
    pub fn new(value: Arc<T>) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Load the current value; the caller keeps it alive for the request.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Publish a new value.
    pub fn store(&self, value: Arc<T>) {
        *self.inner.write() = value;
    }
}

/// A consistent, immutable view of the graph store.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    /// Monotone snapshot version; unchanged when the store content is
    /// unchanged.
    pub version: u64,
    pub tools: Vec<Tool>,
    pub capabilities: Vec<Capability>,
    tool_index: HashMap<String, usize>,
    cap_index: HashMap<String, usize>,
    /// All edges as `(from_key, to_key, record)`.
    pub edges: Vec<(String, String, EdgeRecord)>,
    out_adj: HashMap<String, Vec<usize>>,
    in_adj: HashMap<String, Vec<usize>>,
    /// Capability hierarchy levels by node key.
    pub levels: HashMap<String, usize>,
    /// Containment matrices per level boundary; index 0 is tools-to-level-0,
    /// index k+1 is level-k-to-level-k+1.
    pub containment: Vec<ContainmentMatrix>,
}

impl GraphSnapshot {
    /// Capture a snapshot from the store. Called by the writer only.
    #[must_use]
    pub fn capture(store: &ToolGraph) -> Self {
        let tools: Vec<Tool> = store.tools().into_iter().cloned().collect();
        let capabilities: Vec<Capability> = store.capabilities().into_iter().cloned().collect();
        let tool_index = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let cap_index = capabilities
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.to_string(), i))
            .collect();

        let mut edges = Vec::with_capacity(store.graph.edge_count());
        let mut out_adj: HashMap<String, Vec<usize>> = HashMap::new();
        let mut in_adj: HashMap<String, Vec<usize>> = HashMap::new();
        for edge in store.graph.edge_references() {
            let (Some(from), Some(to)) = (
                store.graph.node_weight(edge.source()),
                store.graph.node_weight(edge.target()),
            ) else {
                continue;
            };
            let idx = edges.len();
            let from_key = from.key();
            let to_key = to.key();
            out_adj.entry(from_key.clone()).or_default().push(idx);
            in_adj.entry(to_key.clone()).or_default().push(idx);
            edges.push((from_key, to_key, edge.weight().clone()));
        }

        let max_level = store.max_level();
        let mut containment = Vec::new();
        if let Some(max) = max_level {
            containment.push(store.build_containment_matrix(-1));
            for level in 0..max {
                containment.push(store.build_containment_matrix(level as isize));
            }
        }

        Self {
            version: store.version(),
            tools,
            capabilities,
            tool_index,
            cap_index,
            edges,
            out_adj,
            in_adj,
            levels: store.levels.clone(),
            containment,
        }
    }

    /// Node count (tools + capabilities).
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.tools.len() + self.capabilities.len()
    }

    /// Edge count.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Directed edge density over ordered node pairs.
    #[must_use]
    pub fn density(&self) -> f64 {
        let n = self.node_count();
        if n < 2 {
            return 0.0;
        }
        self.edges.len() as f64 / (n as f64 * (n as f64 - 1.0))
    }

    /// Fetch a tool by id.
    #[must_use]
    pub fn tool(&self, id: &str) -> Option<&Tool> {
        self.tool_index.get(id).map(|&i| &self.tools[i])
    }

    /// Fetch a capability by id.
    #[must_use]
    pub fn capability(&self, id: &CapabilityId) -> Option<&Capability> {
        self.cap_index
            .get(&id.to_string())
            .map(|&i| &self.capabilities[i])
    }

    /// Fetch a capability by node key.
    #[must_use]
    pub fn capability_by_key(&self, key: &str) -> Option<&Capability> {
        self.cap_index.get(key).map(|&i| &self.capabilities[i])
    }

    /// A specific edge record.
    #[must_use]
    pub fn edge(&self, from: &str, to: &str, kind: EdgeKind) -> Option<&EdgeRecord> {
        self.out_adj.get(from).and_then(|idxs| {
            idxs.iter()
                .map(|&i| &self.edges[i])
                .find(|(_, t, r)| t == to && r.kind == kind)
                .map(|(_, _, r)| r)
        })
    }

    /// Out-neighbor keys, deduplicated, sorted.
    #[must_use]
    pub fn out_neighbors(&self, node: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .out_adj
            .get(node)
            .map(|idxs| idxs.iter().map(|&i| self.edges[i].1.as_str()).collect())
            .unwrap_or_default();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// In-neighbor keys, deduplicated, sorted.
    #[must_use]
    pub fn in_neighbors(&self, node: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .in_adj
            .get(node)
            .map(|idxs| idxs.iter().map(|&i| self.edges[i].0.as_str()).collect())
            .unwrap_or_default();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Undirected neighbor set.
    #[must_use]
    pub fn neighbor_set(&self, node: &str) -> HashSet<&str> {
        let mut set: HashSet<&str> = self.out_neighbors(node).into_iter().collect();
        set.extend(self.in_neighbors(node));
        set
    }

    /// Total degree.
    #[must_use]
    pub fn degree(&self, node: &str) -> usize {
        self.out_adj.get(node).map_or(0, Vec::len) + self.in_adj.get(node).map_or(0, Vec::len)
    }

    /// Structural relatedness of `node` to a context set: normalized
    /// common-neighbor overlap blended with an Adamic-Adar sum, in [0, 1].
    #[must_use]
    pub fn graph_relatedness(&self, node: &str, context: &[String]) -> f64 {
        if context.is_empty() {
            return 0.0;
        }
        let neighbors = self.neighbor_set(node);
        if neighbors.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        for ctx in context {
            if ctx == node {
                total += 1.0;
                continue;
            }
            let ctx_neighbors = self.neighbor_set(ctx);
            if ctx_neighbors.is_empty() {
                continue;
            }
            let common: Vec<&str> = neighbors.intersection(&ctx_neighbors).copied().collect();
            if common.is_empty() {
                continue;
            }
            let union = neighbors.union(&ctx_neighbors).count() as f64;
            let jaccard = common.len() as f64 / union;
            // Adamic-Adar: rare shared neighbors count more.
            let aa: f64 = common
                .iter()
                .map(|&c| {
                    let d = self.degree(c).max(2) as f64;
                    1.0 / d.ln()
                })
                .sum();
            let aa_norm = aa / (aa + 1.0);
            total += 0.5 * jaccard + 0.5 * aa_norm;
        }
        (total / context.len() as f64).clamp(0.0, 1.0)
    }

    /// Shortest dependency-path length between two nodes across
    /// dependency/provides edges, if one exists within `max_hops`.
    #[must_use]
    pub fn dependency_distance(&self, from: &str, to: &str, max_hops: usize) -> Option<usize> {
        if from == to {
            return Some(0);
        }
        let mut frontier = vec![from];
        let mut seen: HashSet<&str> = HashSet::from([from]);
        for hop in 1..=max_hops {
            let mut next = Vec::new();
            for node in frontier {
                if let Some(idxs) = self.out_adj.get(node) {
                    for &i in idxs {
                        let (_, ref target, ref record) = self.edges[i];
                        if !matches!(record.kind, EdgeKind::Dependency | EdgeKind::Provides) {
                            continue;
                        }
                        if target == to {
                            return Some(hop);
                        }
                        if seen.insert(target) {
                            next.push(target.as_str());
                        }
                    }
                }
            }
            if next.is_empty() {
                return None;
            }
            frontier = next;
        }
        None
    }

    /// Capability-to-capability edges with their confidences, for the
    /// clustering manager (which folds in per-kind spectral weights).
    #[must_use]
    pub fn capability_edges(&self, include_alternative: bool) -> Vec<(String, String, EdgeKind, f64)> {
        self.edges
            .iter()
            .filter(|(from, to, record)| {
                self.cap_index.contains_key(from)
                    && self.cap_index.contains_key(to)
                    && (include_alternative || record.kind != EdgeKind::Alternative)
            })
            .map(|(from, to, record)| (from.clone(), to.clone(), record.kind, record.confidence))
            .collect()
    }
}

impl ToolGraph {
    /// Create an empty snapshot for bootstrapping a [`SnapshotCell`].
    #[must_use]
    pub fn empty_snapshot() -> Arc<GraphSnapshot> {
        Arc::new(GraphSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{make_capability, unit_embedding};
    use super::super::{EdgeSource, ToolGraph};
    use super::*;
    use crate::capability::Member;
    use uuid::Uuid;

    fn seeded_graph() -> ToolGraph {
        let mut g = ToolGraph::new(false);
        for (i, id) in ["a:w", "a:x", "a:y", "a:z"].iter().enumerate() {
            g.upsert_tool(id, id, unit_embedding(i)).unwrap();
        }
        g.add_edge("a:w", "a:x", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        g.add_edge("a:y", "a:x", EdgeKind::Sequence, EdgeSource::Observed, 1.0, 1)
            .unwrap();
        g.add_edge("a:w", "a:y", EdgeKind::Dependency, EdgeSource::Template, 1.0, 1)
            .unwrap();
        g
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let mut g = seeded_graph();
        let snapshot = g.publish();
        let before = snapshot.node_count();
        g.upsert_tool("a:new", "new", unit_embedding(5)).unwrap();
        assert_eq!(snapshot.node_count(), before);
        assert_eq!(g.publish().node_count(), before + 1);
    }

    #[test]
    fn test_density() {
        let mut g = seeded_graph();
        let s = g.publish();
        // 3 edges over 4*3 ordered pairs.
        assert!((s.density() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_graph_relatedness_common_neighbors() {
        let mut g = seeded_graph();
        let s = g.publish();
        // a:w and a:y share neighbor a:x.
        let related = s.graph_relatedness("a:w", &["a:y".to_string()]);
        assert!(related > 0.0);
        // a:z is isolated.
        assert_eq!(s.graph_relatedness("a:z", &["a:w".to_string()]), 0.0);
        assert_eq!(s.graph_relatedness("a:w", &[]), 0.0);
    }

    #[test]
    fn test_dependency_distance() {
        let mut g = seeded_graph();
        let s = g.publish();
        assert_eq!(s.dependency_distance("a:w", "a:y", 4), Some(1));
        assert_eq!(s.dependency_distance("a:w", "a:w", 4), Some(0));
        // Sequence edges do not carry dependency paths.
        assert_eq!(s.dependency_distance("a:w", "a:x", 4), None);
    }

    #[test]
    fn test_capability_edges_weighting() {
        let mut g = seeded_graph();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        g.upsert_capability(make_capability(c1, vec![Member::Tool("a:w".to_string())]))
            .unwrap();
        g.upsert_capability(make_capability(c2, vec![Member::Tool("a:x".to_string())]))
            .unwrap();
        g.add_edge(
            &c1.to_string(),
            &c2.to_string(),
            EdgeKind::Dependency,
            EdgeSource::Observed,
            1.0,
            4,
        )
        .unwrap();
        let s = g.publish();
        let cap_edges = s.capability_edges(false);
        // contains edges to tools are tool-capability, not cap-cap.
        assert_eq!(cap_edges.len(), 1);
        let (_, _, kind, confidence) = &cap_edges[0];
        assert_eq!(*kind, EdgeKind::Dependency);
        // confidence after 4 observations is 4/7.
        assert!((confidence - 4.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_cell_swap() {
        let mut g = seeded_graph();
        let cell = SnapshotCell::new(g.publish());
        let held = cell.load();
        g.upsert_tool("a:late", "late", unit_embedding(6)).unwrap();
        cell.store(g.publish());
        assert_eq!(held.node_count(), 4);
        assert_eq!(cell.load().node_count(), 5);
    }
}
