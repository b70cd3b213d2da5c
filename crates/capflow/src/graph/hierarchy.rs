// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hierarchy levels and containment matrices.
//!
//! Levels are derived, never stored as ground truth: a capability with no
//! capability members sits at level 0, and every other capability sits one
//! above its deepest capability member. Tools live conceptually at level -1.
//! Containment matrices are the sparse child-by-parent indicators the
//! attention model uses to mask multi-level message passing; they are
//! refreshed atomically with the level map.

use petgraph::Direction as PetDirection;
use std::collections::{HashMap, VecDeque};

use super::{EdgeKind, NodeData, ToolGraph};
use petgraph::visit::EdgeRef;

/// Sparse child-by-parent containment indicator between two adjacent
/// hierarchy levels.
#[derive(Debug, Clone, Default)]
pub struct ContainmentMatrix {
    /// Child node keys (rows), sorted.
    pub child_ids: Vec<String>,
    /// Parent node keys (columns), sorted.
    pub parent_ids: Vec<String>,
    /// `(child_row, parent_col)` membership pairs.
    pub pairs: Vec<(usize, usize)>,
    /// Row lookup per child key.
    pub child_index: HashMap<String, usize>,
    /// Column lookup per parent key.
    pub parent_index: HashMap<String, usize>,
}

impl ContainmentMatrix {
    /// Child rows for one parent column.
    #[must_use]
    pub fn children_of(&self, parent_col: usize) -> Vec<usize> {
        self.pairs
            .iter()
            .filter(|(_, p)| *p == parent_col)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Parent columns for one child row.
    #[must_use]
    pub fn parents_of(&self, child_row: usize) -> Vec<usize> {
        self.pairs
            .iter()
            .filter(|(c, _)| *c == child_row)
            .map(|(_, p)| *p)
            .collect()
    }

    /// True when the matrix has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl ToolGraph {
    /// Recompute every capability's hierarchy level with a Kahn traversal
    /// over `contains` edges, children before parents. O(V + E).
    ///
    /// The store's level map and each capability record's
    /// `hierarchy_level` are updated together.
    pub fn recompute_hierarchy_levels(&mut self) {
        // Capability -> capability-member adjacency, restricted to contains.
        let mut cap_children: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending_children: HashMap<String, usize> = HashMap::new();
        let mut parents_of: HashMap<String, Vec<String>> = HashMap::new();

        for (key, &idx) in &self.ids {
            let Some(NodeData::Capability(_)) = self.graph.node_weight(idx) else {
                continue;
            };
            let mut children = Vec::new();
            for edge in self.graph.edges_directed(idx, PetDirection::Outgoing) {
                if edge.weight().kind != EdgeKind::Contains {
                    continue;
                }
                if let Some(NodeData::Capability(child)) = self.graph.node_weight(edge.target()) {
                    let child_key = child.id.to_string();
                    parents_of.entry(child_key.clone()).or_default().push(key.clone());
                    children.push(child_key);
                }
            }
            pending_children.insert(key.clone(), children.len());
            cap_children.insert(key.clone(), children);
        }

        let mut levels: HashMap<String, usize> = HashMap::new();
        let mut queue: VecDeque<String> = pending_children
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(k, _)| k.clone())
            .collect();

        while let Some(key) = queue.pop_front() {
            let level = cap_children
                .get(&key)
                .map(|children| {
                    children
                        .iter()
                        .filter_map(|c| levels.get(c))
                        .map(|&l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            levels.insert(key.clone(), level);
            if let Some(parents) = parents_of.get(&key) {
                for parent in parents {
                    if let Some(n) = pending_children.get_mut(parent) {
                        *n -= 1;
                        if *n == 0 {
                            queue.push_back(parent.clone());
                        }
                    }
                }
            }
        }

        for (key, level) in &levels {
            if let Some(&idx) = self.ids.get(key) {
                if let Some(NodeData::Capability(c)) = self.graph.node_weight_mut(idx) {
                    c.hierarchy_level = *level;
                }
            }
        }
        self.levels = levels;
    }

    /// Highest capability level present, if any capability exists.
    #[must_use]
    pub fn max_level(&self) -> Option<usize> {
        self.levels.values().copied().max()
    }

    /// Build the sparse child-by-parent containment matrix for one level
    /// boundary.
    ///
    /// `level_k = -1` yields the tool-to-level-0 incidence matrix; any
    /// `level_k >= 0` yields capabilities at `level_k` against capabilities
    /// at `level_k + 1`. Rows and columns are id-sorted for determinism.
    #[must_use]
    pub fn build_containment_matrix(&self, level_k: isize) -> ContainmentMatrix {
        let parent_level = (level_k + 1) as usize;

        let mut parent_ids: Vec<String> = self
            .levels
            .iter()
            .filter(|(_, &l)| l == parent_level)
            .map(|(k, _)| k.clone())
            .collect();
        parent_ids.sort();

        let mut child_ids: Vec<String> = if level_k < 0 {
            self.tools().iter().map(|t| t.id.clone()).collect()
        } else {
            let child_level = level_k as usize;
            let mut ids: Vec<String> = self
                .levels
                .iter()
                .filter(|(_, &l)| l == child_level)
                .map(|(k, _)| k.clone())
                .collect();
            ids.sort();
            ids
        };
        child_ids.sort();

        let child_index: HashMap<String, usize> = child_ids
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        let parent_index: HashMap<String, usize> = parent_ids
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();

        let mut pairs = Vec::new();
        for (parent_key, &pcol) in &parent_index {
            let Some(&pidx) = self.ids.get(parent_key) else {
                continue;
            };
            for edge in self.graph.edges_directed(pidx, PetDirection::Outgoing) {
                if edge.weight().kind != EdgeKind::Contains {
                    continue;
                }
                if let Some(child) = self.graph.node_weight(edge.target()) {
                    if let Some(&crow) = child_index.get(&child.key()) {
                        pairs.push((crow, pcol));
                    }
                }
            }
        }
        pairs.sort_unstable();
        pairs.dedup();

        ContainmentMatrix {
            child_ids,
            parent_ids,
            pairs,
            child_index,
            parent_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{make_capability, unit_embedding};
    use super::*;
    use crate::capability::Member;
    use uuid::Uuid;

    #[test]
    fn test_incidence_matrix_tools_to_level0() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("fs:read", "r", unit_embedding(0)).unwrap();
        g.upsert_tool("fs:write", "w", unit_embedding(1)).unwrap();
        let cap = Uuid::new_v4();
        g.upsert_capability(make_capability(
            cap,
            vec![
                Member::Tool("fs:read".to_string()),
                Member::Tool("fs:write".to_string()),
            ],
        ))
        .unwrap();

        let m = g.build_containment_matrix(-1);
        assert_eq!(m.child_ids, vec!["fs:read", "fs:write"]);
        assert_eq!(m.parent_ids, vec![cap.to_string()]);
        assert_eq!(m.pairs.len(), 2);
        assert_eq!(m.children_of(0).len(), 2);
    }

    #[test]
    fn test_level_boundary_matrix() {
        let mut g = ToolGraph::new(false);
        g.upsert_tool("fs:read", "r", unit_embedding(0)).unwrap();
        let leaf_a = Uuid::new_v4();
        let leaf_b = Uuid::new_v4();
        let parent = Uuid::new_v4();
        g.upsert_capability(make_capability(
            leaf_a,
            vec![Member::Tool("fs:read".to_string())],
        ))
        .unwrap();
        g.upsert_capability(make_capability(
            leaf_b,
            vec![Member::Tool("fs:read".to_string())],
        ))
        .unwrap();
        g.upsert_capability(make_capability(
            parent,
            vec![Member::Capability(leaf_a), Member::Capability(leaf_b)],
        ))
        .unwrap();

        let m = g.build_containment_matrix(0);
        assert_eq!(m.parent_ids, vec![parent.to_string()]);
        assert_eq!(m.pairs.len(), 2);
        let row_a = m.child_index[&leaf_a.to_string()];
        assert_eq!(m.parents_of(row_a), vec![0]);
    }

    #[test]
    fn test_empty_boundary_is_empty() {
        let g = ToolGraph::new(false);
        assert!(g.build_containment_matrix(-1).is_empty());
        assert!(g.build_containment_matrix(3).is_empty());
    }

    #[test]
    fn test_levels_mixed_membership() {
        // top contains {mid, leaf}; mid contains {leaf}; leaf contains tools only.
        let mut g = ToolGraph::new(false);
        g.upsert_tool("a:t", "t", unit_embedding(0)).unwrap();
        let leaf = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let top = Uuid::new_v4();
        g.upsert_capability(make_capability(leaf, vec![Member::Tool("a:t".to_string())]))
            .unwrap();
        g.upsert_capability(make_capability(
            mid,
            vec![Member::Capability(leaf), Member::Tool("a:t".to_string())],
        ))
        .unwrap();
        g.upsert_capability(make_capability(
            top,
            vec![Member::Capability(mid), Member::Capability(leaf)],
        ))
        .unwrap();
        assert_eq!(g.max_level(), Some(2));
        assert_eq!(g.level_of(&mid.to_string()), Some(1));
    }
}
