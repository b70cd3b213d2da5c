// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cosine top-K vector index over tools and capabilities.
//!
//! Exact scan rather than an ANN structure: correctness here is defined
//! only by the returned scores being cosine similarities clipped to
//! [-1, 1] and sorted descending, and the catalog sizes this engine serves
//! (thousands of tools, not millions of documents) keep the scan cheap.
//! Entries and the store behind them are refreshed by the sync controller.

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::tensor::cosine;

/// One indexed entry.
#[derive(Debug, Clone)]
struct IndexEntry {
    id: String,
    embedding: Vec<f32>,
    meta: JsonValue,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    /// Entry id (tool id or capability uuid string).
    pub id: String,
    /// Cosine similarity, clipped to [-1, 1].
    pub score: f32,
    /// Metadata persisted alongside the embedding.
    pub meta: JsonValue,
}

/// Exact cosine index with separate tool and capability namespaces.
#[derive(Default)]
pub struct VectorIndex {
    tools: RwLock<Namespace>,
    capabilities: RwLock<Namespace>,
}

#[derive(Default)]
struct Namespace {
    entries: Vec<IndexEntry>,
    by_id: HashMap<String, usize>,
}

impl Namespace {
    fn upsert(&mut self, id: &str, embedding: Vec<f32>, meta: JsonValue) {
        match self.by_id.get(id) {
            Some(&i) => {
                self.entries[i].embedding = embedding;
                self.entries[i].meta = meta;
            }
            None => {
                self.by_id.insert(id.to_string(), self.entries.len());
                self.entries.push(IndexEntry {
                    id: id.to_string(),
                    embedding,
                    meta,
                });
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(i) = self.by_id.remove(id) {
            self.entries.swap_remove(i);
            if i < self.entries.len() {
                self.by_id.insert(self.entries[i].id.clone(), i);
            }
        }
    }

    fn search(&self, query: &[f32], k: usize, min_score: f32) -> Vec<VectorMatch> {
        if query.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut hits: Vec<VectorMatch> = self
            .entries
            .iter()
            .map(|e| VectorMatch {
                id: e.id.clone(),
                score: cosine(query, &e.embedding).clamp(-1.0, 1.0),
                meta: e.meta.clone(),
            })
            .filter(|m| m.score >= min_score)
            .collect();
        // Descending score; ascending id breaks ties deterministically.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        hits
    }
}

impl VectorIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a tool embedding.
    pub fn upsert_tool(&self, id: &str, embedding: Vec<f32>, meta: JsonValue) {
        self.tools.write().upsert(id, embedding, meta);
    }

    /// Insert or refresh a capability embedding.
    pub fn upsert_capability(&self, id: &str, embedding: Vec<f32>, meta: JsonValue) {
        self.capabilities.write().upsert(id, embedding, meta);
    }

    /// Remove a tool.
    pub fn remove_tool(&self, id: &str) {
        self.tools.write().remove(id);
    }

    /// Remove a capability.
    pub fn remove_capability(&self, id: &str) {
        self.capabilities.write().remove(id);
    }

    /// Cosine top-K over tools. An empty query yields an empty result; the
    /// orchestrator treats that as its own validation error.
    #[must_use]
    pub fn search_tools(&self, query: &[f32], k: usize, min_score: f32) -> Vec<VectorMatch> {
        self.tools.read().search(query, k, min_score)
    }

    /// Cosine top-K over capabilities.
    #[must_use]
    pub fn search_capabilities(&self, query: &[f32], k: usize, min_score: f32) -> Vec<VectorMatch> {
        self.capabilities.read().search(query, k, min_score)
    }

    /// Indexed tool count.
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.read().entries.len()
    }

    /// Indexed capability count.
    #[must_use]
    pub fn capability_count(&self) -> usize {
        self.capabilities.read().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(axis: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_search_orders_by_score_descending() {
        let index = VectorIndex::new();
        index.upsert_tool("fs:read", unit(0, 4), json!({}));
        index.upsert_tool("fs:write", unit(1, 4), json!({}));
        let mut q = vec![0.9, 0.1, 0.0, 0.0];
        crate::tensor::l2_normalize(&mut q);
        let hits = index.search_tools(&q, 10, -1.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "fs:read");
        assert!(hits[0].score > hits[1].score);
        assert!((hits[0].score - 0.9939).abs() < 1e-3);
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let index = VectorIndex::new();
        index.upsert_tool("fs:read", unit(0, 4), json!({}));
        assert!(index.search_tools(&[], 10, 0.0).is_empty());
    }

    #[test]
    fn test_min_score_filters() {
        let index = VectorIndex::new();
        index.upsert_tool("fs:read", unit(0, 4), json!({}));
        index.upsert_tool("fs:write", unit(1, 4), json!({}));
        let hits = index.search_tools(&unit(0, 4), 10, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "fs:read");
    }

    #[test]
    fn test_tie_breaks_by_ascending_id() {
        let index = VectorIndex::new();
        index.upsert_tool("b:tool", unit(0, 4), json!({}));
        index.upsert_tool("a:tool", unit(0, 4), json!({}));
        let hits = index.search_tools(&unit(0, 4), 10, 0.0);
        assert_eq!(hits[0].id, "a:tool");
        assert_eq!(hits[1].id, "b:tool");
    }

    #[test]
    fn test_upsert_replaces_embedding() {
        let index = VectorIndex::new();
        index.upsert_capability("cap-1", unit(0, 4), json!({"v": 1}));
        index.upsert_capability("cap-1", unit(1, 4), json!({"v": 2}));
        assert_eq!(index.capability_count(), 1);
        let hits = index.search_capabilities(&unit(1, 4), 1, 0.5);
        assert_eq!(hits[0].meta["v"], 2);
    }

    #[test]
    fn test_remove_swaps_index_consistently() {
        let index = VectorIndex::new();
        index.upsert_tool("a:1", unit(0, 4), json!({}));
        index.upsert_tool("a:2", unit(1, 4), json!({}));
        index.upsert_tool("a:3", unit(2, 4), json!({}));
        index.remove_tool("a:1");
        assert_eq!(index.tool_count(), 2);
        let hits = index.search_tools(&unit(2, 4), 1, 0.5);
        assert_eq!(hits[0].id, "a:3");
    }

    #[test]
    fn test_scores_clipped_to_unit_interval() {
        let index = VectorIndex::new();
        // Deliberately non-normalized entry; the clip guards rounding spill.
        index.upsert_tool("a:big", vec![10.0, 0.0], json!({}));
        let hits = index.search_tools(&[10.0, 0.0], 1, -1.0);
        assert!(hits[0].score <= 1.0);
    }
}
