// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Spectral clustering over the tool/capability bipartite structure.
//!
//! The manager owns the adjacency matrix, the eigen-embedding, and a single
//! TTL-cached model keyed by the exact membership of the graph. It supplies
//! three structural signals to the rest of the engine: cluster-membership
//! boosts, hypergraph PageRank, and the spectral embedding rows the
//! local-alpha calculator compares against semantic embeddings.

mod kmeans;
mod laplacian;
mod pagerank;

pub use kmeans::{kmeans_pp, KMeansResult};
pub use laplacian::{eigengap_k, jacobi_eigen, normalized_laplacian, EigenDecomposition, SymMatrix};
pub use pagerank::pagerank;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::capability::ToolId;
use crate::config::ClusterConfig;
use crate::graph::EdgeKind;

/// One capability as the clustering manager sees it.
#[derive(Debug, Clone)]
pub struct CapabilityNode {
    /// Capability node key (uuid string).
    pub id: String,
    /// Direct tool members.
    pub tools: Vec<ToolId>,
}

/// Inputs to one clustering run. Deterministic given this plus the seed.
#[derive(Debug, Clone, Default)]
pub struct SpectralInput {
    pub tools: Vec<ToolId>,
    pub capabilities: Vec<CapabilityNode>,
    /// Capability-capability edges as `(from, to, kind, confidence)`.
    pub cap_edges: Vec<(String, String, EdgeKind, f64)>,
}

impl SpectralInput {
    fn cache_key(&self) -> u64 {
        let mut tools = self.tools.clone();
        tools.sort();
        let mut caps: Vec<&String> = self.capabilities.iter().map(|c| &c.id).collect();
        caps.sort();
        let mut hasher = DefaultHasher::new();
        tools.hash(&mut hasher);
        caps.hash(&mut hasher);
        hasher.finish()
    }
}

/// A computed spectral model: embeddings, clusters, PageRank.
#[derive(Debug, Clone)]
pub struct SpectralModel {
    /// Node keys in matrix order: sorted tools, then sorted capabilities.
    pub node_keys: Vec<String>,
    index: HashMap<String, usize>,
    /// Symmetric adjacency the model was computed from.
    pub adjacency: SymMatrix,
    /// Per-node spectral embedding rows (n x k).
    pub embedding: Vec<Vec<f64>>,
    /// Cluster label per node key.
    pub labels: HashMap<String, usize>,
    pub num_clusters: usize,
    /// Hypergraph PageRank per node key, in [0, 1].
    pub pagerank: HashMap<String, f64>,
    pub eigenvalues: Vec<f64>,
    cap_tools: HashMap<String, Vec<ToolId>>,
}

impl SpectralModel {
    /// Cluster label for a node key.
    #[must_use]
    pub fn cluster_of(&self, key: &str) -> Option<usize> {
        self.labels.get(key).copied()
    }

    /// Spectral embedding row for a node key.
    #[must_use]
    pub fn embedding_of(&self, key: &str) -> Option<&[f64]> {
        self.index.get(key).map(|&i| self.embedding[i].as_slice())
    }

    /// PageRank for a node key; 0 for unknown nodes.
    #[must_use]
    pub fn pagerank_of(&self, key: &str) -> f64 {
        self.pagerank.get(key).copied().unwrap_or(0.0)
    }

    /// The majority cluster over a set of context tools, with its share of
    /// the context.
    #[must_use]
    pub fn active_cluster(&self, context_tools: &[ToolId]) -> Option<(usize, f64)> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        let mut known = 0usize;
        for tool in context_tools {
            if let Some(cluster) = self.cluster_of(tool) {
                *counts.entry(cluster).or_default() += 1;
                known += 1;
            }
        }
        if known == 0 {
            return None;
        }
        counts
            .into_iter()
            .max_by_key(|&(cluster, count)| (count, std::cmp::Reverse(cluster)))
            .map(|(cluster, count)| (cluster, count as f64 / known as f64))
    }

    /// Community boost for a capability given context tools: 0.5 when the
    /// capability sits in the active cluster, otherwise a quarter of the
    /// fraction of its member tools that do, otherwise 0.
    #[must_use]
    pub fn community_boost(&self, capability_key: &str, context_tools: &[ToolId]) -> f64 {
        let Some((active, _)) = self.active_cluster(context_tools) else {
            return 0.0;
        };
        if self.cluster_of(capability_key) == Some(active) {
            return 0.5;
        }
        let Some(tools) = self.cap_tools.get(capability_key) else {
            return 0.0;
        };
        if tools.is_empty() {
            return 0.0;
        }
        let in_active = tools
            .iter()
            .filter(|t| self.cluster_of(t) == Some(active))
            .count();
        0.25 * (in_active as f64 / tools.len() as f64)
    }

    /// Heat diffusion seeded from a context set: `steps` Euler iterations of
    /// `h <- h + rate * (A_norm h - h)` over the degree-normalized
    /// adjacency. Returns per-node heat keyed like the model.
    #[must_use]
    pub fn heat_diffusion(&self, seeds: &[String], steps: usize, rate: f64) -> HashMap<String, f64> {
        let n = self.node_keys.len();
        if n == 0 {
            return HashMap::new();
        }
        let mut heat = vec![0.0f64; n];
        let mut seeded = false;
        for s in seeds {
            if let Some(&i) = self.index.get(s) {
                heat[i] = 1.0;
                seeded = true;
            }
        }
        if !seeded {
            return HashMap::new();
        }
        let degrees = self.adjacency.degrees();
        for _ in 0..steps {
            let mut next = heat.clone();
            for i in 0..n {
                if degrees[i] <= 0.0 {
                    continue;
                }
                let mut neighbor_mass = 0.0;
                for j in 0..n {
                    let w = self.adjacency.get(i, j);
                    if w > 0.0 {
                        neighbor_mass += w * heat[j] / degrees[i];
                    }
                }
                next[i] = heat[i] + rate * (neighbor_mass - heat[i]);
            }
            heat = next;
        }
        self.node_keys
            .iter()
            .cloned()
            .zip(heat)
            .filter(|(_, h)| *h > 0.0)
            .collect()
    }

    fn empty() -> Self {
        Self {
            node_keys: Vec::new(),
            index: HashMap::new(),
            adjacency: SymMatrix::zeros(0),
            embedding: Vec::new(),
            labels: HashMap::new(),
            num_clusters: 0,
            pagerank: HashMap::new(),
            eigenvalues: Vec::new(),
            cap_tools: HashMap::new(),
        }
    }
}

struct CacheEntry {
    key: u64,
    created: Instant,
    model: Arc<SpectralModel>,
}

/// Cache statistics for the telemetry counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1]; 0 when never queried.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The clustering manager: owns the single cached model.
pub struct SpectralManager {
    config: ClusterConfig,
    cache: Mutex<Option<CacheEntry>>,
    stats: Mutex<CacheStats>,
}

impl SpectralManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(None),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Compute (or fetch from cache) the spectral model for an input.
    pub fn model_for(&self, input: &SpectralInput) -> Arc<SpectralModel> {
        let key = input.cache_key();
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.key == key && entry.created.elapsed() < self.config.cache_ttl {
                    self.stats.lock().hits += 1;
                    return Arc::clone(&entry.model);
                }
            }
        }
        self.stats.lock().misses += 1;
        let model = Arc::new(self.compute(input));
        *self.cache.lock() = Some(CacheEntry {
            key,
            created: Instant::now(),
            model: Arc::clone(&model),
        });
        model
    }

    /// Drop the cached entry.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    /// Cache statistics since startup.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    /// Run the full pipeline: adjacency, Laplacian, eigendecomposition,
    /// eigengap k, k-means++, PageRank.
    fn compute(&self, input: &SpectralInput) -> SpectralModel {
        let mut tools = input.tools.clone();
        tools.sort();
        tools.dedup();
        let mut caps = input.capabilities.clone();
        caps.sort_by(|a, b| a.id.cmp(&b.id));
        caps.dedup_by(|a, b| a.id == b.id);

        let n = tools.len() + caps.len();
        if n == 0 {
            return SpectralModel::empty();
        }

        let mut node_keys: Vec<String> = tools.clone();
        node_keys.extend(caps.iter().map(|c| c.id.clone()));
        let index: HashMap<String, usize> = node_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();

        // Quasi-bipartite adjacency: tool<->capability membership plus
        // weighted capability<->capability edges.
        let mut adjacency = SymMatrix::zeros(n);
        for cap in &caps {
            let Some(&ci) = index.get(&cap.id) else { continue };
            for tool in &cap.tools {
                if let Some(&ti) = index.get(tool) {
                    adjacency.add_sym(ti, ci, 1.0);
                }
            }
        }
        for (from, to, kind, confidence) in &input.cap_edges {
            if let (Some(&i), Some(&j)) = (index.get(from), index.get(to)) {
                adjacency.add_sym(i, j, kind.spectral_weight() * confidence);
            }
        }

        let laplacian = normalized_laplacian(&adjacency);
        let eigen = jacobi_eigen(&laplacian);
        let k = self
            .config
            .num_clusters
            .unwrap_or_else(|| eigengap_k(&eigen.eigenvalues))
            .min(n.max(1));

        // Row embedding from the k smallest-eigenvalue eigenvectors.
        let embedding: Vec<Vec<f64>> = (0..n)
            .map(|row| (0..k.min(eigen.vectors.len())).map(|v| eigen.vectors[v][row]).collect())
            .collect();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let clustering = kmeans_pp(&embedding, k, &mut rng);
        let labels: HashMap<String, usize> = node_keys
            .iter()
            .cloned()
            .zip(clustering.labels.iter().copied())
            .collect();

        // Directed PageRank rows: the symmetric adjacency contributes both
        // directions; dependency/contains capability edges add directed
        // mass scaled by confidence.
        let mut out_weights: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                let w = adjacency.get(i, j);
                if w > 0.0 {
                    out_weights[i].push((j, w));
                }
            }
        }
        for (from, to, kind, confidence) in &input.cap_edges {
            if !matches!(kind, EdgeKind::Dependency | EdgeKind::Contains) {
                continue;
            }
            if let (Some(&i), Some(&j)) = (index.get(from), index.get(to)) {
                out_weights[i].push((j, *confidence));
            }
        }
        let ranks = pagerank(&out_weights);
        let pagerank_map: HashMap<String, f64> = node_keys
            .iter()
            .cloned()
            .zip(ranks.iter().copied())
            .collect();

        debug!(
            nodes = n,
            clusters = clustering.centroids.len(),
            iterations = clustering.iterations,
            "spectral model computed"
        );

        SpectralModel {
            node_keys,
            index,
            adjacency,
            embedding,
            labels,
            num_clusters: clustering.centroids.len(),
            pagerank: pagerank_map,
            eigenvalues: eigen.eigenvalues,
            cap_tools: caps.into_iter().map(|c| (c.id, c.tools)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_community_input() -> SpectralInput {
        SpectralInput {
            tools: vec![
                "fs:read".into(),
                "fs:write".into(),
                "net:get".into(),
                "net:post".into(),
            ],
            capabilities: vec![
                CapabilityNode {
                    id: "cap-files".into(),
                    tools: vec!["fs:read".into(), "fs:write".into()],
                },
                CapabilityNode {
                    id: "cap-http".into(),
                    tools: vec!["net:get".into(), "net:post".into()],
                },
            ],
            cap_edges: Vec::new(),
        }
    }

    #[test]
    fn test_empty_input_empty_model() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let model = manager.model_for(&SpectralInput::default());
        assert!(model.labels.is_empty());
        assert!(model.pagerank.is_empty());
        assert_eq!(model.num_clusters, 0);
    }

    #[test]
    fn test_two_communities_separate() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let model = manager.model_for(&two_community_input());
        // Each tool clusters with its capability.
        assert_eq!(model.cluster_of("fs:read"), model.cluster_of("cap-files"));
        assert_eq!(model.cluster_of("net:get"), model.cluster_of("cap-http"));
        assert_ne!(model.cluster_of("fs:read"), model.cluster_of("net:post"));
    }

    #[test]
    fn test_pagerank_in_unit_interval() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let model = manager.model_for(&two_community_input());
        for key in &model.node_keys {
            let pr = model.pagerank_of(key);
            assert!((0.0..=1.0).contains(&pr), "{key} rank {pr}");
        }
    }

    #[test]
    fn test_community_boost() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let model = manager.model_for(&two_community_input());
        let context = vec!["fs:read".to_string(), "fs:write".to_string()];
        let same = model.community_boost("cap-files", &context);
        assert!((same - 0.5).abs() < 1e-12);
        let other = model.community_boost("cap-http", &context);
        assert!(other < 0.5);
        assert!(model.community_boost("cap-files", &[]).abs() < 1e-12);
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let input = two_community_input();
        let a = manager.model_for(&input);
        let b = manager.model_for(&input);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.cache_stats().hits, 1);
        manager.invalidate();
        let c = manager.model_for(&input);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.cache_stats().misses, 2);
    }

    #[test]
    fn test_cache_keyed_by_membership() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let input = two_community_input();
        let a = manager.model_for(&input);
        let mut grown = input.clone();
        grown.tools.push("db:query".into());
        let b = manager.model_for(&grown);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_heat_diffusion_spreads_from_seed() {
        let manager = SpectralManager::new(ClusterConfig::default());
        let model = manager.model_for(&two_community_input());
        let heat = model.heat_diffusion(&["fs:read".to_string()], 10, 0.1);
        let seed_heat = heat.get("fs:read").copied().unwrap_or(0.0);
        let near = heat.get("cap-files").copied().unwrap_or(0.0);
        let far = heat.get("net:post").copied().unwrap_or(0.0);
        assert!(seed_heat > near);
        assert!(near > far);
    }

    #[test]
    fn test_deterministic_given_seed() {
        let manager_a = SpectralManager::new(ClusterConfig::default());
        let manager_b = SpectralManager::new(ClusterConfig::default());
        let input = two_community_input();
        let a = manager_a.model_for(&input);
        let b = manager_b.model_for(&input);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.num_clusters, b.num_clusters);
    }
}
