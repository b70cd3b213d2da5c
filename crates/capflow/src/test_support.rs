// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Test doubles shared by unit and integration tests.
//!
//! Enabled for this crate's own tests and for downstream crates via the
//! `testing` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

use crate::capability::CapabilityId;
use crate::constants::EMBEDDING_DIM;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::storage::{
    CapabilityRegistry, RegistryRecord, Storage, StorageSnapshot, ToolMeta, ToolRepository,
};
use crate::tensor::l2_normalize;
use crate::trace::{DecisionRecord, ExecutionTrace};

/// Deterministic embedder: hashes the text into a pseudo-random unit
/// vector, so equal texts embed equally and tests need no model.
pub struct MockEmbedder {
    dimension: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// The embedding `encode` would produce, synchronously.
    #[must_use]
    pub fn embedding_for(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let hash = hasher.finish();

        let mut embedding = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let val = ((hash.wrapping_mul(i as u64 + 1)) % 1000) as f32 / 1000.0;
            embedding.push(val * 2.0 - 1.0);
        }
        l2_normalize(&mut embedding);
        embedding
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embedding_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}

/// An embedder that returns a fixed vector per exact text, for scenario
/// tests that need controlled geometry.
#[derive(Default)]
pub struct FixedEmbedder {
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl FixedEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the embedding for a text; it is normalized on insert.
    pub fn set(&self, text: &str, mut embedding: Vec<f32>) {
        embedding.resize(EMBEDDING_DIM, 0.0);
        l2_normalize(&mut embedding);
        self.entries.lock().insert(text.to_string(), embedding);
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(v) = self.entries.lock().get(text) {
            return Ok(v.clone());
        }
        // Unregistered texts hash deterministically like MockEmbedder.
        Ok(MockEmbedder::default().embedding_for(text))
    }

    fn model_name(&self) -> &str {
        "fixed-embedder"
    }
}

/// In-memory [`Storage`] with inspectable side effects.
#[derive(Default)]
pub struct MemoryStorage {
    structure: Mutex<StorageSnapshot>,
    params: Mutex<HashMap<String, String>>,
    traces: Mutex<Vec<ExecutionTrace>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    metrics: Mutex<Vec<(String, f64, JsonValue)>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the structural rows `load_structure` returns.
    #[must_use]
    pub fn with_structure(structure: StorageSnapshot) -> Self {
        Self {
            structure: Mutex::new(structure),
            ..Default::default()
        }
    }

    /// Replace the structural rows (simulates upstream writes).
    pub fn set_structure(&self, structure: StorageSnapshot) {
        *self.structure.lock() = structure;
    }

    /// Persisted decision records, in order.
    #[must_use]
    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.lock().clone()
    }

    /// Persisted traces, in order.
    #[must_use]
    pub fn traces(&self) -> Vec<ExecutionTrace> {
        self.traces.lock().clone()
    }

    /// The stored params blob for a user.
    #[must_use]
    pub fn params_for(&self, user_id: &str) -> Option<String> {
        self.params.lock().get(user_id).cloned()
    }

    /// Recorded metric points.
    #[must_use]
    pub fn metrics(&self) -> Vec<(String, f64, JsonValue)> {
        self.metrics.lock().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_structure(&self) -> Result<StorageSnapshot> {
        Ok(self.structure.lock().clone())
    }

    async fn save_params(&self, user_id: &str, blob: &str) -> Result<()> {
        self.params
            .lock()
            .insert(user_id.to_string(), blob.to_string());
        Ok(())
    }

    async fn load_params(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.params.lock().get(user_id).cloned())
    }

    async fn append_trace(&self, trace: &ExecutionTrace) -> Result<()> {
        self.traces.lock().push(trace.clone());
        Ok(())
    }

    async fn load_traces(&self, limit: usize) -> Result<Vec<ExecutionTrace>> {
        let traces = self.traces.lock();
        let mut out: Vec<ExecutionTrace> = traces.iter().rev().take(limit).cloned().collect();
        out.reverse();
        Ok(out)
    }

    async fn update_trace_priorities(&self, ids: &[Uuid], priorities: &[f64]) -> Result<()> {
        let mut traces = self.traces.lock();
        for (id, priority) in ids.iter().zip(priorities.iter()) {
            if let Some(trace) = traces.iter_mut().find(|t| &t.id == id) {
                trace.priority = *priority;
            }
        }
        Ok(())
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.decisions.lock().push(record.clone());
        Ok(())
    }

    async fn append_metric(&self, name: &str, value: f64, metadata: JsonValue) -> Result<()> {
        self.metrics
            .lock()
            .push((name.to_string(), value, metadata));
        Ok(())
    }
}

/// In-memory tool repository.
#[derive(Default)]
pub struct MemoryToolRepository {
    tools: Mutex<HashMap<String, ToolMeta>>,
}

impl MemoryToolRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: ToolMeta) {
        self.tools.lock().insert(meta.id.clone(), meta);
    }
}

#[async_trait]
impl ToolRepository for MemoryToolRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<ToolMeta>> {
        Ok(self.tools.lock().get(id).cloned())
    }
}

/// In-memory capability registry.
#[derive(Default)]
pub struct MemoryRegistry {
    records: Mutex<HashMap<CapabilityId, RegistryRecord>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: CapabilityId, record: RegistryRecord) {
        self.records.lock().insert(id, record);
    }
}

#[async_trait]
impl CapabilityRegistry for MemoryRegistry {
    async fn get_by_workflow_pattern_id(&self, id: &CapabilityId) -> Result<Option<RegistryRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_deterministic_and_normalized() {
        let embedder = MockEmbedder::default();
        let a = embedder.encode("fetch users").await.unwrap();
        let b = embedder.encode("fetch users").await.unwrap();
        assert_eq!(a, b);
        assert!(crate::embeddings::is_normalized(&a));
        let c = embedder.encode("send mail").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_fixed_embedder_overrides() {
        let embedder = FixedEmbedder::new();
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = 0.9;
        v[1] = 0.1;
        embedder.set("fetch users", v);
        let out = embedder.encode("fetch users").await.unwrap();
        assert!(out[0] > 0.9);
        assert!(crate::embeddings::is_normalized(&out));
    }

    #[tokio::test]
    async fn test_memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        storage.save_params("u1", "{\"blob\":1}").await.unwrap();
        assert_eq!(
            storage.load_params("u1").await.unwrap().as_deref(),
            Some("{\"blob\":1}")
        );
        let trace = ExecutionTrace::new("x", vec![1.0, 0.0], true);
        let id = trace.id;
        storage.append_trace(&trace).await.unwrap();
        storage.update_trace_priorities(&[id], &[0.9]).await.unwrap();
        assert!((storage.traces()[0].priority - 0.9).abs() < 1e-12);
    }
}
