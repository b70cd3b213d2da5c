// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Storage-facing interfaces.
//!
//! The engine consumes narrow async traits; the concrete backend (see the
//! `capflow-postgres` crate) stays out of the core. Row structs mirror the
//! storage schema: tools, dependencies, capabilities, contains edges,
//! workflow patterns, SHGAT params keyed by user id, execution traces, and
//! append-only metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::capability::{Capability, CapabilityId, ToolId};
use crate::error::Result;
use crate::graph::{EdgeKind, EdgeSource};
use crate::trace::{DecisionRecord, ExecutionTrace};

/// A stored tool row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRow {
    pub id: ToolId,
    pub server_id: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

/// A stored edge row (dependencies, sequences, provides, contains).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRow {
    pub from_id: String,
    pub to_id: String,
    pub kind: EdgeKind,
    pub source: EdgeSource,
    pub weight: f64,
    pub observed_count: u64,
    pub confidence: f64,
}

/// A stored workflow pattern row: the learned shape behind a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPatternRow {
    pub id: Uuid,
    pub tools_used: Vec<ToolId>,
    pub structure: JsonValue,
    pub observed_count: u64,
}

/// Everything the sync controller pulls per cycle.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub tools: Vec<ToolRow>,
    pub capabilities: Vec<Capability>,
    pub edges: Vec<EdgeRow>,
    pub workflow_patterns: Vec<WorkflowPatternRow>,
}

/// Persistent storage consumed by the engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the full structural state (tools, capabilities, edges,
    /// patterns) for graph sync.
    async fn load_structure(&self) -> Result<StorageSnapshot>;

    /// Persist a params blob for a user.
    async fn save_params(&self, user_id: &str, blob: &str) -> Result<()>;

    /// Load the latest params blob for a user.
    async fn load_params(&self, user_id: &str) -> Result<Option<String>>;

    /// Append an execution trace.
    async fn append_trace(&self, trace: &ExecutionTrace) -> Result<()>;

    /// Load recent traces, newest first, up to `limit`.
    async fn load_traces(&self, limit: usize) -> Result<Vec<ExecutionTrace>>;

    /// Write trace priorities back after training.
    async fn update_trace_priorities(&self, ids: &[Uuid], priorities: &[f64]) -> Result<()>;

    /// Append a decision-log record. Fire-and-forget semantics: failures
    /// are logged, never surfaced to discovery callers.
    async fn append_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// Append one metric point.
    async fn append_metric(&self, name: &str, value: f64, metadata: JsonValue) -> Result<()>;
}

/// Tool metadata as the tool repository serves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeta {
    pub id: ToolId,
    pub server_id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
}

/// Read-side tool repository.
#[async_trait]
pub trait ToolRepository: Send + Sync {
    /// Look up one tool's metadata.
    async fn find_by_id(&self, id: &str) -> Result<Option<ToolMeta>>;

    /// Batch lookup; missing ids are simply absent from the result.
    async fn find_by_ids(&self, ids: &[ToolId]) -> Result<Vec<ToolMeta>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(meta) = self.find_by_id(id).await? {
                out.push(meta);
            }
        }
        Ok(out)
    }
}

/// A capability-registry record resolving callable names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub namespace: String,
    pub action: String,
    pub fqdn: String,
    pub workflow_pattern_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
}

impl RegistryRecord {
    /// The `namespace:action` call name.
    #[must_use]
    pub fn call_name(&self) -> String {
        format!("{}:{}", self.namespace, self.action)
    }
}

/// Read-side capability registry.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Resolve a capability's registry record by its workflow pattern id.
    async fn get_by_workflow_pattern_id(&self, id: &CapabilityId) -> Result<Option<RegistryRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_record_call_name() {
        let record = RegistryRecord {
            namespace: "files".into(),
            action: "sync".into(),
            fqdn: "acme.flow.files.sync.ab12".into(),
            workflow_pattern_id: Uuid::new_v4(),
            input_schema: None,
        };
        assert_eq!(record.call_name(), "files:sync");
    }

    #[test]
    fn test_edge_row_serde() {
        let row = EdgeRow {
            from_id: "a:x".into(),
            to_id: "a:y".into(),
            kind: EdgeKind::Dependency,
            source: EdgeSource::Observed,
            weight: 1.0,
            observed_count: 4,
            confidence: 0.57,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"dependency\""));
        let back: EdgeRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
