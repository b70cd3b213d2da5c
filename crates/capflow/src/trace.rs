// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Execution traces and decision-log records.
//!
//! Traces are the training substrate: every executed workflow appends one,
//! the replay buffer samples them by priority, and the trainer writes
//! TD-error priorities back. Decision records are the audit substrate: one
//! per ranked candidate, emitted fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::capability::{CapabilityId, ToolId};
use crate::constants::INITIAL_TRACE_PRIORITY;

/// Outcome recorded at a decision node during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    /// Structure node where the branch was taken.
    pub node_id: String,
    /// Branch label or predicate result.
    pub outcome: String,
}

/// Result of one task-node execution inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub tool: ToolId,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub result: JsonValue,
    pub success: bool,
    pub duration_ms: u64,
    /// Execution layer index for parallel schedules.
    pub layer_index: usize,
}

/// One recorded workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub id: Uuid,
    /// Capability that was executed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    /// User tag carried with the trace; no policy beyond storage keying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub intent: String,
    /// L2-normalized intent embedding.
    pub intent_embedding: Vec<f32>,
    /// Structure node ids in execution order.
    pub executed_path: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<DecisionOutcome>,
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
    pub success: bool,
    pub duration_ms: u64,
    /// Replay priority in [0, 1]; 0.5 at cold start, |TD error| + epsilon
    /// after training.
    pub priority: f64,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionTrace {
    /// Build a trace with the cold-start priority.
    #[must_use]
    pub fn new(intent: impl Into<String>, intent_embedding: Vec<f32>, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability_id: None,
            user_id: None,
            intent: intent.into(),
            intent_embedding,
            executed_path: Vec::new(),
            decisions: Vec::new(),
            task_results: Vec::new(),
            success,
            duration_ms: 0,
            priority: INITIAL_TRACE_PRIORITY,
            recorded_at: Utc::now(),
        }
    }

    /// Attach the executed capability.
    #[must_use]
    pub fn with_capability(mut self, id: CapabilityId) -> Self {
        self.capability_id = Some(id);
        self
    }

    /// Attach a user tag.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach task results and derive the executed path from them.
    #[must_use]
    pub fn with_task_results(mut self, results: Vec<TaskResult>) -> Self {
        self.executed_path = results.iter().map(|r| r.task_id.clone()).collect();
        self.task_results = results;
        self
    }

    /// Tools used by this trace, in execution order, deduplicated.
    #[must_use]
    pub fn tools_used(&self) -> Vec<ToolId> {
        let mut out: Vec<ToolId> = Vec::new();
        for r in &self.task_results {
            if !out.contains(&r.tool) {
                out.push(r.tool.clone());
            }
        }
        out
    }
}

/// Which ranking algorithm produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingAlgorithm {
    Shgat,
    Hybrid,
    SemanticOnly,
    Keyword,
}

/// Discovery invocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// The agent asked for candidates.
    ActiveSearch,
    /// The engine volunteered a suggestion.
    PassiveSuggestion,
}

/// What kind of record was ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Tool,
    Capability,
}

/// Accept/reject verdict against the caller's threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// One decision-log record, emitted per ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub algorithm: RankingAlgorithm,
    pub mode: DiscoveryMode,
    pub target_type: TargetType,
    pub target_id: String,
    pub intent: String,
    /// Raw signal values that fed the final score.
    #[serde(default)]
    pub signals: JsonValue,
    /// Parameters in force (alpha, weights, thresholds).
    #[serde(default)]
    pub params: JsonValue,
    pub final_score: f32,
    pub threshold: f32,
    pub decision: Verdict,
    /// Correlates all records of one discovery request.
    pub correlation_id: Uuid,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}
