// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Core data model: tools, capabilities, membership, and static structure.
//!
//! A **tool** is an atomic externally-provided operation identified by
//! `"server:name"`. A **capability** is a learned, reusable workflow pattern
//! with a code snippet, an intent embedding, and reliability counters. A
//! capability's members may be tools or other capabilities, which is what
//! makes the graph a superhypergraph: hyperedges containing hyperedges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::constants::COLD_START_SUCCESS_RATE;
use crate::error::{CapflowError, Result};

/// Stable tool identifier, `"server:name"`.
pub type ToolId = String;

/// Capability identifier.
pub type CapabilityId = Uuid;

/// A member of a capability: either an atomic tool or a child capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Member {
    /// Atomic tool, by id.
    Tool(ToolId),
    /// Nested capability, by id.
    Capability(CapabilityId),
}

impl Member {
    /// The member's id as a graph-node key.
    #[must_use]
    pub fn node_key(&self) -> String {
        match self {
            Member::Tool(id) => id.clone(),
            Member::Capability(id) => id.to_string(),
        }
    }

    /// True for capability members.
    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, Member::Capability(_))
    }
}

/// How a capability came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySource {
    /// Discovered from repeated execution patterns.
    Emergent,
    /// Authored by hand.
    Manual,
}

/// Immutable five-part capability name: `org.project.namespace.action.hash4`.
///
/// `hash4` is the first 4 hex characters of SHA-256 over the normalized code
/// snippet, so changing the code changes the FQDN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fqdn {
    pub org: String,
    pub project: String,
    pub namespace: String,
    pub action: String,
    pub hash4: String,
}

impl Fqdn {
    /// Build an FQDN, deriving `hash4` from the code snippet.
    ///
    /// # Errors
    /// Returns `InvalidFqdn` if any part is empty or contains a dot.
    pub fn new(
        org: &str,
        project: &str,
        namespace: &str,
        action: &str,
        code_snippet: &str,
    ) -> Result<Self> {
        for (label, part) in [
            ("org", org),
            ("project", project),
            ("namespace", namespace),
            ("action", action),
        ] {
            if part.is_empty() {
                return Err(CapflowError::InvalidFqdn(format!("empty {label} part")));
            }
            if part.contains('.') {
                return Err(CapflowError::InvalidFqdn(format!(
                    "{label} part {part:?} contains '.'"
                )));
            }
        }
        Ok(Self {
            org: org.to_string(),
            project: project.to_string(),
            namespace: namespace.to_string(),
            action: action.to_string(),
            hash4: snippet_hash4(code_snippet),
        })
    }

    /// Parse a dotted FQDN string.
    ///
    /// # Errors
    /// Returns `InvalidFqdn` unless the string has exactly five non-empty parts.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
            return Err(CapflowError::InvalidFqdn(format!(
                "expected org.project.namespace.action.hash4, got {s:?}"
            )));
        }
        Ok(Self {
            org: parts[0].to_string(),
            project: parts[1].to_string(),
            namespace: parts[2].to_string(),
            action: parts[3].to_string(),
            hash4: parts[4].to_string(),
        })
    }

    /// The `namespace:action` call name used by the tool surface.
    #[must_use]
    pub fn call_name(&self) -> String {
        format!("{}:{}", self.namespace, self.action)
    }
}

impl std::fmt::Display for Fqdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.org, self.project, self.namespace, self.action, self.hash4
        )
    }
}

/// First 4 hex chars of SHA-256 over the normalized snippet.
///
/// Normalization trims the snippet and canonicalizes line endings so
/// formatting-only edits do not change identity.
#[must_use]
pub fn snippet_hash4(code_snippet: &str) -> String {
    let normalized = normalize_snippet(code_snippet);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..2])
}

/// Canonical snippet text used for hashing.
#[must_use]
pub fn normalize_snippet(code_snippet: &str) -> String {
    code_snippet.replace("\r\n", "\n").trim().to_string()
}

/// Node kinds in a capability's static workflow structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureNodeKind {
    Task,
    Decision,
    Capability,
    Fork,
    Join,
    Loop,
}

/// Edge kinds in a capability's static workflow structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureEdgeKind {
    Sequence,
    Provides,
    Conditional,
    Contains,
    LoopBody,
}

/// A task argument: literal value, reference expression, or named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgumentValue {
    /// Inline JSON value.
    Literal(serde_json::Value),
    /// Expression referencing an earlier node's output.
    Reference(String),
    /// Caller-supplied parameter, by name.
    Parameter(String),
}

/// A node in the static structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureNode {
    pub id: String,
    pub kind: StructureNodeKind,
    /// Tool invoked by task nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolId>,
    /// Arguments for task nodes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub arguments: HashMap<String, ArgumentValue>,
}

/// An edge in the static structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureEdge {
    pub from: String,
    pub to: String,
    pub kind: StructureEdgeKind,
}

/// Optional static workflow structure carried by a capability. Owned by the
/// capability and read-only to the scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticStructure {
    pub nodes: Vec<StructureNode>,
    pub edges: Vec<StructureEdge>,
    /// name -> node id producing the variable.
    #[serde(default)]
    pub variable_bindings: HashMap<String, String>,
    /// name -> inline JSON value.
    #[serde(default)]
    pub literal_bindings: HashMap<String, serde_json::Value>,
}

/// Graph-derived features carried by tools and capabilities. Refreshed by
/// the sync controller; consumed as trace statistics by the scorer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphFeatures {
    /// PageRank (hypergraph PageRank for capabilities), in [0, 1].
    pub page_rank: f64,
    /// Community / spectral cluster id, when assigned.
    pub community: Option<usize>,
    /// Aggregate Adamic-Adar affinity to the rest of the graph.
    pub adamic_adar: f64,
    /// Observed co-occurrence mass.
    pub co_occurrence: f64,
    /// Recency signal in [0, 1]; 1 = used in the latest window.
    pub recency: f64,
    /// Heat-diffusion mass from recent context.
    pub heat: f64,
}

/// An atomic tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Stable id, `"server:name"`.
    pub id: ToolId,
    /// Human-readable description.
    pub description: String,
    /// L2-normalized 1024-d embedding of the description.
    pub embedding: Vec<f32>,
    /// Graph-derived features.
    #[serde(default)]
    pub features: GraphFeatures,
}

/// A learned capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub fqdn: Fqdn,
    /// Member tools and child capabilities.
    pub members: Vec<Member>,
    /// 0 for leaves; `1 + max(level(child))` over capability members.
    pub hierarchy_level: usize,
    /// L2-normalized 1024-d intent embedding.
    pub intent_embedding: Vec<f32>,
    pub success_count: u64,
    pub usage_count: u64,
    /// Mean execution duration in milliseconds.
    pub avg_duration_ms: f64,
    pub source: CapabilitySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<StaticStructure>,
    #[serde(default)]
    pub features: GraphFeatures,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Capability {
    /// Success rate with the cold-start default of 0.5 when never used.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            COLD_START_SUCCESS_RATE
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    /// Direct tool members.
    #[must_use]
    pub fn tool_members(&self) -> Vec<&ToolId> {
        self.members
            .iter()
            .filter_map(|m| match m {
                Member::Tool(id) => Some(id),
                Member::Capability(_) => None,
            })
            .collect()
    }

    /// Direct capability members.
    #[must_use]
    pub fn capability_members(&self) -> Vec<CapabilityId> {
        self.members
            .iter()
            .filter_map(|m| match m {
                Member::Capability(id) => Some(*id),
                Member::Tool(_) => None,
            })
            .collect()
    }

    /// Nested capability ids referenced by the code snippet via `$cap:<uuid>`
    /// tokens, in discovery order, deduplicated.
    #[must_use]
    pub fn referenced_capabilities(&self) -> Vec<CapabilityId> {
        match &self.code_snippet {
            Some(code) => parse_capability_refs(code),
            None => Vec::new(),
        }
    }

    /// True when the snippet calls into other capabilities.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        !self.referenced_capabilities().is_empty()
    }
}

/// Extract `$cap:<uuid-v4>` references from a code snippet, in order of
/// first appearance, deduplicated.
#[must_use]
pub fn parse_capability_refs(code: &str) -> Vec<CapabilityId> {
    use crate::constants::CAPABILITY_REF_PREFIX;

    let mut out = Vec::new();
    let mut rest = code;
    while let Some(pos) = rest.find(CAPABILITY_REF_PREFIX) {
        rest = &rest[pos + CAPABILITY_REF_PREFIX.len()..];
        let candidate: String = rest
            .chars()
            .take(36)
            .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
            .collect();
        if candidate.len() == 36 {
            if let Ok(id) = Uuid::parse_str(&candidate) {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
    }
    out
}
