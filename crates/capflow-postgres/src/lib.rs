// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! `PostgreSQL` storage backend for `CapFlow`.
//!
//! Implements the engine's [`Storage`] trait over `tokio-postgres`.
//! Embeddings live in `vector(1024)` columns (pgvector) queried with the
//! cosine operator; params blobs are JSONB keyed by user id; decision and
//! metric tables are append-only.
//!
//! # Example
//!
//! ```rust,ignore
//! use capflow_postgres::PostgresStorage;
//!
//! let storage = PostgresStorage::connect(
//!     "host=localhost user=postgres password=postgres dbname=capflow",
//! ).await?;
//! let structure = storage.load_structure().await?;
//! ```

mod error;

pub use error::{PostgresError, Result};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, warn};
use uuid::Uuid;

use capflow::capability::{Capability, CapabilitySource, Fqdn, Member};
use capflow::graph::{EdgeKind, EdgeSource};
use capflow::storage::{EdgeRow, Storage, StorageSnapshot, ToolRow, WorkflowPatternRow};
use capflow::trace::{DecisionRecord, ExecutionTrace};

/// Check a table-name prefix before it is spliced into DDL.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*` up to 48 bytes, which keeps every
/// derived table name inside `PostgreSQL`'s unquoted-identifier limit once
/// the `_tools` / `_traces` suffixes are appended.
fn validate_identifier(name: &str) -> Result<()> {
    let reject = |reason: String| Err(PostgresError::InvalidIdentifier(reason));
    if name.len() > 48 {
        return reject(format!("table prefix {name:?} exceeds 48 bytes"));
    }
    match name.chars().next() {
        None => reject("table prefix is empty".to_string()),
        Some(first) if !first.is_ascii_alphabetic() && first != '_' => {
            reject(format!("table prefix {name:?} opens with {first:?}"))
        }
        Some(_) => {
            match name
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
            {
                Some(c) => reject(format!("table prefix {name:?} holds {c:?}")),
                None => Ok(()),
            }
        }
    }
}

/// Render an embedding as a pgvector literal: `[x1,x2,...]`.
fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 10 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{v}"));
    }
    out.push(']');
    out
}

/// Parse a pgvector text rendering back into floats.
fn parse_vector(text: &str) -> Result<Vec<f32>> {
    let trimmed = text.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| PostgresError::DecodeError(format!("bad vector element: {e}")))
        })
        .collect()
}

fn edge_kind_str(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Contains => "contains",
        EdgeKind::Dependency => "dependency",
        EdgeKind::Sequence => "sequence",
        EdgeKind::Provides => "provides",
        EdgeKind::Alternative => "alternative",
    }
}

fn edge_kind_from(s: &str) -> Result<EdgeKind> {
    match s {
        "contains" => Ok(EdgeKind::Contains),
        "dependency" => Ok(EdgeKind::Dependency),
        "sequence" => Ok(EdgeKind::Sequence),
        "provides" => Ok(EdgeKind::Provides),
        "alternative" => Ok(EdgeKind::Alternative),
        other => Err(PostgresError::DecodeError(format!("unknown edge kind {other:?}"))),
    }
}

fn edge_source_str(source: EdgeSource) -> &'static str {
    match source {
        EdgeSource::Template => "template",
        EdgeSource::Inferred => "inferred",
        EdgeSource::Observed => "observed",
    }
}

fn edge_source_from(s: &str) -> Result<EdgeSource> {
    match s {
        "template" => Ok(EdgeSource::Template),
        "inferred" => Ok(EdgeSource::Inferred),
        "observed" => Ok(EdgeSource::Observed),
        other => Err(PostgresError::DecodeError(format!(
            "unknown edge source {other:?}"
        ))),
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

/// `PostgreSQL`-backed storage.
///
/// Tables are created on connect under a configurable prefix (default
/// `capflow`):
/// - `{p}_tools` - id, server id, description, `vector(1024)` embedding
/// - `{p}_edges` - typed weighted edges with provenance
/// - `{p}_capabilities` - capability records with members/structure JSONB
/// - `{p}_workflow_patterns` - learned patterns with `tools_used` JSONB
/// - `{p}_shgat_params` - params blobs keyed by user id
/// - `{p}_traces` - execution traces with priorities
/// - `{p}_decisions`, `{p}_metrics` - append-only logs
pub struct PostgresStorage {
    client: Client,
    prefix: String,
}

impl PostgresStorage {
    /// Connect with the default table prefix.
    ///
    /// # Errors
    /// Returns `ConnectionError` or `SchemaError`.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        Self::connect_with_prefix(connection_string, "capflow").await
    }

    /// Connect with a custom table prefix.
    ///
    /// # Errors
    /// `InvalidIdentifier` when the prefix is not a safe SQL identifier.
    pub async fn connect_with_prefix(connection_string: &str, prefix: &str) -> Result<Self> {
        validate_identifier(prefix)?;
        info!("Connecting to PostgreSQL");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                PostgresError::ConnectionError(e.to_string())
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let storage = Self {
            client,
            prefix: prefix.to_string(),
        };
        storage.initialize_schema().await?;
        Ok(storage)
    }

    fn table(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }

    async fn initialize_schema(&self) -> Result<()> {
        // pgvector may already be installed or require privileges we lack;
        // failure here only matters if the column type is missing too.
        if let Err(e) = self
            .client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await
        {
            warn!("could not ensure pgvector extension: {e}");
        }
        let p = &self.prefix;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {p}_tools (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                embedding vector(1024),
                updated_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {p}_edges (
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                weight DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                observed_count BIGINT NOT NULL DEFAULT 1,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0.0,
                PRIMARY KEY (from_id, to_id, kind)
            );
            CREATE TABLE IF NOT EXISTS {p}_capabilities (
                id TEXT PRIMARY KEY,
                fqdn TEXT NOT NULL,
                members JSONB NOT NULL DEFAULT '[]',
                hierarchy_level BIGINT NOT NULL DEFAULT 0,
                intent_embedding vector(1024),
                success_count BIGINT NOT NULL DEFAULT 0,
                usage_count BIGINT NOT NULL DEFAULT 0,
                avg_duration_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'emergent',
                code_snippet TEXT,
                structure JSONB,
                updated_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {p}_workflow_patterns (
                id TEXT PRIMARY KEY,
                tools_used JSONB NOT NULL DEFAULT '[]',
                structure JSONB NOT NULL DEFAULT '{{}}',
                observed_count BIGINT NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS {p}_shgat_params (
                user_id TEXT PRIMARY KEY,
                params JSONB NOT NULL,
                updated_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {p}_traces (
                id TEXT PRIMARY KEY,
                capability_id TEXT,
                user_id TEXT,
                intent TEXT NOT NULL,
                intent_embedding vector(1024),
                executed_path JSONB NOT NULL DEFAULT '[]',
                decisions JSONB NOT NULL DEFAULT '[]',
                task_results JSONB NOT NULL DEFAULT '[]',
                success BOOLEAN NOT NULL,
                duration_ms BIGINT NOT NULL DEFAULT 0,
                priority DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                recorded_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {p}_traces_recorded_idx
                ON {p}_traces (recorded_at DESC);
            CREATE TABLE IF NOT EXISTS {p}_decisions (
                id BIGSERIAL PRIMARY KEY,
                record JSONB NOT NULL,
                recorded_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {p}_metrics (
                id BIGSERIAL PRIMARY KEY,
                metric_name TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                timestamp BIGINT NOT NULL
            );
            "#
        );
        self.client
            .batch_execute(&ddl)
            .await
            .map_err(|e| PostgresError::SchemaError(e.to_string()))?;
        Ok(())
    }

    /// Upsert one tool row.
    ///
    /// # Errors
    /// `QueryError` on database failure.
    pub async fn upsert_tool(&self, row: &ToolRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, server_id, description, embedding, updated_at)
             VALUES ($1, $2, $3, $4::vector, $5)
             ON CONFLICT (id) DO UPDATE SET
               server_id = EXCLUDED.server_id,
               description = EXCLUDED.description,
               embedding = EXCLUDED.embedding,
               updated_at = EXCLUDED.updated_at",
            self.table("tools")
        );
        self.client
            .execute(
                &sql,
                &[
                    &row.id,
                    &row.server_id,
                    &row.description,
                    &vector_literal(&row.embedding),
                    &row.updated_at.timestamp_millis(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Upsert one capability record.
    ///
    /// # Errors
    /// `QueryError` on database failure.
    pub async fn upsert_capability(&self, capability: &Capability) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, fqdn, members, hierarchy_level, intent_embedding,
                             success_count, usage_count, avg_duration_ms, source,
                             code_snippet, structure, updated_at)
             VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
               fqdn = EXCLUDED.fqdn,
               members = EXCLUDED.members,
               hierarchy_level = EXCLUDED.hierarchy_level,
               intent_embedding = EXCLUDED.intent_embedding,
               success_count = EXCLUDED.success_count,
               usage_count = EXCLUDED.usage_count,
               avg_duration_ms = EXCLUDED.avg_duration_ms,
               source = EXCLUDED.source,
               code_snippet = EXCLUDED.code_snippet,
               structure = EXCLUDED.structure,
               updated_at = EXCLUDED.updated_at",
            self.table("capabilities")
        );
        let members = serde_json::to_value(&capability.members)
            .map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        let structure = capability
            .structure
            .as_ref()
            .map(|s| serde_json::to_value(s))
            .transpose()
            .map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        let source = match capability.source {
            CapabilitySource::Emergent => "emergent",
            CapabilitySource::Manual => "manual",
        };
        self.client
            .execute(
                &sql,
                &[
                    &capability.id.to_string(),
                    &capability.fqdn.to_string(),
                    &members,
                    &(capability.hierarchy_level as i64),
                    &vector_literal(&capability.intent_embedding),
                    &(capability.success_count as i64),
                    &(capability.usage_count as i64),
                    &capability.avg_duration_ms,
                    &source,
                    &capability.code_snippet,
                    &structure,
                    &capability.updated_at.timestamp_millis(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Upsert an edge row, accumulating observation counts.
    ///
    /// # Errors
    /// `QueryError` on database failure.
    pub async fn upsert_edge(&self, edge: &EdgeRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (from_id, to_id, kind, source, weight, observed_count, confidence)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (from_id, to_id, kind) DO UPDATE SET
               source = EXCLUDED.source,
               weight = GREATEST({0}.weight, EXCLUDED.weight),
               observed_count = {0}.observed_count + EXCLUDED.observed_count,
               confidence = GREATEST({0}.confidence, EXCLUDED.confidence)",
            self.table("edges")
        );
        self.client
            .execute(
                &sql,
                &[
                    &edge.from_id,
                    &edge.to_id,
                    &edge_kind_str(edge.kind),
                    &edge_source_str(edge.source),
                    &edge.weight,
                    &(edge.observed_count as i64),
                    &edge.confidence,
                ],
            )
            .await?;
        Ok(())
    }

    /// Cosine top-K over stored tool embeddings, pushed down to pgvector.
    ///
    /// # Errors
    /// `QueryError` on database failure.
    pub async fn search_similar_tools(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let sql = format!(
            "SELECT id, 1 - (embedding <=> $1::vector) AS score
             FROM {} WHERE embedding IS NOT NULL
             ORDER BY embedding <=> $1::vector LIMIT $2",
            self.table("tools")
        );
        let rows = self
            .client
            .query(sql.as_str(), &[&vector_literal(embedding), &(limit as i64)])
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, f64>(1)))
            .collect())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn load_structure(&self) -> capflow::Result<StorageSnapshot> {
        let tools_sql = format!(
            "SELECT id, server_id, description, embedding::text, updated_at FROM {}",
            self.table("tools")
        );
        let mut tools = Vec::new();
        for row in self.client.query(tools_sql.as_str(), &[]).await.map_err(PostgresError::from)? {
            let embedding_text: Option<String> = row.get(3);
            tools.push(ToolRow {
                id: row.get(0),
                server_id: row.get(1),
                description: row.get(2),
                embedding: embedding_text
                    .as_deref()
                    .map(parse_vector)
                    .transpose()?
                    .unwrap_or_default(),
                updated_at: millis_to_utc(row.get(4)),
            });
        }

        let caps_sql = format!(
            "SELECT id, fqdn, members, hierarchy_level, intent_embedding::text,
                    success_count, usage_count, avg_duration_ms, source,
                    code_snippet, structure, updated_at
             FROM {}",
            self.table("capabilities")
        );
        let mut capabilities = Vec::new();
        for row in self.client.query(caps_sql.as_str(), &[]).await.map_err(PostgresError::from)? {
            let id_text: String = row.get(0);
            let id = Uuid::parse_str(&id_text)
                .map_err(|e| PostgresError::DecodeError(format!("bad capability id: {e}")))?;
            let fqdn_text: String = row.get(1);
            let fqdn = Fqdn::parse(&fqdn_text)
                .map_err(|e| PostgresError::DecodeError(format!("bad fqdn: {e}")))?;
            let members: Vec<Member> = serde_json::from_value(row.get::<_, JsonValue>(2))
                .map_err(|e| PostgresError::DecodeError(format!("bad members: {e}")))?;
            let embedding_text: Option<String> = row.get(4);
            let source: String = row.get(8);
            let structure: Option<JsonValue> = row.get(10);
            capabilities.push(Capability {
                id,
                fqdn,
                members,
                hierarchy_level: row.get::<_, i64>(3) as usize,
                intent_embedding: embedding_text
                    .as_deref()
                    .map(parse_vector)
                    .transpose()?
                    .unwrap_or_default(),
                success_count: row.get::<_, i64>(5) as u64,
                usage_count: row.get::<_, i64>(6) as u64,
                avg_duration_ms: row.get(7),
                source: if source == "manual" {
                    CapabilitySource::Manual
                } else {
                    CapabilitySource::Emergent
                },
                code_snippet: row.get(9),
                structure: structure
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| PostgresError::DecodeError(format!("bad structure: {e}")))?,
                features: Default::default(),
                updated_at: millis_to_utc(row.get(11)),
            });
        }

        let edges_sql = format!(
            "SELECT from_id, to_id, kind, source, weight, observed_count, confidence FROM {}",
            self.table("edges")
        );
        let mut edges = Vec::new();
        for row in self.client.query(edges_sql.as_str(), &[]).await.map_err(PostgresError::from)? {
            let kind: String = row.get(2);
            let source: String = row.get(3);
            edges.push(EdgeRow {
                from_id: row.get(0),
                to_id: row.get(1),
                kind: edge_kind_from(&kind)?,
                source: edge_source_from(&source)?,
                weight: row.get(4),
                observed_count: row.get::<_, i64>(5) as u64,
                confidence: row.get(6),
            });
        }

        let patterns_sql = format!(
            "SELECT id, tools_used, structure, observed_count FROM {}",
            self.table("workflow_patterns")
        );
        let mut workflow_patterns = Vec::new();
        for row in self
            .client
            .query(patterns_sql.as_str(), &[])
            .await
            .map_err(PostgresError::from)?
        {
            let id_text: String = row.get(0);
            workflow_patterns.push(WorkflowPatternRow {
                id: Uuid::parse_str(&id_text)
                    .map_err(|e| PostgresError::DecodeError(format!("bad pattern id: {e}")))?,
                tools_used: serde_json::from_value(row.get::<_, JsonValue>(1))
                    .map_err(|e| PostgresError::DecodeError(format!("bad tools_used: {e}")))?,
                structure: row.get(2),
                observed_count: row.get::<_, i64>(3) as u64,
            });
        }

        Ok(StorageSnapshot {
            tools,
            capabilities,
            edges,
            workflow_patterns,
        })
    }

    async fn save_params(&self, user_id: &str, blob: &str) -> capflow::Result<()> {
        let params: JsonValue =
            serde_json::from_str(blob).map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (user_id, params, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE SET
               params = EXCLUDED.params, updated_at = EXCLUDED.updated_at",
            self.table("shgat_params")
        );
        self.client
            .execute(sql.as_str(), &[&user_id, &params, &Utc::now().timestamp_millis()])
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn load_params(&self, user_id: &str) -> capflow::Result<Option<String>> {
        let sql = format!(
            "SELECT params FROM {} WHERE user_id = $1",
            self.table("shgat_params")
        );
        let rows = self
            .client
            .query(sql.as_str(), &[&user_id])
            .await
            .map_err(PostgresError::from)?;
        match rows.first() {
            Some(row) => {
                let params: JsonValue = row.get(0);
                Ok(Some(params.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn append_trace(&self, trace: &ExecutionTrace) -> capflow::Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, capability_id, user_id, intent, intent_embedding,
                             executed_path, decisions, task_results, success,
                             duration_ms, priority, recorded_at)
             VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO NOTHING",
            self.table("traces")
        );
        let executed_path = serde_json::to_value(&trace.executed_path)
            .map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        let decisions = serde_json::to_value(&trace.decisions)
            .map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        let task_results = serde_json::to_value(&trace.task_results)
            .map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        self.client
            .execute(
                &sql,
                &[
                    &trace.id.to_string(),
                    &trace.capability_id.map(|id| id.to_string()),
                    &trace.user_id,
                    &trace.intent,
                    &vector_literal(&trace.intent_embedding),
                    &executed_path,
                    &decisions,
                    &task_results,
                    &trace.success,
                    &(trace.duration_ms as i64),
                    &trace.priority,
                    &trace.recorded_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn load_traces(&self, limit: usize) -> capflow::Result<Vec<ExecutionTrace>> {
        let sql = format!(
            "SELECT id, capability_id, user_id, intent, intent_embedding::text,
                    executed_path, decisions, task_results, success, duration_ms,
                    priority, recorded_at
             FROM {} ORDER BY recorded_at DESC LIMIT $1",
            self.table("traces")
        );
        let rows = self
            .client
            .query(sql.as_str(), &[&(limit as i64)])
            .await
            .map_err(PostgresError::from)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id_text: String = row.get(0);
            let capability_text: Option<String> = row.get(1);
            let embedding_text: Option<String> = row.get(4);
            out.push(ExecutionTrace {
                id: Uuid::parse_str(&id_text)
                    .map_err(|e| PostgresError::DecodeError(format!("bad trace id: {e}")))?,
                capability_id: capability_text
                    .map(|t| Uuid::parse_str(&t))
                    .transpose()
                    .map_err(|e| PostgresError::DecodeError(format!("bad capability id: {e}")))?,
                user_id: row.get(2),
                intent: row.get(3),
                intent_embedding: embedding_text
                    .as_deref()
                    .map(parse_vector)
                    .transpose()?
                    .unwrap_or_default(),
                executed_path: serde_json::from_value(row.get::<_, JsonValue>(5))
                    .map_err(|e| PostgresError::DecodeError(format!("bad path: {e}")))?,
                decisions: serde_json::from_value(row.get::<_, JsonValue>(6))
                    .map_err(|e| PostgresError::DecodeError(format!("bad decisions: {e}")))?,
                task_results: serde_json::from_value(row.get::<_, JsonValue>(7))
                    .map_err(|e| PostgresError::DecodeError(format!("bad task results: {e}")))?,
                success: row.get(8),
                duration_ms: row.get::<_, i64>(9) as u64,
                priority: row.get(10),
                recorded_at: millis_to_utc(row.get(11)),
            });
        }
        Ok(out)
    }

    async fn update_trace_priorities(&self, ids: &[Uuid], priorities: &[f64]) -> capflow::Result<()> {
        let sql = format!(
            "UPDATE {} SET priority = $2 WHERE id = $1",
            self.table("traces")
        );
        for (id, priority) in ids.iter().zip(priorities.iter()) {
            self.client
                .execute(sql.as_str(), &[&id.to_string(), priority])
                .await
                .map_err(PostgresError::from)?;
        }
        Ok(())
    }

    async fn append_decision(&self, record: &DecisionRecord) -> capflow::Result<()> {
        let sql = format!(
            "INSERT INTO {} (record, recorded_at) VALUES ($1, $2)",
            self.table("decisions")
        );
        let value =
            serde_json::to_value(record).map_err(|e| PostgresError::DecodeError(e.to_string()))?;
        self.client
            .execute(sql.as_str(), &[&value, &record.recorded_at.timestamp_millis()])
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn append_metric(&self, name: &str, value: f64, metadata: JsonValue) -> capflow::Result<()> {
        let sql = format!(
            "INSERT INTO {} (metric_name, value, metadata, timestamp) VALUES ($1, $2, $3, $4)",
            self.table("metrics")
        );
        self.client
            .execute(sql.as_str(), &[&name, &value, &metadata, &Utc::now().timestamp_millis()])
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_round_trip() {
        let v = vec![1.0f32, -0.5, 0.25];
        let literal = vector_literal(&v);
        assert_eq!(literal, "[1,-0.5,0.25]");
        assert_eq!(parse_vector(&literal).unwrap(), v);
        assert!(parse_vector("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_vector_rejects_garbage() {
        assert!(parse_vector("[1,banana]").is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("capflow").is_ok());
        assert!(validate_identifier("_internal1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1bad").is_err());
        assert!(validate_identifier("bad-prefix").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_edge_kind_round_trip() {
        for kind in [
            EdgeKind::Contains,
            EdgeKind::Dependency,
            EdgeKind::Sequence,
            EdgeKind::Provides,
            EdgeKind::Alternative,
        ] {
            assert_eq!(edge_kind_from(edge_kind_str(kind)).unwrap(), kind);
        }
        assert!(edge_kind_from("nope").is_err());
    }

    #[test]
    fn test_edge_source_round_trip() {
        for source in [EdgeSource::Template, EdgeSource::Inferred, EdgeSource::Observed] {
            assert_eq!(edge_source_from(edge_source_str(source)).unwrap(), source);
        }
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = millis_to_utc(now.timestamp_millis());
        assert!((back - now).num_milliseconds().abs() <= 1);
    }
}
