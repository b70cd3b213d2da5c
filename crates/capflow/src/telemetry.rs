// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Decision log and telemetry counters.
//!
//! Both channels are fire-and-forget with bounded buffers: a full buffer
//! counts a drop instead of blocking or failing the discovery path. The
//! prometheus registry carries the four engine gauges plus the drop
//! counter; a background task drains decision records into storage.

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CapflowError, Result};
use crate::storage::Storage;
use crate::trace::DecisionRecord;

/// Default bound for the decision-record channel.
pub const DECISION_BUFFER: usize = 1024;

/// Engine metrics registered against one prometheus registry.
pub struct EngineMetrics {
    pub registry: Registry,
    /// Share of the context window occupied after result injection.
    pub context_usage_pct: Gauge,
    /// Discovery latency distribution.
    pub query_latency_ms: Histogram,
    /// Spectral cache hit rate.
    pub cache_hit_rate: Gauge,
    /// Context saved by returning capabilities instead of raw tool lists.
    pub context_savings_pct: Gauge,
    /// Decision records dropped on a full buffer.
    pub dropped_decisions: IntCounter,
    /// Forward passes zeroed for non-finite outputs.
    pub unstable_forwards: IntCounter,
}

impl EngineMetrics {
    /// Register the engine metrics on a fresh registry.
    ///
    /// # Errors
    /// Returns `Storage` error when registration fails (duplicate names).
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let context_usage_pct = Gauge::with_opts(Opts::new(
            "capflow_context_usage_pct",
            "Share of the context window occupied after result injection",
        ))
        .map_err(|e| CapflowError::Storage(e.to_string()))?;
        let query_latency_ms = Histogram::with_opts(
            HistogramOpts::new("capflow_query_latency_ms", "Discovery latency in milliseconds")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )
        .map_err(|e| CapflowError::Storage(e.to_string()))?;
        let cache_hit_rate = Gauge::with_opts(Opts::new(
            "capflow_cache_hit_rate",
            "Spectral cluster cache hit rate",
        ))
        .map_err(|e| CapflowError::Storage(e.to_string()))?;
        let context_savings_pct = Gauge::with_opts(Opts::new(
            "capflow_context_savings_pct",
            "Context saved by capability suggestions",
        ))
        .map_err(|e| CapflowError::Storage(e.to_string()))?;
        let dropped_decisions = IntCounter::with_opts(Opts::new(
            "capflow_dropped_decisions_total",
            "Decision records dropped on a full buffer",
        ))
        .map_err(|e| CapflowError::Storage(e.to_string()))?;
        let unstable_forwards = IntCounter::with_opts(Opts::new(
            "capflow_unstable_forwards_total",
            "Forward passes zeroed for non-finite outputs",
        ))
        .map_err(|e| CapflowError::Storage(e.to_string()))?;

        for collector in [
            Box::new(context_usage_pct.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(query_latency_ms.clone()),
            Box::new(cache_hit_rate.clone()),
            Box::new(context_savings_pct.clone()),
            Box::new(dropped_decisions.clone()),
            Box::new(unstable_forwards.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| CapflowError::Storage(e.to_string()))?;
        }

        Ok(Self {
            registry,
            context_usage_pct,
            query_latency_ms,
            cache_hit_rate,
            context_savings_pct,
            dropped_decisions,
            unstable_forwards,
        })
    }
}

/// Sending half of the decision log.
#[derive(Clone)]
pub struct DecisionLog {
    tx: mpsc::Sender<DecisionRecord>,
    metrics: Arc<EngineMetrics>,
}

impl DecisionLog {
    /// Create the log and its receiving half.
    #[must_use]
    pub fn new(metrics: Arc<EngineMetrics>, buffer: usize) -> (Self, mpsc::Receiver<DecisionRecord>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, metrics }, rx)
    }

    /// Emit one record. Never blocks: a full buffer counts a drop.
    pub fn emit(&self, record: DecisionRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.dropped_decisions.inc();
            }
        }
    }
}

/// Drain decision records into storage until the channel closes. Spawn as
/// a background task; storage failures are logged and the loop continues.
pub async fn drain_decisions(mut rx: mpsc::Receiver<DecisionRecord>, storage: Arc<dyn Storage>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = storage.append_decision(&record).await {
            warn!(error = %e, "failed to persist decision record");
        } else {
            debug!(target = %record.target_id, "decision persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{DiscoveryMode, RankingAlgorithm, TargetType, Verdict};
    use uuid::Uuid;

    fn record() -> DecisionRecord {
        DecisionRecord {
            algorithm: RankingAlgorithm::SemanticOnly,
            mode: DiscoveryMode::ActiveSearch,
            target_type: TargetType::Tool,
            target_id: "fs:read".into(),
            intent: "read file".into(),
            signals: serde_json::json!({}),
            params: serde_json::json!({}),
            final_score: 0.8,
            threshold: 0.0,
            decision: Verdict::Accepted,
            correlation_id: Uuid::new_v4(),
            recorded_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_metrics_register_once() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.context_usage_pct.set(42.0);
        metrics.query_latency_ms.observe(12.0);
        assert_eq!(metrics.registry.gather().len(), 6);
    }

    #[tokio::test]
    async fn test_decision_log_drops_when_full() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let (log, _rx) = DecisionLog::new(Arc::clone(&metrics), 2);
        for _ in 0..5 {
            log.emit(record());
        }
        assert_eq!(metrics.dropped_decisions.get(), 3);
    }

    #[tokio::test]
    async fn test_decision_log_delivers_in_order() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let (log, mut rx) = DecisionLog::new(metrics, 16);
        log.emit(record());
        log.emit(record());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
