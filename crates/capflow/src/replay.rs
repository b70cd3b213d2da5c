// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Experience trace store with prioritized replay.
//!
//! Traces append into fixed-size segments, each behind its own lock so
//! priority updates from the trainer never contend with appends from the
//! serving path. Sampling follows prioritized experience replay: traces are
//! drawn with probability proportional to `priority^alpha` and carry
//! max-normalized importance weights `(n * p)^-beta`.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

use crate::capability::ToolId;
use crate::constants::{COLD_START_SUCCESS_RATE, PER_PRIORITY_EPSILON};
use crate::tensor::cosine;
use crate::trace::ExecutionTrace;

const SEGMENT_CAPACITY: usize = 256;

/// A sampled trace plus its importance weight.
#[derive(Debug, Clone)]
pub struct SampledTrace {
    pub trace: ExecutionTrace,
    /// Importance-sampling weight in (0, 1].
    pub weight: f64,
}

/// Aggregate statistics over traces with similar intent, used as scorer
/// features.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntentStats {
    /// Mean success rate over the top-k similar traces.
    pub success_rate: f64,
    /// Mean cosine similarity of the contributing traces.
    pub mean_similarity: f64,
    /// How many traces contributed.
    pub sample_count: usize,
}

/// Append-only prioritized trace store.
pub struct TraceStore {
    segments: Vec<Mutex<Vec<ExecutionTrace>>>,
    len: AtomicUsize,
    capacity: usize,
    per_alpha: f64,
    per_beta: f64,
    rng: Mutex<StdRng>,
}

impl TraceStore {
    /// Create a store holding at most `capacity` traces.
    #[must_use]
    pub fn new(capacity: usize, per_alpha: f64, per_beta: f64, seed: u64) -> Self {
        let segment_count = capacity.div_ceil(SEGMENT_CAPACITY).max(1);
        Self {
            segments: (0..segment_count).map(|_| Mutex::new(Vec::new())).collect(),
            len: AtomicUsize::new(0),
            capacity,
            per_alpha,
            per_beta,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Number of stored traces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True when no traces are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn segment_for(&self, id: &Uuid) -> &Mutex<Vec<ExecutionTrace>> {
        let hash = id.as_u128() as usize;
        &self.segments[hash % self.segments.len()]
    }

    /// Append a trace. When the buffer is at capacity the oldest trace in
    /// the target segment is evicted.
    pub fn append(&self, trace: ExecutionTrace) {
        let segment = self.segment_for(&trace.id);
        let mut guard = segment.lock();
        if self.len() >= self.capacity && !guard.is_empty() {
            let oldest = guard
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.recorded_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                guard.remove(i);
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
        }
        guard.push(trace);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Fetch a trace by id.
    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<ExecutionTrace> {
        self.segment_for(id)
            .lock()
            .iter()
            .find(|t| &t.id == id)
            .cloned()
    }

    /// Every stored trace, in segment order. Intended for batch training
    /// exports, not the hot path.
    #[must_use]
    pub fn all(&self) -> Vec<ExecutionTrace> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            out.extend(segment.lock().iter().cloned());
        }
        out
    }

    /// Sample `n` traces with probability proportional to
    /// `priority^per_alpha`, along with importance weights
    /// `(n * p)^-per_beta`, max-normalized into (0, 1].
    ///
    /// Sampling is without replacement; fewer than `n` stored traces
    /// returns them all with recomputed weights.
    #[must_use]
    pub fn sample_batch(&self, n: usize) -> Vec<SampledTrace> {
        let pool = self.all();
        if pool.is_empty() || n == 0 {
            return Vec::new();
        }

        let scaled: Vec<f64> = pool
            .iter()
            .map(|t| t.priority.max(PER_PRIORITY_EPSILON).powf(self.per_alpha))
            .collect();
        let total: f64 = scaled.iter().sum();
        let probs: Vec<f64> = scaled.iter().map(|s| s / total).collect();

        let count = n.min(pool.len());
        let mut rng = self.rng.lock();
        let mut remaining: Vec<(usize, f64)> = probs.iter().copied().enumerate().collect();
        let mut picked: Vec<(ExecutionTrace, f64)> = Vec::with_capacity(count);

        for _ in 0..count {
            let mass: f64 = remaining.iter().map(|(_, p)| p).sum();
            let mut draw = rng.gen::<f64>() * mass;
            let mut chosen = remaining.len() - 1;
            for (slot, (_, p)) in remaining.iter().enumerate() {
                draw -= p;
                if draw <= 0.0 {
                    chosen = slot;
                    break;
                }
            }
            let (index, prob) = remaining.swap_remove(chosen);
            picked.push((pool[index].clone(), prob));
        }
        drop(rng);

        let n_f = count as f64;
        let raw: Vec<f64> = picked
            .iter()
            .map(|(_, p)| (n_f * p).powf(-self.per_beta))
            .collect();
        let max_w = raw.iter().copied().fold(f64::MIN, f64::max).max(f64::EPSILON);
        picked
            .into_iter()
            .zip(raw)
            .map(|((trace, _), w)| SampledTrace {
                trace,
                weight: w / max_w,
            })
            .collect()
    }

    /// Write TD-error priorities back: `priority = |td| + epsilon`, clipped
    /// to [0, 1]. Ids without a stored trace are skipped.
    pub fn update_priorities(&self, ids: &[Uuid], td_errors: &[f64]) {
        let updates: HashMap<&Uuid, f64> = ids.iter().zip(td_errors.iter().copied()).collect();
        let mut applied = 0usize;
        for segment in &self.segments {
            let mut guard = segment.lock();
            for trace in guard.iter_mut() {
                if let Some(td) = updates.get(&trace.id) {
                    trace.priority = (td.abs() + PER_PRIORITY_EPSILON).clamp(0.0, 1.0);
                    applied += 1;
                }
            }
        }
        debug!(requested = ids.len(), applied, "updated trace priorities");
    }

    /// Mean success rate over the `k` traces whose intent embeddings are
    /// most similar to `embedding`. Falls back to the cold-start rate when
    /// nothing matches.
    #[must_use]
    pub fn query_intent_similar(&self, embedding: &[f32], k: usize) -> IntentStats {
        if embedding.is_empty() || k == 0 {
            return IntentStats {
                success_rate: COLD_START_SUCCESS_RATE,
                ..Default::default()
            };
        }
        let mut scored: Vec<(f64, bool)> = Vec::new();
        for segment in &self.segments {
            for trace in segment.lock().iter() {
                let sim = cosine(embedding, &trace.intent_embedding) as f64;
                scored.push((sim, trace.success));
            }
        }
        if scored.is_empty() {
            return IntentStats {
                success_rate: COLD_START_SUCCESS_RATE,
                ..Default::default()
            };
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        let count = scored.len();
        let successes = scored.iter().filter(|(_, s)| *s).count();
        IntentStats {
            success_rate: successes as f64 / count as f64,
            mean_similarity: scored.iter().map(|(s, _)| s).sum::<f64>() / count as f64,
            sample_count: count,
        }
    }

    /// Aggregate per-target usage statistics for a tool or capability id
    /// appearing in task results / capability links.
    #[must_use]
    pub fn target_stats(&self, target: &str) -> TargetStats {
        let mut stats = TargetStats::default();
        for segment in &self.segments {
            for trace in segment.lock().iter() {
                let tool_hit = trace.task_results.iter().any(|r| r.tool == target);
                let cap_hit = trace
                    .capability_id
                    .map(|id| id.to_string() == target)
                    .unwrap_or(false);
                if tool_hit || cap_hit {
                    stats.usage_count += 1;
                    if trace.success {
                        stats.success_count += 1;
                    }
                    stats.total_duration_ms += trace.duration_ms;
                }
            }
        }
        stats
    }

    /// Pairs of tools that co-occurred inside single traces, with counts.
    /// Feeds the sequence-edge observation path and the V->V enrichment
    /// matrix.
    #[must_use]
    pub fn co_occurrence_pairs(&self) -> Vec<((ToolId, ToolId), u64)> {
        let mut counts: HashMap<(ToolId, ToolId), u64> = HashMap::new();
        for segment in &self.segments {
            for trace in segment.lock().iter() {
                let tools = trace.tools_used();
                for i in 0..tools.len() {
                    for j in (i + 1)..tools.len() {
                        let key = if tools[i] <= tools[j] {
                            (tools[i].clone(), tools[j].clone())
                        } else {
                            (tools[j].clone(), tools[i].clone())
                        };
                        *counts.entry(key).or_default() += 1;
                    }
                }
            }
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort();
        out
    }
}

/// Usage counters for one target across all traces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub usage_count: u64,
    pub success_count: u64,
    pub total_duration_ms: u64,
}

impl TargetStats {
    /// Success rate with the cold-start default.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            COLD_START_SUCCESS_RATE
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TaskResult;
    use serde_json::Value as JsonValue;

    fn store() -> TraceStore {
        TraceStore::new(1000, 0.6, 0.4, 11)
    }

    fn trace_with_priority(priority: f64, success: bool) -> ExecutionTrace {
        let mut t = ExecutionTrace::new("intent", vec![1.0, 0.0], success);
        t.priority = priority;
        t
    }

    #[test]
    fn test_append_sets_cold_start_priority() {
        let s = store();
        s.append(ExecutionTrace::new("x", vec![1.0, 0.0], true));
        assert_eq!(s.len(), 1);
        assert!((s.all()[0].priority - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_update_priorities_abs_td_plus_epsilon() {
        let s = store();
        let traces: Vec<ExecutionTrace> =
            (0..8).map(|_| trace_with_priority(0.5, true)).collect();
        let ids: Vec<Uuid> = traces.iter().map(|t| t.id).collect();
        for t in traces {
            s.append(t);
        }
        let td = [0.1, -0.8, 0.3, 0.0, 0.5, -0.2, 0.9, 0.4];
        s.update_priorities(&ids, &td);
        for (id, td) in ids.iter().zip(td.iter()) {
            let stored = s.get(id).unwrap().priority;
            assert!(
                (stored - (td.abs() + PER_PRIORITY_EPSILON).clamp(0.0, 1.0)).abs() < 1e-9,
                "priority mismatch for td={td}"
            );
        }
    }

    #[test]
    fn test_sampling_weights_in_unit_interval_uniform_mean_one() {
        let s = store();
        for _ in 0..32 {
            s.append(trace_with_priority(0.5, true));
        }
        let batch = s.sample_batch(16);
        assert_eq!(batch.len(), 16);
        for sampled in &batch {
            assert!(sampled.weight > 0.0 && sampled.weight <= 1.0);
        }
        // Uniform priorities: all weights collapse to 1.
        let mean: f64 = batch.iter().map(|b| b.weight).sum::<f64>() / batch.len() as f64;
        assert!((mean - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sampling_prefers_high_priority() {
        let s = TraceStore::new(1000, 1.0, 0.4, 3);
        let hot = trace_with_priority(1.0, true);
        let hot_id = hot.id;
        s.append(hot);
        for _ in 0..9 {
            s.append(trace_with_priority(0.01, true));
        }
        let mut hits = 0;
        for _ in 0..50 {
            let batch = s.sample_batch(1);
            if batch[0].trace.id == hot_id {
                hits += 1;
            }
        }
        // p(hot) ~ 1.0 / 1.09 per draw.
        assert!(hits > 30, "high-priority trace drawn only {hits}/50 times");
    }

    #[test]
    fn test_sample_without_replacement() {
        let s = store();
        for _ in 0..4 {
            s.append(trace_with_priority(0.5, true));
        }
        let batch = s.sample_batch(10);
        assert_eq!(batch.len(), 4);
        let mut ids: Vec<Uuid> = batch.iter().map(|b| b.trace.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_query_intent_similar() {
        let s = store();
        let mut matching = ExecutionTrace::new("fetch users", vec![1.0, 0.0], true);
        matching.intent_embedding = vec![1.0, 0.0];
        let mut matching_fail = ExecutionTrace::new("fetch users again", vec![1.0, 0.0], false);
        matching_fail.intent_embedding = vec![0.95, 0.05];
        let mut unrelated = ExecutionTrace::new("send mail", vec![0.0, 1.0], false);
        unrelated.intent_embedding = vec![0.0, 1.0];
        s.append(matching);
        s.append(matching_fail);
        s.append(unrelated);

        let stats = s.query_intent_similar(&[1.0, 0.0], 2);
        assert_eq!(stats.sample_count, 2);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert!(stats.mean_similarity > 0.9);
    }

    #[test]
    fn test_query_intent_similar_empty_store_cold_start() {
        let s = store();
        let stats = s.query_intent_similar(&[1.0, 0.0], 5);
        assert!((stats.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(stats.sample_count, 0);
    }

    #[test]
    fn test_capacity_eviction() {
        let s = TraceStore::new(4, 0.6, 0.4, 5);
        for _ in 0..8 {
            s.append(trace_with_priority(0.5, true));
        }
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn test_co_occurrence_pairs() {
        let s = store();
        let mk = |tool: &str| TaskResult {
            task_id: tool.to_string(),
            tool: tool.to_string(),
            args: JsonValue::Null,
            result: JsonValue::Null,
            success: true,
            duration_ms: 1,
            layer_index: 0,
        };
        s.append(
            ExecutionTrace::new("x", vec![1.0, 0.0], true)
                .with_task_results(vec![mk("b:t"), mk("a:t")]),
        );
        s.append(
            ExecutionTrace::new("y", vec![1.0, 0.0], true)
                .with_task_results(vec![mk("a:t"), mk("b:t")]),
        );
        let pairs = s.co_occurrence_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0], (("a:t".to_string(), "b:t".to_string()), 2));
    }

    #[test]
    fn test_target_stats() {
        let s = store();
        let mk = |tool: &str, ok: bool| {
            let mut t = ExecutionTrace::new("x", vec![1.0, 0.0], ok);
            t.task_results = vec![TaskResult {
                task_id: "n".into(),
                tool: tool.into(),
                args: JsonValue::Null,
                result: JsonValue::Null,
                success: ok,
                duration_ms: 10,
                layer_index: 0,
            }];
            t
        };
        s.append(mk("fs:read", true));
        s.append(mk("fs:read", false));
        s.append(mk("fs:write", true));
        let stats = s.target_stats("fs:read");
        assert_eq!(stats.usage_count, 2);
        assert!((stats.success_rate() - 0.5).abs() < 1e-12);
        assert!((s.target_stats("unknown").success_rate() - 0.5).abs() < 1e-12);
    }
}
