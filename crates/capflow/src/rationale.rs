// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Rationale strings and confidence composition.
//!
//! Confidence is assembled from three families of signals: the hybrid
//! score itself, hypergraph PageRank of the supporting nodes, and
//! dependency-path proximity, with weights tilted by the per-target alpha.
//! Community and co-occurrence boosts compose additively under caps. The
//! rationale names the dominant contributors so the decision log stays
//! readable.

use serde::{Deserialize, Serialize};

use crate::config::ConfidenceConfig;

/// Confidence weights after alpha adjustment; they sum to the same mass as
/// the configured bases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveWeights {
    pub hybrid: f64,
    pub pagerank: f64,
    pub path: f64,
}

/// Path confidence from hop count: adjacent nodes are trustworthy
/// evidence, distant ones barely count.
#[must_use]
pub fn path_confidence(hops: usize, config: &ConfidenceConfig) -> f64 {
    if config.hop_confidence.is_empty() {
        return 0.0;
    }
    if hops == 0 {
        return 1.0;
    }
    let idx = (hops - 1).min(config.hop_confidence.len() - 1);
    config.hop_confidence[idx]
}

/// Tilt the configured base weights by `(alpha - 0.5) * delta`: higher
/// alpha (semantic-leaning targets) moves mass onto the hybrid signal and
/// off the structural ones. Weights are clamped non-negative and
/// renormalized to preserve the base mass.
#[must_use]
pub fn adaptive_weights(alpha: f64, config: &ConfidenceConfig) -> AdaptiveWeights {
    let shift = (alpha - 0.5) * config.alpha_delta;
    let hybrid = (config.hybrid_weight + shift).max(0.0);
    let pagerank = (config.pagerank_weight - shift / 2.0).max(0.0);
    let path = (config.path_weight - shift / 2.0).max(0.0);
    let base_mass = config.hybrid_weight + config.pagerank_weight + config.path_weight;
    let mass = hybrid + pagerank + path;
    if mass <= 0.0 {
        return AdaptiveWeights {
            hybrid: base_mass,
            pagerank: 0.0,
            path: 0.0,
        };
    }
    let scale = base_mass / mass;
    AdaptiveWeights {
        hybrid: hybrid * scale,
        pagerank: pagerank * scale,
        path: path * scale,
    }
}

/// Inputs to one confidence computation.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceSignals {
    /// Blended hybrid score of the target.
    pub hybrid_score: f64,
    /// PageRank of the strongest supporting nodes (top-3 used).
    pub pagerank_top: Vec<f64>,
    /// Hop counts of known dependency paths from context to target.
    pub path_hops: Vec<usize>,
    /// Community boost in [0, 0.5].
    pub community_boost: f64,
    /// Normalized co-occurrence strength in [0, 1].
    pub co_occurrence: f64,
    /// The per-target alpha.
    pub alpha: f64,
}

/// A composed confidence with its explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    /// Final confidence in [0, 1].
    pub value: f64,
    pub weights: AdaptiveWeights,
    /// Short human-readable contributor summary.
    pub rationale: String,
}

/// Compose hybrid confidence from the signal set.
#[must_use]
pub fn hybrid_confidence(signals: &ConfidenceSignals, config: &ConfidenceConfig) -> Confidence {
    let weights = adaptive_weights(signals.alpha, config);

    let mut pagerank_top = signals.pagerank_top.clone();
    pagerank_top.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    pagerank_top.truncate(3);
    let pagerank_avg = if pagerank_top.is_empty() {
        0.0
    } else {
        pagerank_top.iter().sum::<f64>() / pagerank_top.len() as f64
    };

    let path_avg = if signals.path_hops.is_empty() {
        0.0
    } else {
        signals
            .path_hops
            .iter()
            .map(|&h| path_confidence(h, config))
            .sum::<f64>()
            / signals.path_hops.len() as f64
    };

    let weighted = signals.hybrid_score * weights.hybrid
        + pagerank_avg * weights.pagerank
        + path_avg * weights.path;
    let community = signals.community_boost.min(config.community_cap);
    let co_occurrence = signals.co_occurrence.min(config.co_occurrence_cap);
    let value = (weighted + community + co_occurrence).clamp(0.0, 1.0);

    let rationale = build_rationale(signals, weighted, community, co_occurrence);
    Confidence {
        value,
        weights,
        rationale,
    }
}

fn build_rationale(
    signals: &ConfidenceSignals,
    weighted: f64,
    community: f64,
    co_occurrence: f64,
) -> String {
    let mut contributors: Vec<(&str, f64)> = vec![
        ("hybrid", weighted),
        ("community", community),
        ("co-occurrence", co_occurrence),
    ];
    contributors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let dominant: Vec<String> = contributors
        .iter()
        .filter(|(_, v)| *v > 0.0)
        .take(2)
        .map(|(name, v)| format!("{name}={v:.2}"))
        .collect();
    if dominant.is_empty() {
        format!("no supporting signals (alpha={:.2})", signals.alpha)
    } else {
        format!("{} (alpha={:.2})", dominant.join(", "), signals.alpha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_confidence_table() {
        let config = ConfidenceConfig::default();
        assert_eq!(path_confidence(1, &config), 0.9);
        assert_eq!(path_confidence(2, &config), 0.7);
        assert_eq!(path_confidence(3, &config), 0.5);
        assert_eq!(path_confidence(4, &config), 0.3);
        assert_eq!(path_confidence(9, &config), 0.3);
        assert_eq!(path_confidence(0, &config), 1.0);
    }

    #[test]
    fn test_adaptive_weights_preserve_mass() {
        let config = ConfidenceConfig::default();
        let base = config.hybrid_weight + config.pagerank_weight + config.path_weight;
        for alpha in [0.5, 0.6, 0.75, 0.9, 1.0] {
            let w = adaptive_weights(alpha, &config);
            let mass = w.hybrid + w.pagerank + w.path;
            assert!(
                (mass - base).abs() < 1e-9,
                "alpha={alpha}: mass {mass} != base {base}"
            );
            assert!(w.hybrid >= 0.0 && w.pagerank >= 0.0 && w.path >= 0.0);
        }
    }

    #[test]
    fn test_higher_alpha_shifts_weight_to_hybrid() {
        let config = ConfidenceConfig::default();
        let neutral = adaptive_weights(0.5, &config);
        let semantic = adaptive_weights(1.0, &config);
        assert!(semantic.hybrid > neutral.hybrid);
        assert!(semantic.pagerank < neutral.pagerank);
        assert!(semantic.path < neutral.path);
        // Neutral alpha reproduces the configured bases.
        assert!((neutral.hybrid - config.hybrid_weight).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_confidence_composition() {
        let config = ConfidenceConfig::default();
        let signals = ConfidenceSignals {
            hybrid_score: 0.8,
            pagerank_top: vec![0.9, 0.5, 0.4, 0.1],
            path_hops: vec![1, 2],
            community_boost: 0.5,
            co_occurrence: 0.2,
            alpha: 0.6,
        };
        let confidence = hybrid_confidence(&signals, &config);
        assert!(confidence.value > 0.5);
        assert!(confidence.value <= 1.0);
        assert!(confidence.rationale.contains("alpha=0.60"));
    }

    #[test]
    fn test_caps_bound_additive_boosts() {
        let config = ConfidenceConfig {
            community_cap: 0.1,
            co_occurrence_cap: 0.05,
            ..Default::default()
        };
        let signals = ConfidenceSignals {
            hybrid_score: 0.0,
            community_boost: 0.5,
            co_occurrence: 1.0,
            alpha: 0.5,
            ..Default::default()
        };
        let confidence = hybrid_confidence(&signals, &config);
        assert!((confidence.value - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_rationale_names_dominant_contributors() {
        let config = ConfidenceConfig::default();
        let signals = ConfidenceSignals {
            hybrid_score: 0.0,
            community_boost: 0.4,
            co_occurrence: 0.1,
            alpha: 0.7,
            ..Default::default()
        };
        let confidence = hybrid_confidence(&signals, &config);
        assert!(confidence.rationale.starts_with("community"));
        let empty = hybrid_confidence(&ConfidenceSignals::default(), &config);
        assert!(empty.rationale.contains("no supporting signals"));
    }
}
