// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-target semantic/graph weighting.
//!
//! For every candidate the hybrid path blends `alpha * semantic +
//! (1 - alpha) * graph`. Alpha lives in [0.5, 1.0]: the semantic signal is
//! never outvoted, but a target whose structural neighborhood agrees with
//! its semantic neighborhood earns more graph influence. Three signal
//! sources apply in preference order, with the configured default as the
//! final fallback.

use serde::{Deserialize, Serialize};

use crate::capability::ToolId;
use crate::config::AlphaConfig;
use crate::spectral::SpectralModel;
use crate::tensor::cosine;
use crate::trace::DiscoveryMode;

/// Which signal produced the alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlphaAlgorithm {
    /// Agreement between semantic and spectral neighborhoods.
    EmbeddingsHybrid,
    /// Heat diffusion from the context when no spectral row exists.
    HeatDiffusion,
    /// Beta-prior success-rate evidence only.
    Bayesian,
    /// No signal; configured default.
    None,
}

/// The calculator's output: an adjustment parameter consumed by the
/// orchestrator and by confidence scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalAlpha {
    /// Semantic weight in [0.5, 1.0].
    pub alpha: f64,
    pub algorithm: AlphaAlgorithm,
    /// True when the target has neither usage history nor structure.
    pub cold_start: bool,
}

/// Everything known about one target at alpha time.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlphaSignals<'a> {
    /// Target node key.
    pub target: &'a str,
    /// Target semantic embedding.
    pub semantic: Option<&'a [f32]>,
    /// Mean-pooled semantic embedding of the context tools.
    pub context_semantic: Option<&'a [f32]>,
    /// Context tool ids.
    pub context_tools: &'a [ToolId],
    /// Usage counter for the Bayesian signal.
    pub usage_count: u64,
    /// Success counter for the Bayesian signal.
    pub success_count: u64,
}

/// Local-alpha calculator.
pub struct AlphaCalculator {
    config: AlphaConfig,
}

impl AlphaCalculator {
    #[must_use]
    pub fn new(config: AlphaConfig) -> Self {
        Self { config }
    }

    /// Compute alpha for one target.
    ///
    /// Preference order: spectral agreement, heat diffusion, Bayesian
    /// evidence, configured default. Passive suggestions keep a higher
    /// floor (0.6): a volunteered result leans harder on semantics.
    #[must_use]
    pub fn calculate(
        &self,
        signals: &AlphaSignals<'_>,
        spectral: Option<&SpectralModel>,
        mode: DiscoveryMode,
    ) -> LocalAlpha {
        let has_history = signals.usage_count > 0;
        let mut algorithm = AlphaAlgorithm::None;
        let mut alpha = self.config.default_alpha;
        let mut structural = false;

        if let Some(agreement) = spectral.and_then(|m| self.spectral_agreement(signals, m)) {
            // High agreement between the two neighborhood views means the
            // graph is informative for this target: pull alpha toward 0.5.
            alpha = 1.0 - 0.5 * agreement;
            algorithm = AlphaAlgorithm::EmbeddingsHybrid;
            structural = true;
        } else if let Some(heat) = spectral.and_then(|m| self.heat_signal(signals, m)) {
            alpha = 1.0 - 0.5 * heat;
            algorithm = AlphaAlgorithm::HeatDiffusion;
            structural = true;
        } else if has_history {
            let strength = signals.usage_count as f64
                / (signals.usage_count as f64 + self.config.prior_success + self.config.prior_failure);
            alpha = 1.0 - 0.5 * strength;
            algorithm = AlphaAlgorithm::Bayesian;
        }

        // Observed history sharpens any structural estimate further: the
        // beta posterior discounts the distance from the graph-trusting
        // floor as evidence accumulates.
        if structural && has_history {
            let prior_total = self.config.prior_success + self.config.prior_failure;
            let discount = prior_total / (prior_total + signals.usage_count as f64);
            alpha = 0.5 + (alpha - 0.5) * (0.5 + 0.5 * discount);
        }

        let floor = match mode {
            DiscoveryMode::ActiveSearch => 0.5,
            DiscoveryMode::PassiveSuggestion => 0.6,
        };
        LocalAlpha {
            alpha: alpha.clamp(floor, 1.0).clamp(0.5, 1.0),
            algorithm,
            cold_start: !structural && !has_history,
        }
    }

    /// Agreement in [0, 1] between the semantic and spectral views of the
    /// target's relation to its context.
    fn spectral_agreement(
        &self,
        signals: &AlphaSignals<'_>,
        model: &SpectralModel,
    ) -> Option<f64> {
        let target_row = model.embedding_of(signals.target)?;
        let semantic = signals.semantic?;
        let context_semantic = signals.context_semantic?;
        if signals.context_tools.is_empty() {
            return None;
        }

        let context_rows: Vec<&[f64]> = signals
            .context_tools
            .iter()
            .filter_map(|t| model.embedding_of(t))
            .collect();
        if context_rows.is_empty() {
            return None;
        }
        let dim = target_row.len();
        let mut context_mean = vec![0.0f64; dim];
        for row in &context_rows {
            for (m, &x) in context_mean.iter_mut().zip(row.iter()) {
                *m += x;
            }
        }
        for m in &mut context_mean {
            *m /= context_rows.len() as f64;
        }

        let semantic_sim = cosine(semantic, context_semantic) as f64;
        let spectral_sim = cosine_f64(target_row, &context_mean);
        Some((1.0 - (semantic_sim - spectral_sim).abs() / 2.0).clamp(0.0, 1.0))
    }

    /// Normalized heat reaching the target from the context seeds.
    fn heat_signal(&self, signals: &AlphaSignals<'_>, model: &SpectralModel) -> Option<f64> {
        if signals.context_tools.is_empty() {
            return None;
        }
        let seeds: Vec<String> = signals.context_tools.to_vec();
        let heat = model.heat_diffusion(&seeds, self.config.heat_steps, self.config.heat_rate);
        if heat.is_empty() {
            return None;
        }
        let target_heat = heat.get(signals.target).copied()?;
        let max = heat.values().copied().fold(f64::MIN, f64::max);
        if max <= 0.0 {
            return None;
        }
        Some((target_heat / max).clamp(0.0, 1.0))
    }
}

fn cosine_f64(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
