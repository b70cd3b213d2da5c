// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hypergraph PageRank: damped power iteration over the quasi-bipartite
//! adjacency augmented with directed capability-to-capability edges.

use crate::constants::{PAGERANK_DAMPING, PAGERANK_MAX_ITERATIONS, PAGERANK_TOLERANCE};

/// Damped power iteration.
///
/// `out_weights[i]` holds `(target, weight)` pairs for node `i`; rows with
/// no outgoing mass are dangling and redistribute uniformly. Returns scores
/// normalized into [0, 1] by the maximum entry (an empty graph returns an
/// empty vector).
#[must_use]
pub fn pagerank(out_weights: &[Vec<(usize, f64)>]) -> Vec<f64> {
    let n = out_weights.len();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];

    // Row-stochastic transition weights.
    let row_totals: Vec<f64> = out_weights
        .iter()
        .map(|row| row.iter().map(|(_, w)| w).sum())
        .collect();

    for _ in 0..PAGERANK_MAX_ITERATIONS {
        let mut next = vec![(1.0 - PAGERANK_DAMPING) * uniform; n];
        let mut dangling_mass = 0.0;
        for (i, row) in out_weights.iter().enumerate() {
            if row_totals[i] <= 0.0 {
                dangling_mass += rank[i];
                continue;
            }
            for &(j, w) in row {
                next[j] += PAGERANK_DAMPING * rank[i] * (w / row_totals[i]);
            }
        }
        if dangling_mass > 0.0 {
            let share = PAGERANK_DAMPING * dangling_mass * uniform;
            for v in &mut next {
                *v += share;
            }
        }

        let delta: f64 = next
            .iter()
            .zip(rank.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if delta < PAGERANK_TOLERANCE {
            break;
        }
    }

    let max = rank.iter().copied().fold(f64::MIN, f64::max);
    if max > 0.0 {
        for v in &mut rank {
            *v /= max;
        }
    }
    rank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_graph_empty_ranks() {
        assert!(pagerank(&[]).is_empty());
    }

    #[test]
    fn test_sink_receives_more_rank() {
        // 0 -> 2, 1 -> 2: node 2 should dominate.
        let out = vec![vec![(2, 1.0)], vec![(2, 1.0)], vec![]];
        let ranks = pagerank(&out);
        assert_eq!(ranks.len(), 3);
        assert!((ranks[2] - 1.0).abs() < 1e-12, "max-normalized top is 1.0");
        assert!(ranks[2] > ranks[0]);
        assert!(ranks[0] > 0.0);
    }

    #[test]
    fn test_symmetric_pair_equal_ranks() {
        let out = vec![vec![(1, 1.0)], vec![(0, 1.0)]];
        let ranks = pagerank(&out);
        assert!((ranks[0] - ranks[1]).abs() < 1e-9);
    }

    #[test]
    fn test_all_dangling_is_uniform() {
        let out = vec![vec![], vec![], vec![]];
        let ranks = pagerank(&out);
        assert!((ranks[0] - ranks[1]).abs() < 1e-9);
        assert!((ranks[1] - ranks[2]).abs() < 1e-9);
    }

    #[test]
    fn test_weights_skew_rank() {
        // 0 sends most mass to 1, a little to 2.
        let out = vec![vec![(1, 0.9), (2, 0.1)], vec![(0, 1.0)], vec![(0, 1.0)]];
        let ranks = pagerank(&out);
        assert!(ranks[1] > ranks[2]);
    }
}
