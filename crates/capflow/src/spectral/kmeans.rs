// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! k-means++ over spectral embedding rows.

use rand::rngs::StdRng;
use rand::Rng;

use crate::constants::KMEANS_MAX_ITERATIONS;

/// Cluster labels for each input row plus the final centroids.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    pub iterations: usize,
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// k-means with k-means++ seeding.
///
/// Runs until labels are stable or [`KMEANS_MAX_ITERATIONS`]. Empty
/// clusters are re-seeded from the point farthest from its centroid.
/// Deterministic given the RNG state.
#[must_use]
pub fn kmeans_pp(rows: &[Vec<f64>], k: usize, rng: &mut StdRng) -> KMeansResult {
    let n = rows.len();
    if n == 0 || k == 0 {
        return KMeansResult {
            labels: Vec::new(),
            centroids: Vec::new(),
            iterations: 0,
        };
    }
    let k = k.min(n);
    let dim = rows[0].len();

    // k-means++ seeding: first centroid uniform, then proportional to
    // squared distance from the nearest chosen centroid.
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(rows[rng.gen_range(0..n)].clone());
    while centroids.len() < k {
        let dists: Vec<f64> = rows
            .iter()
            .map(|r| {
                centroids
                    .iter()
                    .map(|c| sq_dist(r, c))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= 0.0 {
            // All points coincide with existing centroids.
            centroids.push(rows[rng.gen_range(0..n)].clone());
            continue;
        }
        let mut draw = rng.gen::<f64>() * total;
        let mut chosen = n - 1;
        for (i, d) in dists.iter().enumerate() {
            draw -= d;
            if draw <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(rows[chosen].clone());
    }

    let mut labels = vec![0usize; n];
    let mut iterations = 0;
    for iter in 0..KMEANS_MAX_ITERATIONS {
        iterations = iter + 1;
        // Assign.
        let mut changed = false;
        for (i, row) in rows.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let d = sq_dist(row, centroid);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if labels[i] != best {
                labels[i] = best;
                changed = true;
            }
        }
        if !changed && iter > 0 {
            break;
        }

        // Update.
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, row) in rows.iter().enumerate() {
            counts[labels[i]] += 1;
            for (s, &x) in sums[labels[i]].iter_mut().zip(row.iter()) {
                *s += x;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed an empty cluster from the farthest point.
                let farthest = rows
                    .iter()
                    .enumerate()
                    .max_by(|(i, a), (j, b)| {
                        sq_dist(a, &centroids[labels[*i]])
                            .partial_cmp(&sq_dist(b, &centroids[labels[*j]]))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centroids[c] = rows[farthest].clone();
            } else {
                for (dst, s) in centroids[c].iter_mut().zip(sums[c].iter()) {
                    *dst = s / counts[c] as f64;
                }
            }
        }
    }

    KMeansResult {
        labels,
        centroids,
        iterations,
    }
}
