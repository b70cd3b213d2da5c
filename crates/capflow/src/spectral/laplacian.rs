// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Symmetric adjacency, normalized Laplacian, and Jacobi eigendecomposition.

use crate::constants::{JACOBI_MAX_SWEEPS, JACOBI_TOLERANCE};

/// Dense symmetric matrix in row-major f64.
#[derive(Debug, Clone)]
pub struct SymMatrix {
    pub n: usize,
    pub data: Vec<f64>,
}

impl SymMatrix {
    #[must_use]
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.n + j] = v;
    }

    /// Symmetric accumulate: adds `v` at (i, j) and (j, i).
    pub fn add_sym(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.n + j] += v;
        if i != j {
            self.data[j * self.n + i] += v;
        }
    }

    /// Row sums (weighted degrees).
    #[must_use]
    pub fn degrees(&self) -> Vec<f64> {
        (0..self.n)
            .map(|i| self.data[i * self.n..(i + 1) * self.n].iter().sum())
            .collect()
    }
}

/// Normalized Laplacian `L = I - D^{-1/2} A D^{-1/2}`. Zero-degree rows map
/// to zero off-diagonals (their diagonal stays 1 only if they have self
/// mass; isolated nodes produce a unit diagonal with no coupling).
#[must_use]
pub fn normalized_laplacian(adjacency: &SymMatrix) -> SymMatrix {
    let n = adjacency.n;
    let degrees = adjacency.degrees();
    let inv_sqrt: Vec<f64> = degrees
        .iter()
        .map(|&d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
        .collect();
    let mut l = SymMatrix::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let norm = adjacency.get(i, j) * inv_sqrt[i] * inv_sqrt[j];
            let identity = if i == j { 1.0 } else { 0.0 };
            l.set(i, j, identity - norm);
        }
    }
    l
}

/// Result of a symmetric eigendecomposition, eigenpairs sorted by
/// ascending eigenvalue.
#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    pub eigenvalues: Vec<f64>,
    /// Column-major eigenvectors: `vectors[v]` is the eigenvector paired
    /// with `eigenvalues[v]`.
    pub vectors: Vec<Vec<f64>>,
}

/// Cyclic Jacobi eigendecomposition for symmetric matrices.
///
/// Rotations zero one off-diagonal pair at a time; the sweep repeats until
/// the off-diagonal Frobenius mass drops under tolerance or the sweep cap
/// is hit. Cubic per sweep in n, which is fine for the catalog-sized
/// matrices clustering sees.
#[must_use]
pub fn jacobi_eigen(matrix: &SymMatrix) -> EigenDecomposition {
    let n = matrix.n;
    if n == 0 {
        return EigenDecomposition {
            eigenvalues: Vec::new(),
            vectors: Vec::new(),
        };
    }
    let mut a = matrix.data.clone();
    // Eigenvector accumulator, starts as identity.
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }

    let off_diagonal_mass = |a: &[f64]| -> f64 {
        let mut sum = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                sum += a[i * n + j] * a[i * n + j];
            }
        }
        sum
    };

    for _ in 0..JACOBI_MAX_SWEEPS {
        if off_diagonal_mass(&a) < JACOBI_TOLERANCE {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq.abs() < JACOBI_TOLERANCE {
                    continue;
                }
                let app = a[p * n + p];
                let aqq = a[q * n + q];
                let theta = (aqq - app) / (2.0 * apq);
                let t = if theta >= 0.0 {
                    1.0 / (theta + (1.0 + theta * theta).sqrt())
                } else {
                    -1.0 / (-theta + (1.0 + theta * theta).sqrt())
                };
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        a[i * n + i]
            .partial_cmp(&a[j * n + j])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let eigenvalues = order.iter().map(|&i| a[i * n + i]).collect();
    let vectors = order
        .iter()
        .map(|&col| (0..n).map(|row| v[row * n + col]).collect())
        .collect();
    EigenDecomposition {
        eigenvalues,
        vectors,
    }
}

/// Eigengap heuristic: pick k at the largest gap between sorted
/// eigenvalues 1..min(10, n-1), clamped to [2, 5].
#[must_use]
pub fn eigengap_k(eigenvalues: &[f64]) -> usize {
    let n = eigenvalues.len();
    if n < 3 {
        return 2;
    }
    let limit = 10.min(n - 1);
    let mut best_k = 2;
    let mut best_gap = f64::MIN;
    for i in 1..limit {
        let gap = eigenvalues[i + 1] - eigenvalues[i];
        if gap > best_gap {
            best_gap = gap;
            best_k = i + 1;
        }
    }
    best_k.clamp(2, 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laplacian_zero_degree_rows() {
        let mut a = SymMatrix::zeros(3);
        a.add_sym(0, 1, 1.0);
        let l = normalized_laplacian(&a);
        // Node 2 is isolated: unit diagonal, zero coupling.
        assert_eq!(l.get(2, 2), 1.0);
        assert_eq!(l.get(2, 0), 0.0);
        assert!((l.get(0, 1) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_jacobi_diagonal_matrix() {
        let mut m = SymMatrix::zeros(3);
        m.set(0, 0, 3.0);
        m.set(1, 1, 1.0);
        m.set(2, 2, 2.0);
        let eig = jacobi_eigen(&m);
        assert!((eig.eigenvalues[0] - 1.0).abs() < 1e-9);
        assert!((eig.eigenvalues[1] - 2.0).abs() < 1e-9);
        assert!((eig.eigenvalues[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_jacobi_known_2x2() {
        // [[2, 1], [1, 2]] has eigenvalues 1 and 3.
        let mut m = SymMatrix::zeros(2);
        m.set(0, 0, 2.0);
        m.set(1, 1, 2.0);
        m.add_sym(0, 1, 1.0);
        let eig = jacobi_eigen(&m);
        assert!((eig.eigenvalues[0] - 1.0).abs() < 1e-9);
        assert!((eig.eigenvalues[1] - 3.0).abs() < 1e-9);
        // Eigenvector for lambda=1 is (1, -1)/sqrt(2) up to sign.
        let v = &eig.vectors[0];
        assert!((v[0].abs() - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((v[0] + v[1]).abs() < 1e-6);
    }

    #[test]
    fn test_jacobi_reconstruction() {
        let mut m = SymMatrix::zeros(4);
        m.set(0, 0, 4.0);
        m.set(1, 1, 3.0);
        m.set(2, 2, 2.0);
        m.set(3, 3, 1.0);
        m.add_sym(0, 1, 0.5);
        m.add_sym(1, 2, 0.25);
        m.add_sym(0, 3, 0.1);
        let eig = jacobi_eigen(&m);
        // Sum of eigenvalues equals trace.
        let trace = 4.0 + 3.0 + 2.0 + 1.0;
        let sum: f64 = eig.eigenvalues.iter().sum();
        assert!((sum - trace).abs() < 1e-8);
        // Eigenvectors are orthonormal.
        for i in 0..4 {
            for j in 0..4 {
                let dot: f64 = (0..4).map(|k| eig.vectors[i][k] * eig.vectors[j][k]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-8, "v{i}.v{j} = {dot}");
            }
        }
    }

    #[test]
    fn test_eigengap_two_components() {
        // Two clean components: eigenvalues 0, 0, then a jump.
        let eigenvalues = [0.0, 0.0, 0.9, 1.0, 1.1];
        assert_eq!(eigengap_k(&eigenvalues), 2);
    }

    #[test]
    fn test_eigengap_clamped() {
        assert_eq!(eigengap_k(&[0.0, 1.0]), 2);
        // Gap at position 8 would suggest k=8; clamp to 5.
        let mut vals = vec![0.0; 9];
        vals.push(10.0);
        assert_eq!(eigengap_k(&vals), 5);
    }
}
