// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dense numeric kernel for the attention model.
//!
//! Everything here is a pure function over contiguous row-major buffers with
//! explicit shapes; no ragged nested arrays. Multi-head weights are laid out
//! `[head][row][col]` inside one buffer so a head is a contiguous slice.
//! The hot path allocates nothing beyond its output.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A dense row-major matrix with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Row count.
    pub rows: usize,
    /// Column count.
    pub cols: usize,
    /// Row-major data; `data[r * cols + c]`.
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap an existing row-major buffer. The buffer length must equal
    /// `rows * cols`.
    #[must_use]
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    /// Borrow row `r` as a slice.
    #[inline]
    #[must_use]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Borrow row `r` mutably.
    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Element access.
    #[inline]
    #[must_use]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    /// Element assignment.
    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    /// Shape as `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// True if any element is NaN or infinite.
    #[must_use]
    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }
}

/// A stack of per-head matrices in one contiguous buffer, laid out
/// `[head][row][col]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadTensor {
    /// Head count.
    pub heads: usize,
    /// Rows per head.
    pub rows: usize,
    /// Columns per head.
    pub cols: usize,
    /// `data[((h * rows) + r) * cols + c]`.
    pub data: Vec<f32>,
}

impl HeadTensor {
    /// Create a zero-filled head stack.
    #[must_use]
    pub fn zeros(heads: usize, rows: usize, cols: usize) -> Self {
        Self {
            heads,
            rows,
            cols,
            data: vec![0.0; heads * rows * cols],
        }
    }

    /// Borrow head `h` as a temporary [`Tensor`] view (copies the slice
    /// header, not the data).
    #[inline]
    #[must_use]
    pub fn head(&self, h: usize) -> &[f32] {
        let len = self.rows * self.cols;
        &self.data[h * len..(h + 1) * len]
    }

    /// Borrow head `h` mutably.
    #[inline]
    pub fn head_mut(&mut self, h: usize) -> &mut [f32] {
        let len = self.rows * self.cols;
        &mut self.data[h * len..(h + 1) * len]
    }
}

/// `C[m x n] = A[m x k] * B[k x n]`.
///
/// Inner loop is ordered `i-k-j` so both `B` and `C` stream row-major.
#[must_use]
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    debug_assert_eq!(a.cols, b.rows);
    let (m, k, n) = (a.rows, a.cols, b.cols);
    let mut out = Tensor::zeros(m, n);
    for i in 0..m {
        let a_row = a.row(i);
        let out_row = out.row_mut(i);
        for (p, &a_ip) in a_row.iter().enumerate().take(k) {
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b.data[p * n..(p + 1) * n];
            for j in 0..n {
                out_row[j] += a_ip * b_row[j];
            }
        }
    }
    out
}

/// `Y[b x h] = X[b x d] * W^T` for `W[h x d]`.
///
/// Row-major W stores one output unit per row, so the transpose multiply is
/// a sequence of dot products over contiguous slices.
#[must_use]
pub fn matmul_transpose(x: &Tensor, w: &Tensor) -> Tensor {
    debug_assert_eq!(x.cols, w.cols);
    let (b, h) = (x.rows, w.rows);
    let mut out = Tensor::zeros(b, h);
    for i in 0..b {
        let x_row = x.row(i);
        let out_row = out.row_mut(i);
        for (j, out_j) in out_row.iter_mut().enumerate().take(h) {
            *out_j = dot(x_row, w.row(j));
        }
    }
    out
}

/// Dot product of two equal-length slices.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Numerically stable softmax. Empty input yields an empty output.
#[must_use]
pub fn softmax(v: &[f32]) -> Vec<f32> {
    if v.is_empty() {
        return Vec::new();
    }
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out: Vec<f32> = v.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = out.iter().sum();
    if sum > 0.0 {
        for x in &mut out {
            *x /= sum;
        }
    } else {
        // All-(-inf) input; fall back to uniform.
        let uniform = 1.0 / out.len() as f32;
        for x in &mut out {
            *x = uniform;
        }
    }
    out
}

/// Softmax over the entries of `v` selected by `mask`; unselected entries
/// are written as 0. Used for incidence-masked attention columns.
#[must_use]
pub fn masked_softmax(v: &[f32], mask: &[bool]) -> Vec<f32> {
    debug_assert_eq!(v.len(), mask.len());
    let selected: Vec<f32> = v
        .iter()
        .zip(mask.iter())
        .filter(|(_, &m)| m)
        .map(|(&x, _)| x)
        .collect();
    let soft = softmax(&selected);
    let mut out = vec![0.0; v.len()];
    let mut si = 0;
    for (o, &m) in out.iter_mut().zip(mask.iter()) {
        if m {
            *o = soft[si];
            si += 1;
        }
    }
    out
}

/// LeakyReLU with negative slope `alpha`.
#[inline]
#[must_use]
pub fn leaky_relu(x: f32, alpha: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        alpha * x
    }
}

/// Exponential linear unit; output is bounded below by -1.
#[inline]
#[must_use]
pub fn elu(x: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        x.exp() - 1.0
    }
}

/// ReLU applied in place over a slice.
pub fn relu_in_place(v: &mut [f32]) {
    for x in v {
        if *x < 0.0 {
            *x = 0.0;
        }
    }
}

/// Logistic sigmoid.
#[inline]
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Cosine similarity. Returns 0 when either vector has zero norm or the
/// lengths differ (an undefined comparison scores as no similarity).
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot = dot(a, b);
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// L2 norm.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v {
            *x /= n;
        }
    }
}

/// Mean-pool a set of equal-length rows into one vector of length `dim`.
/// Empty input yields the zero vector.
#[must_use]
pub fn mean_pool(rows: &[&[f32]], dim: usize) -> Vec<f32> {
    let mut out = vec![0.0; dim];
    if rows.is_empty() {
        return out;
    }
    for row in rows {
        debug_assert_eq!(row.len(), dim);
        for (o, &x) in out.iter_mut().zip(row.iter()) {
            *o += x;
        }
    }
    let inv = 1.0 / rows.len() as f32;
    for o in &mut out {
        *o *= inv;
    }
    out
}

/// Inverted-scaling dropout. Identity when `p == 0`; otherwise surviving
/// elements are scaled by `1 / (1 - p)` so activations keep their expected
/// magnitude.
pub fn apply_dropout(m: &mut Tensor, p: f32, rng: &mut StdRng) {
    if p <= 0.0 {
        return;
    }
    debug_assert!(p < 1.0);
    let scale = 1.0 / (1.0 - p);
    for x in &mut m.data {
        if rng.gen::<f32>() < p {
            *x = 0.0;
        } else {
            *x *= scale;
        }
    }
}

/// Concatenate two slices into a fresh buffer (`[a || b]`).
#[must_use]
pub fn concat(a: &[f32], b: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn test_matmul_identity() {
        let a = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let i = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(matmul(&a, &i), a);
    }

    #[test]
    fn test_matmul_shapes() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        let b = Tensor::from_vec(3, 1, vec![1.0, 1.0, 1.0]);
        let c = matmul(&a, &b);
        assert_eq!(c.shape(), (2, 1));
        assert_eq!(c.data, vec![3.0, 3.0]);
    }

    #[test]
    fn test_matmul_transpose_matches_explicit() {
        let x = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]);
        let w = Tensor::from_vec(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        let y = matmul_transpose(&x, &w);
        assert_eq!(y.shape(), (1, 2));
        assert_eq!(y.data, vec![1.0, 5.0]);
    }

    #[test]
    fn test_softmax_empty() {
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_softmax_stability_under_large_inputs() {
        let out = softmax(&[1000.0, 1000.0]);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_masked_softmax_zeroes_unselected() {
        let out = masked_softmax(&[1.0, 2.0, 3.0], &[true, false, true]);
        assert_eq!(out[1], 0.0);
        assert!((out[0] + out[2] - 1.0).abs() < 1e-6);
        assert!(out[2] > out[0]);
    }

    #[test]
    fn test_elu_lower_bound() {
        assert!(elu(-100.0) >= -1.0);
        assert_eq!(elu(3.0), 3.0);
    }

    #[test]
    fn test_leaky_relu() {
        assert_eq!(leaky_relu(2.0, 0.2), 2.0);
        assert!((leaky_relu(-2.0, 0.2) + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_orthogonal_and_parallel() {
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_empty_is_zero_vector() {
        let out = mean_pool(&[], 3);
        assert_eq!(out, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mean_pool_averages_rows() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let out = mean_pool(&[&a, &b], 2);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_dropout_identity_at_zero() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut m = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]);
        let before = m.clone();
        apply_dropout(&mut m, 0.0, &mut rng);
        assert_eq!(m, before);
    }

    #[test]
    fn test_dropout_scales_survivors() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut m = Tensor::from_vec(1, 1000, vec![1.0; 1000]);
        apply_dropout(&mut m, 0.5, &mut rng);
        for &x in &m.data {
            assert!(x == 0.0 || (x - 2.0).abs() < 1e-6);
        }
        // Expected survivor mass stays near the original.
        let sum: f32 = m.data.iter().sum();
        assert!((sum - 1000.0).abs() < 150.0);
    }

    #[test]
    fn test_head_tensor_layout() {
        let mut h = HeadTensor::zeros(2, 2, 3);
        h.head_mut(1)[0] = 9.0;
        assert_eq!(h.data[6], 9.0);
        assert_eq!(h.head(0).iter().copied().sum::<f32>(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_softmax_sums_to_one(v in proptest::collection::vec(-50.0f32..50.0, 1..32)) {
            let out = softmax(&v);
            let sum: f32 = out.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-5);
            prop_assert!(out.iter().all(|&x| x >= 0.0));
        }

        #[test]
        fn prop_elu_bounded_below(x in -100.0f32..100.0) {
            prop_assert!(elu(x) >= -1.0);
        }

        #[test]
        fn prop_leaky_relu_dominates_slope(x in -100.0f32..100.0, a in 0.0f32..1.0) {
            prop_assert!(leaky_relu(x, a) >= a * x - 1e-6);
        }

        #[test]
        fn prop_l2_normalize_unit_norm(v in proptest::collection::vec(-10.0f32..10.0, 1..64)) {
            let mut v = v;
            let nonzero = v.iter().any(|&x| x != 0.0);
            l2_normalize(&mut v);
            if nonzero {
                prop_assert!((norm(&v) - 1.0).abs() < 1e-4);
            }
        }

        #[test]
        fn prop_cosine_in_range(
            a in proptest::collection::vec(-10.0f32..10.0, 8),
            b in proptest::collection::vec(-10.0f32..10.0, 8),
        ) {
            let c = cosine(&a, &b);
            prop_assert!((-1.0 - 1e-4..=1.0 + 1e-4).contains(&c));
        }
    }
}
