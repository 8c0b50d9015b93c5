//! Distance RMSD (dRMSD).
//!
//! Two structures are compared through their internal distance matrices, so no superposition is
//! needed and the score is invariant to rotating or translating either input:
//!
//! \[
//! \mathrm{dRMSD}(A, B) = \sqrt{\frac{2}{n(n-1)} \sum_{i<j} \big(D^A_{ij} - D^B_{ij}\big)^2}.
//! \]
//!
//! Only the strict upper triangle is scored; the diagonal is always zero and the lower triangle
//! repeats the upper one.

use crate::geometry::NORM_EPS;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Pairwise Euclidean distances of `(n, 3)` coordinates.
///
/// Squared distances use the Gram form `|xᵢ|² + |xⱼ|² - 2 xᵢ·xⱼ`; rounding can push that below
/// zero, so negative values are raised to zero before the square root. NaN coordinates are not
/// clamped and yield NaN distances. Off-diagonal entries are `sqrt(d² + NORM_EPS)`, matching the
/// differentiable path; the diagonal is exactly `0`.
pub fn pairwise_distances(x: &ArrayView2<f32>) -> Result<Array2<f32>> {
    if x.ncols() != 3 {
        return Err(Error::Shape("coordinates must have 3 columns"));
    }
    let n = x.nrows();
    let sq: Vec<f32> = x.rows().into_iter().map(|r| r.dot(&r)).collect();
    let gram = x.dot(&x.t());
    let mut d = Array2::<f32>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let raw = sq[i] + sq[j] - 2.0 * gram[[i, j]];
            // `f32::max` would turn NaN into 0.
            let d2 = if raw < 0.0 { 0.0 } else { raw };
            let v = (d2 + NORM_EPS).sqrt();
            d[[i, j]] = v;
            d[[j, i]] = v;
        }
    }
    Ok(d)
}

/// dRMSD between two `(n, 3)` coordinate sets.
///
/// Returns `0` for `n <= 1` (no pairs). Mismatched atom counts are a `Shape` error. A non-finite
/// coordinate gives a non-finite score.
pub fn distance_rmsd(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Result<f32> {
    if a.dim() != b.dim() {
        return Err(Error::Shape("coordinate sets must have the same shape"));
    }
    let n = a.nrows();
    if n <= 1 {
        return Ok(0.0);
    }
    let da = pairwise_distances(a)?;
    let db = pairwise_distances(b)?;

    let mut s: f64 = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let r = (da[[i, j]] - db[[i, j]]) as f64;
            s += r * r;
        }
    }
    let pairs = (n * (n - 1) / 2) as f64;
    Ok((s / pairs).sqrt() as f32)
}
