//! Per-residue validity masks.
//!
//! Padding is zero-fill: a padded residue has all 22 encoded values equal to `0`. The mask is
//! derived once from the **reference** and applied to both prediction and reference, so
//! whatever the model emits at padded positions never reaches the loss.
//!
//! Zero-fill cannot tell padding from a residue whose encoding is genuinely all zeros (no real
//! angle encodes to `(0, 0)`, but a corrupted reference could). Callers that know their lengths
//! should pass them ([`PaddingMask::from_lengths`]) instead of relying on content.

use crate::codec::{ENCODED_WIDTH, NUM_ANGLES};
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2, ArrayView3};

/// Explicit per-example sequence lengths for a padded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLengths(pub Vec<usize>);

impl SequenceLengths {
    /// Lengths inferred from zero-fill, one per example of a `(batch, len, 22)` tensor.
    ///
    /// Each length is the structural extent (see [`PaddingMask::extent`]).
    pub fn from_encoded_batch(encoded: &ArrayView3<f32>) -> Result<Self> {
        let (b, _, width) = encoded.dim();
        if width != ENCODED_WIDTH {
            return Err(Error::Shape("encoded angles must have 22 channels"));
        }
        let mut out = Vec::with_capacity(b);
        for e in 0..b {
            let m = PaddingMask::from_encoded(&encoded.index_axis(ndarray::Axis(0), e))?;
            out.push(m.extent());
        }
        Ok(Self(out))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `true` at residues that carry data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingMask {
    valid: Vec<bool>,
}

impl PaddingMask {
    /// Residue `i` is valid iff any of its 22 encoded values is non-zero.
    pub fn from_encoded(encoded: &ArrayView2<f32>) -> Result<Self> {
        if encoded.ncols() != ENCODED_WIDTH {
            return Err(Error::Shape("encoded angles must have 22 columns"));
        }
        Ok(Self::from_rows(encoded))
    }

    /// Residue `i` is valid iff any of its 11 decoded angles is non-zero.
    ///
    /// Fallback for callers that only hold decoded angles. A residue whose true angles all
    /// decode to exactly `0` is indistinguishable from padding here.
    pub fn from_decoded(decoded: &ArrayView2<f32>) -> Result<Self> {
        if decoded.ncols() != NUM_ANGLES {
            return Err(Error::Shape("decoded angles must have 11 columns"));
        }
        Ok(Self::from_rows(decoded))
    }

    /// The first `length` of `padded_len` residues are valid.
    pub fn from_lengths(length: usize, padded_len: usize) -> Result<Self> {
        if length > padded_len {
            return Err(Error::Domain("sequence length exceeds padded length"));
        }
        Ok(Self {
            valid: (0..padded_len).map(|i| i < length).collect(),
        })
    }

    fn from_rows(rows: &ArrayView2<f32>) -> Self {
        let valid = rows
            .rows()
            .into_iter()
            .map(|r| r.iter().any(|&x| x != 0.0))
            .collect();
        Self { valid }
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn is_valid(&self, i: usize) -> bool {
        self.valid.get(i).copied().unwrap_or(false)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.valid
    }

    /// Number of valid residues.
    pub fn count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// One past the last valid residue (0 if none).
    ///
    /// Structures are built over `[0, extent)`; trailing padding never becomes atoms.
    pub fn extent(&self) -> usize {
        self.valid.iter().rposition(|&v| v).map_or(0, |i| i + 1)
    }

    /// Zero the rows of `x` at invalid residues.
    pub fn apply(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.nrows() != self.valid.len() {
            return Err(Error::Shape("mask length must match sequence length"));
        }
        let mut out = x.to_owned();
        for (i, mut row) in out.rows_mut().into_iter().enumerate() {
            if !self.valid[i] {
                row.fill(0.0);
            }
        }
        Ok(out)
    }
}

/// Mask both decoded tensors with `mask` (derived from the reference).
pub fn unpad_pair(
    pred: &ArrayView2<f32>,
    gold: &ArrayView2<f32>,
    mask: &PaddingMask,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if pred.dim() != gold.dim() {
        return Err(Error::Shape("pred and gold must have the same shape"));
    }
    Ok((mask.apply(pred)?, mask.apply(gold)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn padded_encoding(len: usize, padded: usize) -> Array2<f32> {
        let mut enc = Array2::<f32>::zeros((padded, ENCODED_WIDTH));
        for i in 0..len {
            for k in 0..NUM_ANGLES {
                let theta = 0.1 * (i * NUM_ANGLES + k) as f32;
                enc[[i, 2 * k]] = theta.cos();
                enc[[i, 2 * k + 1]] = theta.sin();
            }
        }
        enc
    }

    #[test]
    fn zero_fill_marks_trailing_residues_invalid() {
        let enc = padded_encoding(3, 6);
        let m = PaddingMask::from_encoded(&enc.view()).unwrap();
        assert_eq!(m.as_slice(), &[true, true, true, false, false, false]);
        assert_eq!(m.count(), 3);
        assert_eq!(m.extent(), 3);
        assert_eq!(m, PaddingMask::from_lengths(3, 6).unwrap());
    }

    #[test]
    fn all_padding_has_zero_extent() {
        let enc = Array2::<f32>::zeros((4, ENCODED_WIDTH));
        let m = PaddingMask::from_encoded(&enc.view()).unwrap();
        assert_eq!(m.count(), 0);
        assert_eq!(m.extent(), 0);
    }

    #[test]
    fn unpad_zeroes_prediction_where_reference_is_padding() {
        let gold = Array2::<f32>::from_shape_fn((4, NUM_ANGLES), |(i, _)| if i < 2 { 0.5 } else { 0.0 });
        let pred = Array2::<f32>::from_elem((4, NUM_ANGLES), 1.25);
        let mask = PaddingMask::from_decoded(&gold.view()).unwrap();
        let (p, g) = unpad_pair(&pred.view(), &gold.view(), &mask).unwrap();
        assert!(p.row(0).iter().all(|&x| x == 1.25));
        assert!(p.row(3).iter().all(|&x| x == 0.0));
        assert_eq!(g, gold);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = Array2::<f32>::zeros((3, NUM_ANGLES));
        let b = Array2::<f32>::zeros((4, NUM_ANGLES));
        let m = PaddingMask::from_lengths(3, 3).unwrap();
        assert!(unpad_pair(&a.view(), &b.view(), &m).is_err());
        assert!(PaddingMask::from_lengths(5, 4).is_err());
    }

    #[test]
    fn batch_lengths_match_per_example_extent() {
        let mut batch = ndarray::Array3::<f32>::zeros((2, 5, ENCODED_WIDTH));
        batch
            .index_axis_mut(ndarray::Axis(0), 0)
            .assign(&padded_encoding(5, 5));
        batch
            .index_axis_mut(ndarray::Axis(0), 1)
            .assign(&padded_encoding(2, 5));
        let lens = SequenceLengths::from_encoded_batch(&batch.view()).unwrap();
        assert_eq!(lens, SequenceLengths(vec![5, 2]));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_mask_is_idempotent(
            len in 0usize..12,
            extra in 0usize..6,
            fill in -4.0f32..4.0f32,
        ) {
            let padded = len + extra;
            let enc = padded_encoding(len, padded);
            let mask = PaddingMask::from_encoded(&enc.view()).unwrap();
            let x = Array2::<f32>::from_elem((padded, NUM_ANGLES), fill);
            let once = mask.apply(&x.view()).unwrap();
            let twice = mask.apply(&once.view()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
