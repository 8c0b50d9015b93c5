//! Batch loss aggregation (ndarray path).
//!
//! For each example: decode both tensors, mask with the reference's padding, rebuild both
//! backbones over the structural extent, score with dRMSD. Examples are independent, so the map
//! runs as one rayon task per example; per-example losses come back in input order and are
//! reduced sequentially, so [`Parallelism::Rayon`] and [`Parallelism::Sequential`] return the
//! same bits.
//!
//! This path is not differentiable; see `burn_structure` for the training loss.

use crate::codec::{decode_angles, ENCODED_WIDTH};
use crate::config::{LossConfig, Parallelism};
use crate::drmsd::distance_rmsd;
use crate::geometry::BackboneGeometry;
use crate::mask::{unpad_pair, PaddingMask, SequenceLengths};
use crate::nerf::build_backbone;
use crate::{Error, Result};
use ndarray::{s, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Per-example losses and their mean.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLoss {
    pub per_example: Vec<f32>,
    pub mean: f32,
}

impl BatchLoss {
    /// Mean of `per_example`, accumulated in `f64` in input order.
    pub fn from_per_example(per_example: Vec<f32>) -> Result<Self> {
        if per_example.is_empty() {
            return Err(Error::Domain("batch must contain at least one example"));
        }
        let s: f64 = per_example.iter().map(|&x| x as f64).sum();
        let mean = (s / per_example.len() as f64) as f32;
        Ok(Self { per_example, mean })
    }
}

fn check_pair(pred: &ArrayView3<f32>, gold: &ArrayView3<f32>) -> Result<()> {
    if pred.dim() != gold.dim() {
        return Err(Error::Shape("pred and gold must have the same shape"));
    }
    if gold.dim().2 != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 channels"));
    }
    if gold.dim().0 == 0 {
        return Err(Error::Domain("batch must contain at least one example"));
    }
    Ok(())
}

fn example_mask(
    gold: &ArrayView2<f32>,
    lengths: Option<&SequenceLengths>,
    e: usize,
) -> Result<PaddingMask> {
    match lengths {
        Some(l) => PaddingMask::from_lengths(l.0[e], gold.nrows()),
        None => PaddingMask::from_encoded(gold),
    }
}

/// dRMSD between the backbones implied by one encoded `(len, 22)` prediction/reference pair.
pub fn example_structural_loss(
    pred: &ArrayView2<f32>,
    gold: &ArrayView2<f32>,
    mask: &PaddingMask,
    geom: &BackboneGeometry,
) -> Result<f32> {
    let pred_dec = decode_angles(pred)?;
    let gold_dec = decode_angles(gold)?;
    let (pred_dec, gold_dec) = unpad_pair(&pred_dec.view(), &gold_dec.view(), mask)?;

    let extent = mask.extent();
    if extent == 0 {
        debug!("all-padding example scores zero");
        return Ok(0.0);
    }
    let pred_xyz = build_backbone(&pred_dec.slice(s![..extent, ..]), geom)?;
    let gold_xyz = build_backbone(&gold_dec.slice(s![..extent, ..]), geom)?;
    distance_rmsd(&pred_xyz.view(), &gold_xyz.view())
}

/// Structural loss with per-example detail.
///
/// `lengths`, when given, replaces the zero-fill padding sentinel.
pub fn structural_loss_report(
    pred: &ArrayView3<f32>,
    gold: &ArrayView3<f32>,
    lengths: Option<&SequenceLengths>,
    cfg: &LossConfig,
) -> Result<BatchLoss> {
    check_pair(pred, gold)?;
    let b = gold.dim().0;
    if let Some(l) = lengths {
        if l.len() != b {
            return Err(Error::Shape("one length per example is required"));
        }
    }
    cfg.validate()?;

    let one = |e: usize| -> Result<f32> {
        let p = pred.index_axis(Axis(0), e);
        let g = gold.index_axis(Axis(0), e);
        let mask = example_mask(&g, lengths, e)?;
        let loss = example_structural_loss(&p, &g, &mask, &cfg.geometry)?;
        if !loss.is_finite() {
            warn!(example = e, loss, "non-finite structural loss");
        }
        Ok(loss)
    };

    let per_example = match cfg.parallelism {
        Parallelism::Sequential => (0..b).map(one).collect::<Result<Vec<f32>>>()?,
        Parallelism::Rayon => (0..b).into_par_iter().map(one).collect::<Result<Vec<f32>>>()?,
    };
    BatchLoss::from_per_example(per_example)
}

/// Mean dRMSD over the batch, padding inferred from the reference's zero-fill.
pub fn structural_loss(
    pred: &ArrayView3<f32>,
    gold: &ArrayView3<f32>,
    cfg: &LossConfig,
) -> Result<f32> {
    Ok(structural_loss_report(pred, gold, None, cfg)?.mean)
}

/// Mean dRMSD over the batch with explicit sequence lengths.
pub fn structural_loss_with_lengths(
    pred: &ArrayView3<f32>,
    gold: &ArrayView3<f32>,
    lengths: &SequenceLengths,
    cfg: &LossConfig,
) -> Result<f32> {
    Ok(structural_loss_report(pred, gold, Some(lengths), cfg)?.mean)
}

/// Masked mean squared error on decoded angles.
///
/// The mean runs over every `(example, residue, angle)` element; padded elements are zero in
/// both tensors and add nothing to the sum. Angle differences are not wrapped.
pub fn angle_mse_loss(
    pred: &ArrayView3<f32>,
    gold: &ArrayView3<f32>,
    lengths: Option<&SequenceLengths>,
) -> Result<f32> {
    check_pair(pred, gold)?;
    let b = gold.dim().0;
    if let Some(l) = lengths {
        if l.len() != b {
            return Err(Error::Shape("one length per example is required"));
        }
    }

    let mut s: f64 = 0.0;
    let mut count: usize = 0;
    for e in 0..b {
        let p = pred.index_axis(Axis(0), e);
        let g = gold.index_axis(Axis(0), e);
        let mask = example_mask(&g, lengths, e)?;
        let (pm, gm) = unpad_pair(&decode_angles(&p)?.view(), &decode_angles(&g)?.view(), &mask)?;
        for (x, y) in pm.iter().zip(gm.iter()) {
            let r = (x - y) as f64;
            s += r * r;
        }
        count += pm.len();
    }
    if count == 0 {
        return Ok(0.0);
    }
    Ok((s / count as f64) as f32)
}
