//! Burn-backed (opt-in) differentiable structural loss.
//!
//! Same pipeline as the ndarray path (`codec` → `mask` → `nerf` → `drmsd` → mean), expressed on
//! burn tensors so that `loss.backward()` reaches the predicted angle tensor. Instead of a loop
//! over examples, every NeRF step places one atom for **all** examples at once (`[batch, 3]`
//! tensors), and dRMSD is evaluated on `[batch, atoms, atoms]` distance tensors with a per-example
//! pair mask.
//!
//! Differences in structure length are handled by masking, not slicing: coordinates are built to
//! the longest extent in the batch, and each example only scores pairs inside its own extent.
//! Atoms after an example's extent are never read by earlier atoms (NeRF is causal), so this equals
//! building the truncated example on its own.
//!
//! Gradient hygiene:
//! - `atan2(0, 0)` has an undefined derivative. Padded prediction slots are overwritten with a
//!   benign pair before decoding (via `mask_fill`, whose backward zeroes those slots), so padding
//!   never injects NaN into the gradient. A model that emits exactly `(0, 0)` at a *valid* residue
//!   still gets a NaN gradient there.
//! - Distances are `sqrt(d² + ε)`; examples with no atom pairs skip the final `sqrt`.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Bool, ElementConversion, Tensor, TensorData};
use ndarray::Array3;

use crate::codec::{ENCODED_WIDTH, NUM_ANGLES};
use crate::geometry::{BackboneGeometry, ATOMS_PER_RESIDUE, NORM_EPS};
use crate::mask::SequenceLengths;
use crate::{Error, Result};

/// Copy a `(batch, len, width)` ndarray into a burn tensor on `device`.
pub fn ndarray_to_burn_3<B: Backend>(device: &B::Device, x: &Array3<f32>) -> Tensor<B, 3> {
    let (b, l, w) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [b, l, w]);
    Tensor::from_data(data, device)
}

/// Read a burn tensor back into a `(batch, len, width)` ndarray.
pub fn burn_to_ndarray_3<B: Backend>(x: Tensor<B, 3>) -> Result<Array3<f32>> {
    let [b, l, w] = x.dims();
    let values: Vec<f32> = x.into_data().iter::<f32>().collect();
    Array3::from_shape_vec((b, l, w), values).map_err(|_| Error::Shape("tensor data length"))
}

fn check_encoded<B: Backend>(t: &Tensor<B, 3>) -> Result<()> {
    if t.dims()[2] != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 channels"));
    }
    Ok(())
}

/// `(batch, len, 22)` `(cos, sin)` pairs → `(batch, len, 11)` angles via `atan2`.
pub fn decode_angles<B: Backend>(encoded: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
    check_encoded(&encoded)?;
    let [b, l, _] = encoded.dims();
    let pairs: Tensor<B, 4> = encoded.reshape([b, l, NUM_ANGLES, 2]);
    let cos: Tensor<B, 3> = pairs.clone().narrow(3, 0, 1).squeeze_dim(3);
    let sin: Tensor<B, 3> = pairs.narrow(3, 1, 1).squeeze_dim(3);
    Ok(sin.atan2(cos))
}

/// `[batch, len, 1]` mask, `true` where any of the 22 reference values is non-zero.
pub fn padding_mask<B: Backend>(gold_encoded: Tensor<B, 3>) -> Result<Tensor<B, 3, Bool>> {
    check_encoded(&gold_encoded)?;
    Ok(gold_encoded.not_equal_elem(0.0).any_dim(2))
}

/// `[batch, padded_len, 1]` mask, `true` for the first `lengths[e]` residues of example `e`.
pub fn lengths_mask<B: Backend>(
    lengths: &SequenceLengths,
    padded_len: usize,
    device: &B::Device,
) -> Result<Tensor<B, 3, Bool>> {
    if lengths.0.iter().any(|&l| l > padded_len) {
        return Err(Error::Domain("sequence length exceeds padded length"));
    }
    let b = lengths.len();
    let mut values = Vec::with_capacity(b * padded_len);
    for &len in &lengths.0 {
        values.extend((0..padded_len).map(|i| i < len));
    }
    Ok(Tensor::from_data(
        TensorData::new(values, [b, padded_len, 1]),
        device,
    ))
}

/// Per-example structural extent (one past the last valid residue) read back from a mask.
pub fn mask_extents<B: Backend>(mask: Tensor<B, 3, Bool>) -> Vec<usize> {
    let [b, l, _] = mask.dims();
    let flags: Vec<f32> = mask.float().into_data().iter::<f32>().collect();
    (0..b)
        .map(|e| {
            flags[e * l..(e + 1) * l]
                .iter()
                .rposition(|&v| v != 0.0)
                .map_or(0, |i| i + 1)
        })
        .collect()
}

/// Decode prediction and reference and zero both at residues where `mask` is false.
pub fn decode_unpadded<B: Backend>(
    pred: Tensor<B, 3>,
    gold: Tensor<B, 3>,
    mask: Tensor<B, 3, Bool>,
) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
    check_encoded(&pred)?;
    check_encoded(&gold)?;
    if pred.dims() != gold.dims() {
        return Err(Error::Shape("pred and gold must have the same shape"));
    }
    let [b, l, _] = gold.dims();
    if mask.dims() != [b, l, 1] {
        return Err(Error::Shape("mask must be [batch, len, 1]"));
    }
    let invalid = mask.bool_not();

    let pred = pred.mask_fill(invalid.clone().expand([b, l, ENCODED_WIDTH]), 1.0);
    let pred = decode_angles(pred)?;
    let gold = decode_angles(gold)?;

    let invalid = invalid.expand([b, l, NUM_ANGLES]);
    Ok((
        pred.mask_fill(invalid.clone(), 0.0),
        gold.mask_fill(invalid, 0.0),
    ))
}

fn normalize<B: Backend>(v: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = v.clone().square().sum_dim(1).add_scalar(NORM_EPS).sqrt();
    v / norm
}

/// Place one atom per example. `a`, `b`, `c` are `[batch, 3]`; `angle`, `torsion` are `[batch, 1]`.
pub fn place_atoms<B: Backend>(
    a: Tensor<B, 2>,
    b: Tensor<B, 2>,
    c: Tensor<B, 2>,
    bond: f32,
    angle: Tensor<B, 2>,
    torsion: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let d0 = angle.clone().cos().mul_scalar(-bond);
    let r_sin = angle.sin().mul_scalar(bond);
    let d1 = r_sin.clone() * torsion.clone().cos();
    let d2 = r_sin * torsion.sin();

    let bc = normalize(c.clone() - b.clone());
    let n = normalize((b - a).cross(bc.clone(), 1));
    let m1 = n.clone().cross(bc.clone(), 1);

    c + bc * d0 + m1 * d1 + n * d2
}

/// `[batch, len, 11]` decoded angles → `[batch, 3 * len, 3]` backbone coordinates on `device`.
pub fn build_backbone<B: Backend>(
    angles: Tensor<B, 3>,
    geom: &BackboneGeometry,
    device: &B::Device,
) -> Result<Tensor<B, 3>> {
    geom.validate()?;
    let [b, l, k] = angles.dims();
    if k != NUM_ANGLES {
        return Err(Error::Shape("decoded angles must have 11 channels"));
    }
    if l == 0 {
        return Ok(Tensor::zeros([b, 0, 3], device));
    }
    let angles = angles.to_device(device);
    let channel = |c: usize| -> Tensor<B, 2> { angles.clone().narrow(2, c, 1).squeeze_dim(2) };
    let lay = geom.layout;
    let phi = channel(lay.phi);
    let psi = channel(lay.psi);
    let omega = channel(lay.omega);
    let n_ca_c = channel(lay.n_ca_c);
    let ca_c_n = channel(lay.ca_c_n);
    let c_n_ca = channel(lay.c_n_ca);

    let mut atoms: Vec<Tensor<B, 2>> = geom
        .bootstrap
        .iter()
        .map(|p| {
            Tensor::<B, 1>::from_floats(*p, device)
                .unsqueeze::<2>()
                .repeat_dim(0, b)
        })
        .collect();
    atoms.reserve(ATOMS_PER_RESIDUE * (l - 1));

    let at = |t: &Tensor<B, 2>, i: usize| t.clone().narrow(1, i, 1);
    for i in 1..l {
        let k = atoms.len();
        let (n_prev, ca_prev, c_prev) = (
            atoms[k - 3].clone(),
            atoms[k - 2].clone(),
            atoms[k - 1].clone(),
        );
        let n = place_atoms(
            n_prev,
            ca_prev.clone(),
            c_prev.clone(),
            geom.c_n,
            at(&ca_c_n, i - 1),
            at(&psi, i - 1),
        );
        let ca = place_atoms(
            ca_prev,
            c_prev.clone(),
            n.clone(),
            geom.n_ca,
            at(&c_n_ca, i),
            at(&omega, i - 1),
        );
        let c = place_atoms(
            c_prev,
            n.clone(),
            ca.clone(),
            geom.ca_c,
            at(&n_ca_c, i),
            at(&phi, i),
        );
        atoms.push(n);
        atoms.push(ca);
        atoms.push(c);
    }
    Ok(Tensor::stack(atoms, 1))
}

/// `[batch, n, 3]` → `[batch, n, n]` distances, `sqrt(max(d², 0) + ε)`.
///
/// The diagonal holds `sqrt(ε)` rather than `0`; [`distance_rmsd`] never reads it. NaN
/// coordinates give NaN distances on every backend.
pub fn pairwise_distances<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 3> {
    let sq = x.clone().square().sum_dim(2);
    let gram = x.clone().matmul(x.swap_dims(1, 2));
    let d2 = sq.clone() + sq.swap_dims(1, 2) - gram.mul_scalar(2.0);
    // Only real negatives are raised; `clamp_min` may map NaN to 0 depending on the backend.
    let negative = d2.clone().lower_elem(0.0);
    d2.mask_fill(negative, 0.0).add_scalar(NORM_EPS).sqrt()
}

/// Per-example dRMSD, `[batch]`.
///
/// Example `e` scores the strict upper triangle of its first `atom_counts[e]` atoms; examples
/// with fewer than two atoms score `0`.
pub fn distance_rmsd<B: Backend>(
    pred_xyz: Tensor<B, 3>,
    gold_xyz: Tensor<B, 3>,
    atom_counts: &[usize],
) -> Result<Tensor<B, 1>> {
    if pred_xyz.dims() != gold_xyz.dims() {
        return Err(Error::Shape("coordinate sets must have the same shape"));
    }
    let [b, n, _] = pred_xyz.dims();
    if atom_counts.len() != b {
        return Err(Error::Shape("one atom count per example is required"));
    }
    if atom_counts.iter().any(|&c| c > n) {
        return Err(Error::Domain("atom count exceeds coordinate length"));
    }
    let device = pred_xyz.device();

    let mut pair_flags = Vec::with_capacity(b * n * n);
    let mut pair_counts = Vec::with_capacity(b);
    for &count in atom_counts {
        for i in 0..n {
            pair_flags.extend((0..n).map(|j| i < j && j < count));
        }
        pair_counts.push((count * count.saturating_sub(1) / 2) as f32);
    }
    let outside: Tensor<B, 3, Bool> =
        Tensor::<B, 3, Bool>::from_data(TensorData::new(pair_flags, [b, n, n]), &device)
            .bool_not();
    let empty: Tensor<B, 1, Bool> = Tensor::<B, 1>::from_floats(pair_counts.as_slice(), &device)
        .equal_elem(0.0);
    let denom = Tensor::<B, 1>::from_floats(pair_counts.as_slice(), &device).clamp_min(1.0);

    let diff = pairwise_distances(pred_xyz) - pairwise_distances(gold_xyz);
    let sum_sq: Tensor<B, 1> = diff
        .mask_fill(outside, 0.0)
        .square()
        .sum_dim(2)
        .sum_dim(1)
        .reshape([b]);
    let mse = sum_sq / denom;

    // sqrt'(0) is infinite; zero-pair examples take sqrt(1) and are zeroed afterwards.
    Ok(mse
        .mask_fill(empty.clone(), 1.0)
        .sqrt()
        .mask_fill(empty, 0.0))
}

/// Per-example structural losses `[batch]`.
///
/// Decoding and masking run where `pred`/`gold` live; reconstruction and scoring run on
/// `device`. `lengths`, when given, replaces the zero-fill padding sentinel.
pub fn structural_loss_per_example<B: Backend>(
    pred: Tensor<B, 3>,
    gold: Tensor<B, 3>,
    lengths: Option<&SequenceLengths>,
    geom: &BackboneGeometry,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    check_encoded(&gold)?;
    if pred.dims() != gold.dims() {
        return Err(Error::Shape("pred and gold must have the same shape"));
    }
    let [b, l, _] = gold.dims();
    if b == 0 {
        return Err(Error::Domain("batch must contain at least one example"));
    }
    let mask = match lengths {
        Some(lens) => {
            if lens.len() != b {
                return Err(Error::Shape("one length per example is required"));
            }
            lengths_mask::<B>(lens, l, &gold.device())?
        }
        None => padding_mask(gold.clone())?,
    };
    let extents = mask_extents(mask.clone());
    let (pred, gold) = decode_unpadded(pred, gold, mask)?;

    let max_extent = extents.iter().copied().max().unwrap_or(0);
    if max_extent == 0 {
        tracing::debug!(batch = b, "all-padding batch scores zero");
        return Ok(Tensor::zeros([b], device));
    }
    let pred = pred.narrow(1, 0, max_extent);
    let gold = gold.narrow(1, 0, max_extent);

    let pred_xyz = build_backbone(pred, geom, device)?;
    let gold_xyz = build_backbone(gold, geom, device)?;
    let atom_counts: Vec<usize> = extents
        .iter()
        .map(|&e| BackboneGeometry::atom_count(e))
        .collect();
    distance_rmsd(pred_xyz, gold_xyz, &atom_counts)
}

/// Mean dRMSD over the batch (`[1]`), padding inferred from the reference's zero-fill.
pub fn structural_loss<B: Backend>(
    pred: Tensor<B, 3>,
    gold: Tensor<B, 3>,
    geom: &BackboneGeometry,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    Ok(structural_loss_per_example(pred, gold, None, geom, device)?.mean())
}

/// Mean dRMSD over the batch (`[1]`) with explicit sequence lengths.
pub fn structural_loss_with_lengths<B: Backend>(
    pred: Tensor<B, 3>,
    gold: Tensor<B, 3>,
    lengths: &SequenceLengths,
    geom: &BackboneGeometry,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    Ok(structural_loss_per_example(pred, gold, Some(lengths), geom, device)?.mean())
}

/// Masked MSE on decoded angles (`[1]`), averaged over every element including padding.
pub fn angle_mse_loss<B: Backend>(
    pred: Tensor<B, 3>,
    gold: Tensor<B, 3>,
    lengths: Option<&SequenceLengths>,
) -> Result<Tensor<B, 1>> {
    check_encoded(&gold)?;
    if pred.dims() != gold.dims() {
        return Err(Error::Shape("pred and gold must have the same shape"));
    }
    let [b, l, _] = gold.dims();
    let mask = match lengths {
        Some(lens) => {
            if lens.len() != b {
                return Err(Error::Shape("one length per example is required"));
            }
            lengths_mask::<B>(lens, l, &gold.device())?
        }
        None => padding_mask(gold.clone())?,
    };
    let (pred, gold) = decode_unpadded(pred, gold, mask)?;
    Ok((pred - gold).square().mean())
}

/// Read a `[1]` loss tensor as `f32`.
pub fn scalar<B: Backend>(loss: Tensor<B, 1>) -> f32 {
    loss.into_scalar().elem::<f32>()
}
