//! Seeded synthetic batches of padded, encoded backbone angles.
//!
//! Real training data comes from outside this crate. These batches exist so tests, benches and
//! demos can exercise the pipeline on plausible geometry: φ/ψ drawn around the α-helix or
//! β-sheet basin, ω near `π`, bond angles near their ideal values, χ uniform.

use crate::codec::{encode_angles, wrap_pi, ENCODED_WIDTH, NUM_ANGLES};
use crate::mask::SequenceLengths;
use crate::{Error, Result};
use ndarray::{s, Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Draw one `(len, 11)` decoded angle sequence.
pub fn random_angles(len: usize, rng: &mut impl Rng) -> Result<Array2<f32>> {
    let noise = Normal::new(0.0f32, 0.2).map_err(|_| Error::Domain("invalid noise scale"))?;
    let bond_noise = Normal::new(0.0f32, 0.03).map_err(|_| Error::Domain("invalid noise scale"))?;
    let pi = core::f32::consts::PI;

    let mut a = Array2::<f32>::zeros((len, NUM_ANGLES));
    for i in 0..len {
        let (phi, psi) = if rng.random_bool(0.6) {
            ((-57.0f32).to_radians(), (-47.0f32).to_radians())
        } else {
            ((-119.0f32).to_radians(), 113.0f32.to_radians())
        };
        a[[i, 0]] = wrap_pi(phi + noise.sample(rng));
        a[[i, 1]] = wrap_pi(psi + noise.sample(rng));
        a[[i, 2]] = wrap_pi(pi + 0.1 * noise.sample(rng));
        a[[i, 3]] = 111.2f32.to_radians() + bond_noise.sample(rng);
        a[[i, 4]] = 116.2f32.to_radians() + bond_noise.sample(rng);
        a[[i, 5]] = 121.7f32.to_radians() + bond_noise.sample(rng);
        for k in 6..NUM_ANGLES {
            a[[i, k]] = rng.random_range(-pi..pi);
        }
    }
    Ok(a)
}

/// A `(batch, max_len, 22)` encoded batch, zero-padded, and the true lengths.
///
/// Lengths are uniform in `[min_len, max_len]`.
pub fn random_angle_batch(
    batch: usize,
    max_len: usize,
    min_len: usize,
    seed: u64,
) -> Result<(Array3<f32>, SequenceLengths)> {
    if batch == 0 || max_len == 0 {
        return Err(Error::Domain("batch and max_len must be >= 1"));
    }
    if min_len > max_len {
        return Err(Error::Domain("min_len must not exceed max_len"));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = Array3::<f32>::zeros((batch, max_len, ENCODED_WIDTH));
    let mut lengths = Vec::with_capacity(batch);
    for e in 0..batch {
        let len = rng.random_range(min_len..=max_len);
        let enc = encode_angles(&random_angles(len, &mut rng)?.view())?;
        out.slice_mut(s![e, ..len, ..]).assign(&enc);
        lengths.push(len);
    }
    Ok((out, SequenceLengths(lengths)))
}

/// Perturb the valid residues of an encoded batch: decode, add Gaussian noise of `scale`
/// radians to every angle, re-encode. Padding stays zero.
pub fn perturb_batch(
    encoded: &Array3<f32>,
    lengths: &SequenceLengths,
    scale: f32,
    seed: u64,
) -> Result<Array3<f32>> {
    let (b, l, width) = encoded.dim();
    if width != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 channels"));
    }
    if lengths.len() != b {
        return Err(Error::Shape("one length per example is required"));
    }
    if lengths.0.iter().any(|&len| len > l) {
        return Err(Error::Domain("sequence length exceeds padded length"));
    }
    let noise = Normal::new(0.0f32, scale).map_err(|_| Error::Domain("invalid noise scale"))?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut out = encoded.clone();
    for (e, &len) in lengths.0.iter().enumerate() {
        let mut dec = crate::codec::decode_angles(&encoded.slice(s![e, ..len, ..]))?;
        dec.mapv_inplace(|x| wrap_pi(x + noise.sample(&mut rng)));
        out.slice_mut(s![e, ..len, ..])
            .assign(&encode_angles(&dec.view())?);
    }
    Ok(out)
}

/// Per-residue token ids for an encoded batch: `1` where ψ < 0 (helical basin), `2` otherwise,
/// `0` for padding. Gives a sequence model something learnable on synthetic data.
pub fn basin_tokens(encoded: &Array3<f32>, lengths: &SequenceLengths) -> Result<Array2<i64>> {
    let (b, l, width) = encoded.dim();
    if width != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 channels"));
    }
    if lengths.len() != b {
        return Err(Error::Shape("one length per example is required"));
    }
    let mut out = Array2::<i64>::zeros((b, l));
    for (e, &len) in lengths.0.iter().enumerate() {
        if len > l {
            return Err(Error::Domain("sequence length exceeds padded length"));
        }
        let dec = crate::codec::decode_angles(&encoded.slice(s![e, ..len, ..]))?;
        for i in 0..len {
            out[[e, i]] = if dec[[i, 1]] < 0.0 { 1 } else { 2 };
        }
    }
    Ok(out)
}

/// 1-based position ids, `0` for padding.
pub fn position_ids(lengths: &SequenceLengths, padded_len: usize) -> Result<Array2<i64>> {
    let mut out = Array2::<i64>::zeros((lengths.len(), padded_len));
    for (e, &len) in lengths.0.iter().enumerate() {
        if len > padded_len {
            return Err(Error::Domain("sequence length exceeds padded length"));
        }
        for i in 0..len {
            out[[e, i]] = (i + 1) as i64;
        }
    }
    Ok(out)
}
