//! Angle codec: `(cos, sin)` pairs <-> angles.
//!
//! Decoding uses `atan2(sin, cos)`, which needs no unit-length assumption: a predicted pair
//! `(2.0, 2.0)` decodes to π/4 just like `(√½, √½)`. `acos`/`asin` would require normalised
//! inputs and lose conditioning near ±1.

use crate::{Error, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Angles per residue.
pub const NUM_ANGLES: usize = 11;

/// Encoded values per residue (`2 * NUM_ANGLES`).
pub const ENCODED_WIDTH: usize = 2 * NUM_ANGLES;

/// Map any real angle to `(-π, π]`.
pub fn wrap_pi(x: f32) -> f32 {
    let two_pi = 2.0 * core::f32::consts::PI;
    let mut y = x % two_pi;
    if y <= -core::f32::consts::PI {
        y += two_pi;
    }
    if y > core::f32::consts::PI {
        y -= two_pi;
    }
    y
}

/// Decode one pair. `(0, 0)` decodes to `0`.
#[inline]
pub fn decode_pair(cos: f32, sin: f32) -> f32 {
    sin.atan2(cos)
}

/// Decode a `(len, 22)` encoded sequence into `(len, 11)` angles in radians.
pub fn decode_angles(encoded: &ArrayView2<f32>) -> Result<Array2<f32>> {
    if encoded.ncols() != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 columns"));
    }
    let len = encoded.nrows();
    let mut out = Array2::<f32>::zeros((len, NUM_ANGLES));
    for i in 0..len {
        for k in 0..NUM_ANGLES {
            out[[i, k]] = decode_pair(encoded[[i, 2 * k]], encoded[[i, 2 * k + 1]]);
        }
    }
    Ok(out)
}

/// Batched [`decode_angles`]: `(batch, len, 22)` -> `(batch, len, 11)`.
pub fn decode_batch(encoded: &ArrayView3<f32>) -> Result<Array3<f32>> {
    let (b, len, width) = encoded.dim();
    if width != ENCODED_WIDTH {
        return Err(Error::Shape("encoded angles must have 22 channels"));
    }
    let mut out = Array3::<f32>::zeros((b, len, NUM_ANGLES));
    for e in 0..b {
        for i in 0..len {
            for k in 0..NUM_ANGLES {
                out[[e, i, k]] = decode_pair(encoded[[e, i, 2 * k]], encoded[[e, i, 2 * k + 1]]);
            }
        }
    }
    Ok(out)
}

/// Encode `(len, 11)` angles as `(len, 22)` `(cos, sin)` pairs.
pub fn encode_angles(angles: &ArrayView2<f32>) -> Result<Array2<f32>> {
    if angles.ncols() != NUM_ANGLES {
        return Err(Error::Shape("angles must have 11 columns"));
    }
    let len = angles.nrows();
    let mut out = Array2::<f32>::zeros((len, ENCODED_WIDTH));
    for i in 0..len {
        for k in 0..NUM_ANGLES {
            let theta = angles[[i, k]];
            out[[i, 2 * k]] = theta.cos();
            out[[i, 2 * k + 1]] = theta.sin();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_is_scale_free_and_zero_pair_is_zero() {
        let mut enc = Array2::<f32>::zeros((2, ENCODED_WIDTH));
        enc[[0, 0]] = 2.0;
        enc[[0, 1]] = 2.0;
        enc[[0, 2]] = -0.5;
        enc[[0, 3]] = 0.0;
        let dec = decode_angles(&enc.view()).unwrap();
        assert!((dec[[0, 0]] - core::f32::consts::FRAC_PI_4).abs() < 1e-6);
        assert!((dec[[0, 1]] - core::f32::consts::PI).abs() < 1e-6);
        for k in 0..NUM_ANGLES {
            assert_eq!(dec[[1, k]], 0.0);
        }
    }

    #[test]
    fn wrong_width_is_a_shape_error() {
        let enc = Array2::<f32>::zeros((3, 20));
        assert!(matches!(decode_angles(&enc.view()), Err(Error::Shape(_))));
        let enc = Array3::<f32>::zeros((1, 3, 21));
        assert!(decode_batch(&enc.view()).is_err());
    }

    #[test]
    fn wrap_pi_lands_in_half_open_interval() {
        let pi = core::f32::consts::PI;
        assert!((wrap_pi(2.0 * pi + 0.5) - 0.5).abs() < 1e-5);
        assert!((wrap_pi(-2.0 * pi - 0.5) + 0.5).abs() < 1e-5);
        assert!((wrap_pi(pi + 0.1) - (0.1 - pi)).abs() < 1e-5);
        assert!((wrap_pi(-pi) - pi).abs() < 1e-5);
        assert!((wrap_pi(0.25) - 0.25).abs() < 1e-7);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_encode_then_decode_recovers_angles(
            raw in prop::collection::vec(-3.14159f32..3.14159f32, NUM_ANGLES * 4),
        ) {
            let angles = Array2::from_shape_vec((4, NUM_ANGLES), raw).unwrap();
            let enc = encode_angles(&angles.view()).unwrap();
            let dec = decode_angles(&enc.view()).unwrap();
            for (a, b) in angles.iter().zip(dec.iter()) {
                // Compare on the circle: near ±π the decoded value may flip sign.
                let d = wrap_pi(a - b).abs();
                prop_assert!(d <= 1e-5, "roundtrip drift {d} for {a}");
            }
        }
    }
}
