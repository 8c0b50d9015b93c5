//! NeRF (Natural Extension Reference Frame) backbone reconstruction.
//!
//! Each atom `d` is placed from the three atoms before it (`a`, `b`, `c`), a bond length `r`
//! (`|cd|`), a bond angle `θ` (`∠bcd`) and a torsion `τ` (about `bc`):
//!
//! \[
//! d_2 = (-r\cos\theta,\; r\sin\theta\cos\tau,\; r\sin\theta\sin\tau),\qquad
//! d = c + [\hat{bc},\; \hat n \times \hat{bc},\; \hat n]\, d_2,
//! \]
//!
//! with \(\hat n = \widehat{ab \times \hat{bc}}\). Per residue `i ≥ 1`:
//!
//! - `N(i)`  from `N(i-1), CA(i-1), C(i-1)` with `C-N`, `∠CA-C-N(i-1)`, `ψ(i-1)`
//! - `CA(i)` from `CA(i-1), C(i-1), N(i)`  with `N-CA`, `∠C-N-CA(i)`,  `ω(i-1)`
//! - `C(i)`  from `C(i-1), N(i), CA(i)`    with `CA-C`, `∠N-CA-C(i)`,  `φ(i)`
//!
//! Residue 0 is the bootstrap frame of [`BackboneGeometry`]; its angles are not read.
//!
//! Predicted bond angles are unconstrained, so a bond angle of `0` or `π` makes three atoms
//! collinear and the next frame normal undefined. Normalisation is `v / sqrt(|v|² + ε)`, so such
//! frames degrade to an arbitrary but finite placement instead of NaN.

use crate::codec::NUM_ANGLES;
use crate::geometry::{add, cross, normalize, scale, sub, BackboneGeometry, Vec3};
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Place one atom from its three predecessors.
#[inline]
pub fn place_atom(a: Vec3, b: Vec3, c: Vec3, bond: f32, angle: f32, torsion: f32) -> Vec3 {
    let (sin_a, cos_a) = angle.sin_cos();
    let (sin_t, cos_t) = torsion.sin_cos();
    let d2 = [-bond * cos_a, bond * sin_a * cos_t, bond * sin_a * sin_t];

    let bc = normalize(sub(c, b));
    let n = normalize(cross(sub(b, a), bc));
    let m1 = cross(n, bc);

    let offset = add(add(scale(bc, d2[0]), scale(m1, d2[1])), scale(n, d2[2]));
    add(c, offset)
}

/// Reconstruct `(3 * len, 3)` backbone coordinates (N, CA, C per residue) from `(len, 11)`
/// decoded angles.
///
/// An empty sequence yields an empty `(0, 3)` array.
pub fn build_backbone(angles: &ArrayView2<f32>, geom: &BackboneGeometry) -> Result<Array2<f32>> {
    if angles.ncols() != NUM_ANGLES {
        return Err(Error::Shape("decoded angles must have 11 columns"));
    }
    geom.validate()?;

    let len = angles.nrows();
    let mut atoms: Vec<Vec3> = Vec::with_capacity(BackboneGeometry::atom_count(len));
    if len > 0 {
        atoms.extend_from_slice(&geom.bootstrap);
    }

    let lay = geom.layout;
    for i in 1..len {
        let k = atoms.len();
        let (n_prev, ca_prev, c_prev) = (atoms[k - 3], atoms[k - 2], atoms[k - 1]);

        let n = place_atom(
            n_prev,
            ca_prev,
            c_prev,
            geom.c_n,
            angles[[i - 1, lay.ca_c_n]],
            angles[[i - 1, lay.psi]],
        );
        let ca = place_atom(
            ca_prev,
            c_prev,
            n,
            geom.n_ca,
            angles[[i, lay.c_n_ca]],
            angles[[i - 1, lay.omega]],
        );
        let c = place_atom(
            c_prev,
            n,
            ca,
            geom.ca_c,
            angles[[i, lay.n_ca_c]],
            angles[[i, lay.phi]],
        );
        atoms.push(n);
        atoms.push(ca);
        atoms.push(c);
    }

    let mut out = Array2::<f32>::zeros((atoms.len(), 3));
    for (i, p) in atoms.iter().enumerate() {
        for k in 0..3 {
            out[[i, k]] = p[k];
        }
    }
    Ok(out)
}
