//! Backbone geometry constants and 3-vector helpers.
//!
//! Everything the builder treats as fixed lives in [`BackboneGeometry`]: bond lengths, the
//! bootstrap frame for the first residue, and which decoded channel feeds which placement.

use crate::codec::NUM_ANGLES;
use crate::{Error, Result};

pub type Vec3 = [f32; 3];

/// Added to squared norms before `sqrt` so collinear frames and coincident atoms stay finite.
pub const NORM_EPS: f32 = 1e-8;

/// Backbone atoms placed per residue, in placement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneAtom {
    N,
    CA,
    C,
}

impl BackboneAtom {
    pub const TEMPLATE: [BackboneAtom; 3] = [BackboneAtom::N, BackboneAtom::CA, BackboneAtom::C];

    pub fn name(self) -> &'static str {
        match self {
            BackboneAtom::N => "N",
            BackboneAtom::CA => "CA",
            BackboneAtom::C => "C",
        }
    }
}

/// Atoms per residue.
pub const ATOMS_PER_RESIDUE: usize = BackboneAtom::TEMPLATE.len();

/// Decoded channel indices of the angles the builder reads.
///
/// Channels not named here (χ1…χ5 by default) are decoded and masked but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AngleLayout {
    /// φ(i): torsion C(i-1)-N(i)-CA(i)-C(i); places C(i).
    pub phi: usize,
    /// ψ(i): torsion N(i)-CA(i)-C(i)-N(i+1); places N(i+1).
    pub psi: usize,
    /// ω(i): torsion CA(i)-C(i)-N(i+1)-CA(i+1); places CA(i+1).
    pub omega: usize,
    /// Bond angle N(i)-CA(i)-C(i); places C(i).
    pub n_ca_c: usize,
    /// Bond angle CA(i)-C(i)-N(i+1); places N(i+1).
    pub ca_c_n: usize,
    /// Bond angle C(i-1)-N(i)-CA(i); places CA(i).
    pub c_n_ca: usize,
}

impl Default for AngleLayout {
    fn default() -> Self {
        Self {
            phi: 0,
            psi: 1,
            omega: 2,
            n_ca_c: 3,
            ca_c_n: 4,
            c_n_ca: 5,
        }
    }
}

impl AngleLayout {
    fn channels(&self) -> [usize; 6] {
        [
            self.phi,
            self.psi,
            self.omega,
            self.n_ca_c,
            self.ca_c_n,
            self.c_n_ca,
        ]
    }
}

/// Fixed geometry for NeRF reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneGeometry {
    /// N-CA bond length (Å).
    pub n_ca: f32,
    /// CA-C bond length (Å).
    pub ca_c: f32,
    /// C-N peptide bond length (Å).
    pub c_n: f32,
    /// N, CA, C of the first residue. No earlier atoms exist to place them from.
    pub bootstrap: [Vec3; 3],
    pub layout: AngleLayout,
}

impl Default for BackboneGeometry {
    fn default() -> Self {
        let n_ca = 1.458f32;
        let ca_c = 1.525f32;
        let c_n = 1.329f32;
        // N at the origin, CA on +x, C in the xy-plane with an ideal N-CA-C angle.
        let theta = 111.2f32.to_radians();
        let bootstrap = [
            [0.0, 0.0, 0.0],
            [n_ca, 0.0, 0.0],
            [n_ca - ca_c * theta.cos(), ca_c * theta.sin(), 0.0],
        ];
        Self {
            n_ca,
            ca_c,
            c_n,
            bootstrap,
            layout: AngleLayout::default(),
        }
    }
}

impl BackboneGeometry {
    pub fn validate(&self) -> Result<()> {
        for r in [self.n_ca, self.ca_c, self.c_n] {
            if !r.is_finite() || r <= 0.0 {
                return Err(Error::Domain("bond lengths must be positive and finite"));
            }
        }
        if self.bootstrap.iter().flatten().any(|x| !x.is_finite()) {
            return Err(Error::Domain("bootstrap frame must be finite"));
        }
        if self.layout.channels().iter().any(|&c| c >= NUM_ANGLES) {
            return Err(Error::Domain("angle layout channel out of range"));
        }
        Ok(())
    }

    /// Atom count for `residues` residues.
    pub fn atom_count(residues: usize) -> usize {
        residues * ATOMS_PER_RESIDUE
    }
}

#[inline]
pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn scale(a: Vec3, s: f32) -> Vec3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

#[inline]
pub fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn norm(a: Vec3) -> f32 {
    dot(a, a).sqrt()
}

/// `a / sqrt(|a|² + NORM_EPS)`. Never divides by zero.
#[inline]
pub fn normalize(a: Vec3) -> Vec3 {
    scale(a, 1.0 / (dot(a, a) + NORM_EPS).sqrt())
}

/// Bond angle at `b` in the triple `a-b-c` (radians, `[0, π]`).
pub fn bond_angle(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let u = sub(a, b);
    let v = sub(c, b);
    let cos = dot(u, v) / (norm(u) * norm(v));
    cos.clamp(-1.0, 1.0).acos()
}

/// Torsion of the quadruple `a-b-c-d` about `b-c` (radians, `(-π, π]`).
pub fn torsion(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> f32 {
    let b0 = sub(a, b);
    let b1 = sub(c, b);
    let b2 = sub(d, c);
    let b1n = scale(b1, 1.0 / norm(b1));
    let v = sub(b0, scale(b1n, dot(b0, b1n)));
    let w = sub(b2, scale(b1n, dot(b2, b1n)));
    let x = dot(v, w);
    let y = dot(cross(b1n, v), w);
    y.atan2(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bootstrap_has_ideal_geometry() {
        let g = BackboneGeometry::default();
        g.validate().unwrap();
        let [n, ca, c] = g.bootstrap;
        assert!((norm(sub(ca, n)) - g.n_ca).abs() < 1e-5);
        assert!((norm(sub(c, ca)) - g.ca_c).abs() < 1e-5);
        let theta = bond_angle(n, ca, c);
        assert!((theta - 111.2f32.to_radians()).abs() < 1e-4);
    }

    #[test]
    fn torsion_flips_sign_under_reflection() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        let d_pos = [0.0, 1.0, 1.0];
        let d_neg = [0.0, 1.0, -1.0];
        let pos = torsion(a, b, c, d_pos);
        let neg = torsion(a, b, c, d_neg);
        assert!((pos.abs() - core::f32::consts::FRAC_PI_2).abs() < 1e-5);
        assert!((pos + neg).abs() < 1e-5);
    }

    #[test]
    fn normalize_of_zero_is_finite() {
        let z = normalize([0.0, 0.0, 0.0]);
        assert!(z.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn bad_layout_is_rejected() {
        let mut g = BackboneGeometry::default();
        g.layout.phi = NUM_ANGLES;
        assert!(g.validate().is_err());
    }
}
