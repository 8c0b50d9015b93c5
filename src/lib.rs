//! # foldloss
//!
//! Structural losses for protein backbone prediction from angle sequences.
//!
//! A model that predicts per-residue angles is usually trained against those angles directly.
//! This crate instead scores the **structure** the angles imply:
//!
//! - decode `(cos, sin)` pairs into angles with `atan2` ([`codec`]),
//! - zero out padded residues in both prediction and reference ([`mask`]),
//! - rebuild backbone coordinates (N, Cα, C) with NeRF forward kinematics ([`nerf`]),
//! - compare the two structures with distance RMSD ([`drmsd`]), which needs no superposition,
//! - reduce per-example losses to a batch mean ([`loss`]).
//!
//! ## Public invariants (must not change)
//!
//! - **Shapes are checked, values are not**: mismatched prediction/reference shapes are an
//!   `Error::Shape`; non-finite values propagate and are the caller's to detect.
//! - **Padding never contributes**: an example padded with zero residues scores the same as the
//!   unpadded example, whatever the prediction holds at padded positions.
//! - **Deterministic reductions**: the batch mean does not depend on thread scheduling.
//! - **No hidden device state**: burn entry points take the device they run on.
//! - **Backend-agnostic by default**: the default API is `ndarray` + `f32`; the differentiable
//!   path (`burn_structure`, `burn_train`) sits behind the `burn` feature (on by default).
//!
//! ## Angle layout
//!
//! Each residue carries 11 angles encoded as 22 numbers `(cos θ₀, sin θ₀, …, cos θ₁₀, sin θ₁₀)`:
//! φ, ψ, ω, the three backbone bond angles N–Cα–C, Cα–C–N, C–N–Cα, then χ1…χ5. The side-chain
//! torsions are carried through decoding and masking but do not move backbone atoms.
//! See [`geometry::AngleLayout`].
//!
//! ## References
//!
//! - Parsons et al., *Practical conversion from torsion space to Cartesian space for in silico
//!   protein synthesis* (J. Comput. Chem. 2005): the NeRF placement used by [`nerf`].
//! - AlQuraishi, *End-to-End Differentiable Learning of Protein Structure* (Cell Systems 2019):
//!   dRMSD as a training loss over reconstructed backbones.
//!
//! ## Module map
//!
//! - `codec`: `atan2` decoding, encoding, `wrap_pi`
//! - `mask`: per-residue validity masks (content-derived or explicit lengths)
//! - `geometry`: bond lengths, bootstrap frame, angle layout, small 3-vector helpers
//! - `nerf`: backbone reconstruction
//! - `drmsd`: pairwise distances and distance RMSD
//! - `loss`: batch aggregation (rayon per-example map) and angle MSE
//! - `config`: execution target and loss configuration
//! - `synthetic`: seeded padded batches for tests, benches and demos
//! - `burn_structure` (feature `burn`): the same pipeline on burn tensors, differentiable
//! - `burn_train` (feature `burn`): epoch driver with Noam-scheduled Adam, early stopping,
//!   checkpoint policy and CSV logs

pub mod codec;
pub mod config;
pub mod drmsd;
pub mod geometry;
pub mod loss;
pub mod mask;
pub mod nerf;
pub mod synthetic;

#[cfg(feature = "burn")]
pub mod burn_structure;

#[cfg(feature = "burn")]
pub mod burn_train;

/// foldloss error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("non-finite loss at epoch {epoch}, batch {batch}")]
    NonFinite { epoch: usize, batch: usize },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
