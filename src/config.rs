//! Loss-pipeline configuration.
//!
//! The core has no ambient device or thread state: everything it needs arrives in a
//! [`LossConfig`] (ndarray path) or as an explicit device argument (burn path).

use crate::geometry::BackboneGeometry;
use crate::{Error, Result};
use core::fmt;
use core::str::FromStr;

/// Where tensors are allocated.
///
/// Only affects placement; results are the same up to floating-point differences between
/// backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    Accelerated,
}

impl ExecutionTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionTarget::Cpu => "cpu-execution",
            ExecutionTarget::Accelerated => "accelerated-execution",
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "cpu-execution" => Ok(ExecutionTarget::Cpu),
            "accelerated" | "accelerated-execution" | "gpu" => Ok(ExecutionTarget::Accelerated),
            _ => Err(Error::Domain(
                "unknown execution target (expected cpu-execution or accelerated-execution)",
            )),
        }
    }
}

/// How the ndarray aggregator maps over examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// One example after another on the calling thread.
    Sequential,
    /// One rayon task per example on the global pool.
    #[default]
    Rayon,
}

/// Configuration for [`crate::loss`].
#[derive(Debug, Clone, Default)]
pub struct LossConfig {
    pub geometry: BackboneGeometry,
    pub parallelism: Parallelism,
    /// Must be [`ExecutionTarget::Cpu`]; accelerated runs go through `burn_structure`.
    pub target: ExecutionTarget,
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target != ExecutionTarget::Cpu {
            return Err(Error::Domain(
                "the ndarray loss runs on the CPU; use burn_structure for accelerated-execution",
            ));
        }
        self.geometry.validate()
    }
}
