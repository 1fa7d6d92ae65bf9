//! Configuration of a kernel spline transform.
//!
//! A [`SplineConfig`] selects the kernel family and the numerical options of the
//! fit. It is serde-(de)serialisable so it can travel with a persisted transform
//! (see [`crate::record`]); every field has a default, so partial documents are
//! accepted.

use serde::{Deserialize, Serialize};

/// The spline family used as kernel of the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// `G(x) = r I`
    #[default]
    ThinPlate,
    /// `G(x) = r^2 ln(r) I`
    ThinPlateR2LogR,
    /// `G(x) = r^3 I`
    Volume,
    /// `G(x) = alpha r^3 I - 3 r x x^T`
    ElasticBody,
    /// `G(x) = alpha r I - x x^T / r`
    ElasticBodyReciprocal,
}

/// Which landmark set supplies the displacements used to assemble the kernel matrix.
///
/// Evaluation always measures the query point against the source landmarks, so
/// only [`KernelSpace::Source`] guarantees that the fitted spline interpolates the
/// landmarks. [`KernelSpace::Target`] defines the kernel in the deformed space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelSpace {
    #[default]
    Source,
    Target,
}

/// How the system matrix `L` is inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InversionMethod {
    /// LU inversion, falling back to the SVD pseudo-inverse when `L` is
    /// singular or badly conditioned.
    #[default]
    Auto,
    /// Always use the SVD pseudo-inverse.
    Svd,
}

/// Configuration for a kernel spline transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplineConfig {
    pub kernel: KernelKind,
    /// Zero interpolates the landmarks, larger values approximate them.
    /// Typical values lie between 0.001 and 0.1.
    pub stiffness: f64,
    /// Poisson ratio of the elastic-body kernels. Ignored by the other families.
    pub poisson_ratio: f64,
    pub kernel_space: KernelSpace,
    pub inversion: InversionMethod,
}

impl Default for SplineConfig {
    fn default() -> Self {
        SplineConfig {
            kernel: KernelKind::ThinPlate,
            stiffness: 0.0,
            poisson_ratio: 0.3,
            kernel_space: KernelSpace::Source,
            inversion: InversionMethod::Auto,
        }
    }
}
