//! Error types for the kernel spline transform.

use thiserror::Error;

/// Failures reported by landmark configuration and evaluation.
///
/// Numerical singularity of the spline system is not an error: it is absorbed
/// by the SVD pseudo-inverse fallback in [`crate::solver`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    // Field names avoid `source`, which thiserror reserves for the error cause.
    #[error("Source and target landmark counts differ ({sources} source, {targets} target)")]
    LandmarkCountMismatch { sources: usize, targets: usize },

    #[error("Parameter vector has length {actual}, expected {expected}")]
    ParameterLength { expected: usize, actual: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Solver error: {0}")]
    Solver(String),
}

pub type Result<T> = std::result::Result<T, SplineError>;
