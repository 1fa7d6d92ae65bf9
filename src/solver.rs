//! Solution of the kernel spline system.
//!
//! `L` is inverted once and cached by the transform; the weights `W = L^-1 Y` are
//! then split into the per-landmark spline coefficients and the affine component.
//!
//! The kernel block of `L` grows with the landmark spread (like `r^3` for the
//! volume and elastic-body kernels) while the translation block of `P` stays at 1,
//! so `L` is first equilibrated: a symmetric diagonal scaling `S L S` that brings
//! every row maximum close to 1. The scaled matrix is inverted and the scaling is
//! undone, `L^-1 = S (S L S)^-1 S`.
//!
//! Inversion first tries an LU decomposition, accepted when its backward error
//! `max|L_s L_s^-1 - I|` is small and the scaled system is not numerically
//! singular. Otherwise (coincident landmarks, collinear landmarks, too few
//! landmarks for the affine part) the SVD pseudo-inverse of the scaled matrix is
//! used, with singular values at or below [`SINGULAR_VALUE_TOLERANCE`] times the
//! largest one treated as zero.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, SMatrix, SVector};

use crate::config::InversionMethod;
use crate::error::{Result, SplineError};

/// Relative cutoff of the SVD pseudo-inverse: singular values `s <= 1e-8 * s_max`
/// are excluded from the inverse. Fixed so that fitted transforms are reproducible.
pub const SINGULAR_VALUE_TOLERANCE: f64 = 1e-8;

/// Largest accepted `max|L_s L_s^-1 - I|` of an LU inverse of the scaled system.
const LU_BACKWARD_ERROR: f64 = 1e-6;

/// LU inverses of the scaled system with `max|L_s| * max|L_s^-1|` above this are
/// treated as singular.
const MAX_SCALED_CONDITION: f64 = 1e12;

const EQUILIBRATION_SWEEPS: usize = 32;

/// Row maxima within this factor of 1 end the equilibration.
const EQUILIBRATION_SLACK: f64 = 2.0;

/// How the inverse of `L` was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factorization {
    Lu,
    PseudoInverse,
}

/// The inverse of the system matrix and the path that produced it.
#[derive(Debug, Clone)]
pub struct SystemInverse {
    pub inverse: DMatrix<f64>,
    pub factorization: Factorization,
}

/// Inverts the system matrix `L`.
pub fn compute_l_inverse(l: &DMatrix<f64>, method: InversionMethod) -> Result<SystemInverse> {
    let scale = equilibration(l);
    let scaled = scale_symmetric(l, &scale);

    let lu = match method {
        InversionMethod::Auto => lu_inverse(&scaled),
        InversionMethod::Svd => None,
    };

    let (inverse, factorization) = match lu {
        Some(inverse) => {
            debug!("Inverted {}x{} spline system with LU", l.nrows(), l.ncols());
            (inverse, Factorization::Lu)
        }
        None => {
            if method == InversionMethod::Auto {
                warn!(
                    "Spline system ({}x{}) is singular or ill-conditioned, using SVD pseudo-inverse",
                    l.nrows(),
                    l.ncols()
                );
            }
            (pseudo_inverse(&scaled)?, Factorization::PseudoInverse)
        }
    };

    Ok(SystemInverse {
        inverse: scale_symmetric(&inverse, &scale),
        factorization,
    })
}

/// Diagonal scales `s` such that every row of `S L S` has a maximum close to 1.
///
/// Repeatedly divides row and column `i` by the square root of the current row
/// maximum. All-zero rows keep a scale of 1.
fn equilibration(l: &DMatrix<f64>) -> DVector<f64> {
    let n = l.nrows();
    let mut scale = DVector::from_element(n, 1.0);
    let mut scaled = l.clone();

    for _ in 0..EQUILIBRATION_SWEEPS {
        let step = DVector::from_iterator(
            n,
            scaled.row_iter().map(|row| {
                let max = row.amax();
                if max > 0.0 {
                    1.0 / max.sqrt()
                } else {
                    1.0
                }
            }),
        );
        if step
            .iter()
            .all(|&s| (1.0 / EQUILIBRATION_SLACK..=EQUILIBRATION_SLACK).contains(&(s * s)))
        {
            break;
        }
        scaled = scale_symmetric(&scaled, &step);
        scale.component_mul_assign(&step);
    }
    scale
}

/// `S M S` for `S = diag(scale)`.
fn scale_symmetric(m: &DMatrix<f64>, scale: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| scale[i] * m[(i, j)] * scale[j])
}

fn lu_inverse(l: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inverse = l.clone().lu().try_inverse()?;
    if !inverse.iter().all(|v| v.is_finite()) {
        return None;
    }
    if l.amax() * inverse.amax() > MAX_SCALED_CONDITION {
        return None;
    }
    let backward_error = (l * &inverse - DMatrix::identity(l.nrows(), l.ncols())).amax();
    if backward_error > LU_BACKWARD_ERROR {
        debug!("Rejected LU inverse with backward error {:e}", backward_error);
        return None;
    }
    Some(inverse)
}

/// SVD pseudo-inverse with the relative cutoff [`SINGULAR_VALUE_TOLERANCE`].
pub fn pseudo_inverse(l: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if l.is_empty() {
        return Ok(DMatrix::zeros(l.ncols(), l.nrows()));
    }
    let svd = l.clone().svd(true, true);
    let cutoff = svd.singular_values.max() * SINGULAR_VALUE_TOLERANCE;

    let discarded = svd.singular_values.iter().filter(|&&s| s <= cutoff).count();
    if discarded > 0 {
        debug!(
            "Discarded {} of {} singular values (cutoff {:e})",
            discarded,
            svd.singular_values.len(),
            cutoff
        );
    }

    svd.pseudo_inverse(cutoff)
        .map_err(|e| SplineError::Solver(e.to_string()))
}

/// Solves `W = L^-1 Y`.
pub fn compute_w(l_inverse: &DMatrix<f64>, y: &DVector<f64>) -> DVector<f64> {
    l_inverse * y
}

/// The solved spline: one coefficient vector per landmark plus the affine part.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineWeights<const D: usize> {
    /// Coefficients multiplying the kernel response of each source landmark.
    pub deformation: Vec<SVector<f64, D>>,
    /// Linear part of the affine component, identity included.
    pub affine: SMatrix<f64, D, D>,
    /// Translational part of the affine component.
    pub translation: SVector<f64, D>,
}

impl<const D: usize> SplineWeights<D> {
    /// The weights of a transform without landmarks: `A = I`, `b = 0`.
    pub fn identity() -> Self {
        SplineWeights {
            deformation: Vec::new(),
            affine: SMatrix::<f64, D, D>::identity(),
            translation: SVector::<f64, D>::zeros(),
        }
    }
}

/// Splits the solution vector `W` of `n` landmarks into its components.
///
/// The first `n D` entries are the spline coefficients, landmark-major. The next
/// `D^2` entries are the linear part, stored column by column; since `Y` holds
/// displacements rather than positions, the identity is added to it. The last `D`
/// entries are the translation.
pub fn reorganize_w<const D: usize>(w: &DVector<f64>, n: usize) -> SplineWeights<D> {
    let deformation = (0..n)
        .map(|i| w.fixed_rows::<D>(i * D).into_owned())
        .collect();

    let offset = n * D;
    let mut affine = SMatrix::<f64, D, D>::from_fn(|row, col| w[offset + col * D + row]);
    affine += SMatrix::<f64, D, D>::identity();

    let translation = w.fixed_rows::<D>(offset + D * D).into_owned();

    SplineWeights {
        deformation,
        affine,
        translation,
    }
}
