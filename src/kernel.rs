//! Spline kernels.
//!
//! The kernel decides how strongly a landmark influences the space around it. The
//! transform only needs a `D x D` response for a displacement vector, so every
//! spline family is a [`SplineKernel`] implementation and the rest of the crate is
//! agnostic of its mathematical form.
//!
//! Families shipped with the crate (`r` is the norm of the displacement `x`):
//! - [`ThinPlate`]: `G(x) = r I`
//! - [`ThinPlateR2LogR`]: `G(x) = r^2 ln(r) I`
//! - [`VolumeSpline`]: `G(x) = r^3 I`
//! - [`ElasticBody`]: `G(x) = alpha r^3 I - 3 r x x^T`
//! - [`ElasticBodyReciprocal`]: `G(x) = alpha r I - x x^T / r`
//!
//! The elastic-body families follow Davis et al., "Elastic body splines: a physics
//! based approach to coordinate transformation in medical image matching" (1997).

use nalgebra::{SMatrix, SVector};

use crate::config::KernelKind;

/// Distances below this are treated as zero by kernels that are singular at the origin.
const ZERO_DISTANCE: f64 = 1e-8;

/// Relative step of the central difference used by [`SplineKernel::influence_derivative`].
const DERIVATIVE_STEP: f64 = 1e-6;

/// The capability a spline family provides to the transform.
///
/// Implementations must be deterministic, and must return finite values for every
/// displacement they are evaluated on. Kernels that are singular at a zero
/// displacement are never asked for it while assembling the system, since the
/// diagonal blocks use [`SplineKernel::reflexive_influence`] instead; a query
/// point that coincides with a landmark does evaluate it, so such kernels should
/// return a finite limit there.
pub trait SplineKernel<const D: usize>: Send + Sync {
    /// The influence of a landmark on a point displaced by `displacement` from it.
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D>;

    /// The block-diagonal entry of the kernel matrix for landmark `landmark`.
    ///
    /// Defaults to `stiffness * I`, which turns the interpolating spline into an
    /// approximating one for a positive stiffness.
    fn reflexive_influence(&self, _landmark: usize, stiffness: f64) -> SMatrix<f64, D, D> {
        SMatrix::<f64, D, D>::identity() * stiffness
    }

    /// Partial derivative of [`SplineKernel::influence`] along `axis`.
    fn influence_derivative(&self, displacement: &SVector<f64, D>, axis: usize) -> SMatrix<f64, D, D> {
        central_difference(self, displacement, axis)
    }
}

pub(crate) fn central_difference<K, const D: usize>(
    kernel: &K,
    displacement: &SVector<f64, D>,
    axis: usize,
) -> SMatrix<f64, D, D>
where
    K: SplineKernel<D> + ?Sized,
{
    let step = DERIVATIVE_STEP * displacement.norm().max(1.0);
    let mut forward = *displacement;
    let mut backward = *displacement;
    forward[axis] += step;
    backward[axis] -= step;
    (kernel.influence(&forward) - kernel.influence(&backward)) / (2.0 * step)
}

// For G(x) = phi(r) I the derivative along axis a is phi'(r) x_a / r I.
fn radial_derivative<const D: usize>(
    displacement: &SVector<f64, D>,
    axis: usize,
    phi_prime_over_r: f64,
) -> SMatrix<f64, D, D> {
    SMatrix::<f64, D, D>::identity() * (phi_prime_over_r * displacement[axis])
}

/// Thin-plate spline kernel, `G(x) = r I`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThinPlate;

impl<const D: usize> SplineKernel<D> for ThinPlate {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        SMatrix::<f64, D, D>::identity() * displacement.norm()
    }

    fn influence_derivative(&self, displacement: &SVector<f64, D>, axis: usize) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        if r < ZERO_DISTANCE {
            // The cone has no derivative at its apex; use the symmetric limit.
            return SMatrix::<f64, D, D>::zeros();
        }
        radial_derivative(displacement, axis, 1.0 / r)
    }
}

/// Thin-plate spline kernel, `G(x) = r^2 ln(r) I`.
///
/// This is the classical two-dimensional thin-plate fundamental solution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThinPlateR2LogR;

impl<const D: usize> SplineKernel<D> for ThinPlateR2LogR {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        let value = if r < ZERO_DISTANCE { 0.0 } else { r * r * r.ln() };
        SMatrix::<f64, D, D>::identity() * value
    }

    fn influence_derivative(&self, displacement: &SVector<f64, D>, axis: usize) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        if r < ZERO_DISTANCE {
            return SMatrix::<f64, D, D>::zeros();
        }
        // phi'(r) = 2 r ln(r) + r
        radial_derivative(displacement, axis, 2.0 * r.ln() + 1.0)
    }
}

/// Volume spline kernel, `G(x) = r^3 I`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeSpline;

impl<const D: usize> SplineKernel<D> for VolumeSpline {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        SMatrix::<f64, D, D>::identity() * (r * r * r)
    }

    fn influence_derivative(&self, displacement: &SVector<f64, D>, axis: usize) -> SMatrix<f64, D, D> {
        // phi'(r) = 3 r^2
        radial_derivative(displacement, axis, 3.0 * displacement.norm())
    }
}

/// Elastic body spline kernel, `G(x) = alpha r^3 I - 3 r x x^T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticBody {
    poisson_ratio: f64,
}

impl ElasticBody {
    pub fn new(poisson_ratio: f64) -> Self {
        ElasticBody { poisson_ratio }
    }

    pub fn poisson_ratio(&self) -> f64 {
        self.poisson_ratio
    }

    /// `alpha = 12 (1 - nu) - 1` for Poisson ratio `nu`.
    pub fn alpha(&self) -> f64 {
        12.0 * (1.0 - self.poisson_ratio) - 1.0
    }
}

impl<const D: usize> SplineKernel<D> for ElasticBody {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        let outer = displacement * displacement.transpose();
        SMatrix::<f64, D, D>::identity() * (self.alpha() * r * r * r) - outer * (3.0 * r)
    }
}

/// Elastic body reciprocal spline kernel, `G(x) = alpha r I - x x^T / r`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticBodyReciprocal {
    poisson_ratio: f64,
}

impl ElasticBodyReciprocal {
    pub fn new(poisson_ratio: f64) -> Self {
        ElasticBodyReciprocal { poisson_ratio }
    }

    pub fn poisson_ratio(&self) -> f64 {
        self.poisson_ratio
    }

    /// `alpha = 8 (1 - nu) - 1` for Poisson ratio `nu`.
    pub fn alpha(&self) -> f64 {
        8.0 * (1.0 - self.poisson_ratio) - 1.0
    }
}

impl<const D: usize> SplineKernel<D> for ElasticBodyReciprocal {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        let r = displacement.norm();
        let factor = if r > ZERO_DISTANCE { -1.0 / r } else { 0.0 };
        let outer = displacement * displacement.transpose();
        SMatrix::<f64, D, D>::identity() * (self.alpha() * r) + outer * factor
    }
}

/// A kernel family chosen at construction time from a [`KernelKind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelFamily {
    ThinPlate(ThinPlate),
    ThinPlateR2LogR(ThinPlateR2LogR),
    Volume(VolumeSpline),
    ElasticBody(ElasticBody),
    ElasticBodyReciprocal(ElasticBodyReciprocal),
}

impl KernelFamily {
    /// Builds the kernel for `kind`. `poisson_ratio` is only used by the
    /// elastic-body families.
    pub fn new(kind: KernelKind, poisson_ratio: f64) -> Self {
        match kind {
            KernelKind::ThinPlate => KernelFamily::ThinPlate(ThinPlate),
            KernelKind::ThinPlateR2LogR => KernelFamily::ThinPlateR2LogR(ThinPlateR2LogR),
            KernelKind::Volume => KernelFamily::Volume(VolumeSpline),
            KernelKind::ElasticBody => KernelFamily::ElasticBody(ElasticBody::new(poisson_ratio)),
            KernelKind::ElasticBodyReciprocal => {
                KernelFamily::ElasticBodyReciprocal(ElasticBodyReciprocal::new(poisson_ratio))
            }
        }
    }

    /// The Poisson ratio of the elastic-body families, `None` for the others.
    pub fn poisson_ratio(&self) -> Option<f64> {
        match self {
            KernelFamily::ElasticBody(k) => Some(k.poisson_ratio()),
            KernelFamily::ElasticBodyReciprocal(k) => Some(k.poisson_ratio()),
            _ => None,
        }
    }

    pub fn kind(&self) -> KernelKind {
        match self {
            KernelFamily::ThinPlate(_) => KernelKind::ThinPlate,
            KernelFamily::ThinPlateR2LogR(_) => KernelKind::ThinPlateR2LogR,
            KernelFamily::Volume(_) => KernelKind::Volume,
            KernelFamily::ElasticBody(_) => KernelKind::ElasticBody,
            KernelFamily::ElasticBodyReciprocal(_) => KernelKind::ElasticBodyReciprocal,
        }
    }
}

impl<const D: usize> SplineKernel<D> for KernelFamily {
    fn influence(&self, displacement: &SVector<f64, D>) -> SMatrix<f64, D, D> {
        match self {
            KernelFamily::ThinPlate(k) => k.influence(displacement),
            KernelFamily::ThinPlateR2LogR(k) => k.influence(displacement),
            KernelFamily::Volume(k) => k.influence(displacement),
            KernelFamily::ElasticBody(k) => k.influence(displacement),
            KernelFamily::ElasticBodyReciprocal(k) => k.influence(displacement),
        }
    }

    fn reflexive_influence(&self, landmark: usize, stiffness: f64) -> SMatrix<f64, D, D> {
        match self {
            KernelFamily::ThinPlate(k) => k.reflexive_influence(landmark, stiffness),
            KernelFamily::ThinPlateR2LogR(k) => k.reflexive_influence(landmark, stiffness),
            KernelFamily::Volume(k) => k.reflexive_influence(landmark, stiffness),
            KernelFamily::ElasticBody(k) => k.reflexive_influence(landmark, stiffness),
            KernelFamily::ElasticBodyReciprocal(k) => k.reflexive_influence(landmark, stiffness),
        }
    }

    fn influence_derivative(&self, displacement: &SVector<f64, D>, axis: usize) -> SMatrix<f64, D, D> {
        match self {
            KernelFamily::ThinPlate(k) => k.influence_derivative(displacement, axis),
            KernelFamily::ThinPlateR2LogR(k) => k.influence_derivative(displacement, axis),
            KernelFamily::Volume(k) => k.influence_derivative(displacement, axis),
            KernelFamily::ElasticBody(k) => k.influence_derivative(displacement, axis),
            KernelFamily::ElasticBodyReciprocal(k) => k.influence_derivative(displacement, axis),
        }
    }
}
