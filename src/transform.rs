//! The kernel spline transform.
//!
//! [`KernelTransform`] owns the landmarks, the kernel and every derived matrix. The
//! derived state is cached in three independent cells:
//!
//! 1. the assembled system (`K`, `P`, `L`),
//! 2. the inverse of `L`,
//! 3. the solved weights (spline coefficients and affine part).
//!
//! Every mutator takes `&mut self` and drops the caches it invalidates. Evaluation
//! takes `&self` and fills the caches on demand, so a transform can be configured
//! by one owner and then shared across threads for evaluation.

use log::debug;
use nalgebra::{DMatrix, Point, SMatrix, SVector};
use ndarray::{Array2, ArrayView2};
use once_cell::sync::OnceCell;
use rayon::prelude::*;

use crate::config::{InversionMethod, KernelSpace, SplineConfig};
use crate::error::{Result, SplineError};
use crate::kernel::{KernelFamily, SplineKernel};
use crate::landmarks::{flatten, unflatten, LandmarkStore};
use crate::solver::{
    compute_l_inverse, compute_w, reorganize_w, Factorization, SplineWeights, SystemInverse,
};
use crate::system::{compute_y, LinearSystem};

/// How far the lazy computation of a transform has advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheState {
    /// Nothing is computed.
    Stale,
    /// `K`, `P` and `L` are assembled.
    Assembled,
    /// The inverse of `L` is available.
    Factored,
    /// The weights are solved, evaluation needs no further work.
    Solved,
}

/// A landmark-driven spline transform mapping source landmarks onto target landmarks.
///
/// The transform of a point `x` is
///
/// ```text
/// T(x) = A x + b + sum_i G(x - p_i) c_i
/// ```
///
/// with `p_i` the source landmarks, `G` the kernel, `c_i` the spline coefficients
/// and `(A, b)` the affine component.
#[derive(Debug, Clone)]
pub struct KernelTransform<K, const D: usize> {
    kernel: K,
    landmarks: LandmarkStore<D>,
    stiffness: f64,
    kernel_space: KernelSpace,
    inversion: InversionMethod,
    system: OnceCell<LinearSystem>,
    l_inverse: OnceCell<SystemInverse>,
    weights: OnceCell<SplineWeights<D>>,
}

impl<const D: usize> KernelTransform<KernelFamily, D> {
    /// Builds a transform with the kernel family and options of `config`.
    pub fn from_config(config: &SplineConfig) -> Self {
        let kernel = KernelFamily::new(config.kernel, config.poisson_ratio);
        let mut transform = KernelTransform::new(kernel);
        transform.set_stiffness(config.stiffness);
        transform.set_kernel_space(config.kernel_space);
        transform.set_inversion_method(config.inversion);
        transform
    }

    /// The configuration that reproduces this transform with [`KernelTransform::from_config`].
    pub fn config(&self) -> SplineConfig {
        let defaults = SplineConfig::default();
        SplineConfig {
            kernel: self.kernel.kind(),
            stiffness: self.stiffness,
            poisson_ratio: self.kernel.poisson_ratio().unwrap_or(defaults.poisson_ratio),
            kernel_space: self.kernel_space,
            inversion: self.inversion,
        }
    }
}

impl<K: SplineKernel<D>, const D: usize> KernelTransform<K, D> {
    /// Creates an identity transform (no landmarks) with the given kernel.
    pub fn new(kernel: K) -> Self {
        KernelTransform {
            kernel,
            landmarks: LandmarkStore::new(),
            stiffness: 0.0,
            kernel_space: KernelSpace::Source,
            inversion: InversionMethod::Auto,
            system: OnceCell::new(),
            l_inverse: OnceCell::new(),
            weights: OnceCell::new(),
        }
    }

    // --- Configuration ---

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Replaces the kernel, invalidating every derived matrix.
    pub fn set_kernel(&mut self, kernel: K) {
        self.kernel = kernel;
        self.invalidate();
    }

    pub fn stiffness(&self) -> f64 {
        self.stiffness
    }

    /// Sets the stiffness of the spline. Negative (and NaN) values are clamped to zero.
    ///
    /// A stiffness of zero interpolates the landmarks; a positive stiffness lets
    /// the spline approximate them, following Sprengel, Rohr and Stiehl,
    /// "Thin-Plate Spline Approximation for Image Registration" (1996).
    pub fn set_stiffness(&mut self, stiffness: f64) {
        self.stiffness = if stiffness > 0.0 { stiffness } else { 0.0 };
        self.invalidate();
    }

    pub fn kernel_space(&self) -> KernelSpace {
        self.kernel_space
    }

    pub fn set_kernel_space(&mut self, kernel_space: KernelSpace) {
        if self.kernel_space != kernel_space {
            self.kernel_space = kernel_space;
            self.invalidate();
        }
    }

    pub fn inversion_method(&self) -> InversionMethod {
        self.inversion
    }

    /// Changing the inversion method keeps the assembled system.
    pub fn set_inversion_method(&mut self, inversion: InversionMethod) {
        if self.inversion != inversion {
            self.inversion = inversion;
            self.l_inverse.take();
            self.weights.take();
        }
    }

    // --- Landmarks ---

    pub fn source_landmarks(&self) -> &[Point<f64, D>] {
        self.landmarks.source()
    }

    pub fn target_landmarks(&self) -> &[Point<f64, D>] {
        self.landmarks.target()
    }

    /// Replaces the source landmarks `p`.
    pub fn set_source_landmarks(&mut self, points: Vec<Point<f64, D>>) {
        if self.landmarks.set_source(points) {
            self.invalidate();
        }
    }

    /// Replaces the target landmarks `q`.
    pub fn set_target_landmarks(&mut self, points: Vec<Point<f64, D>>) {
        if self.landmarks.set_target(points) {
            self.invalidate();
        }
    }

    /// The displacements `q_i - p_i`.
    pub fn displacements(&self) -> Result<&[SVector<f64, D>]> {
        self.landmarks.displacements()
    }

    /// The number of landmark pairs; fails when source and target counts differ.
    pub fn number_of_landmarks(&self) -> Result<usize> {
        self.landmarks.pair_count()
    }

    pub fn cache_state(&self) -> CacheState {
        if self.weights.get().is_some() {
            CacheState::Solved
        } else if self.l_inverse.get().is_some() {
            CacheState::Factored
        } else if self.system.get().is_some() {
            CacheState::Assembled
        } else {
            CacheState::Stale
        }
    }

    fn invalidate(&mut self) {
        self.system.take();
        self.l_inverse.take();
        self.weights.take();
    }

    // --- Parameters ---

    /// `N * D`, the number of source landmark coordinates.
    pub fn number_of_parameters(&self) -> usize {
        self.landmarks.number_of_parameters()
    }

    /// The source landmarks, flattened landmark-major then axis-minor.
    pub fn parameters(&self) -> Vec<f64> {
        flatten(self.landmarks.source())
    }

    /// Replaces the source landmarks from a flat parameter vector.
    ///
    /// The length must be `N * D` where `N` is the current number of landmarks. A
    /// transform without landmarks accepts any multiple of `D`.
    pub fn set_parameters(&mut self, parameters: &[f64]) -> Result<()> {
        self.check_parameter_length(parameters.len())?;
        let points = unflatten(parameters)?;
        self.set_source_landmarks(points);
        Ok(())
    }

    /// The target landmarks, flattened like [`KernelTransform::parameters`].
    pub fn fixed_parameters(&self) -> Vec<f64> {
        flatten(self.landmarks.target())
    }

    /// Replaces the target landmarks from a flat vector with the same layout as
    /// [`KernelTransform::set_parameters`].
    pub fn set_fixed_parameters(&mut self, parameters: &[f64]) -> Result<()> {
        self.check_parameter_length(parameters.len())?;
        let points = unflatten(parameters)?;
        self.set_target_landmarks(points);
        Ok(())
    }

    /// Removes all landmarks; the transform becomes the identity.
    pub fn set_identity(&mut self) {
        if self.landmarks.clear() {
            self.invalidate();
        }
    }

    fn check_parameter_length(&self, len: usize) -> Result<()> {
        let source = self.landmarks.source().len();
        let target = self.landmarks.target().len();
        let landmarks = if source > 0 {
            source
        } else if target > 0 {
            target
        } else {
            len / D
        };
        let expected = landmarks * D;
        if len != expected {
            return Err(SplineError::ParameterLength {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    // --- Lazy computation ---

    /// The assembled `K`, `P` and `L` matrices.
    pub fn system(&self) -> Result<&LinearSystem> {
        self.landmarks.pair_count()?;
        Ok(self.system.get_or_init(|| {
            let kernel_landmarks = match self.kernel_space {
                KernelSpace::Source => self.landmarks.source(),
                KernelSpace::Target => self.landmarks.target(),
            };
            let system = LinearSystem::assemble(
                &self.kernel,
                kernel_landmarks,
                self.landmarks.source(),
                self.stiffness,
            );
            debug!(
                "Assembled {}x{} spline system for {} landmarks",
                system.l.nrows(),
                system.l.ncols(),
                self.landmarks.source().len()
            );
            system
        }))
    }

    pub fn k_matrix(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.system()?.k)
    }

    pub fn p_matrix(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.system()?.p)
    }

    pub fn l_matrix(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.system()?.l)
    }

    /// The (pseudo-)inverse of `L`.
    pub fn l_inverse(&self) -> Result<&DMatrix<f64>> {
        Ok(&self.solve_system()?.inverse)
    }

    /// Whether `L` was inverted by LU or by the SVD pseudo-inverse.
    pub fn factorization(&self) -> Result<Factorization> {
        Ok(self.solve_system()?.factorization)
    }

    fn solve_system(&self) -> Result<&SystemInverse> {
        self.l_inverse
            .get_or_try_init(|| compute_l_inverse(&self.system()?.l, self.inversion))
    }

    /// The solved spline weights. Without landmarks this is the identity.
    pub fn weights(&self) -> Result<&SplineWeights<D>> {
        self.weights.get_or_try_init(|| {
            let n = self.landmarks.pair_count()?;
            if n == 0 {
                return Ok(SplineWeights::identity());
            }
            let y = compute_y(self.landmarks.displacements()?);
            let w = compute_w(self.l_inverse()?, &y);
            Ok(reorganize_w(&w, n))
        })
    }

    /// Linear part `A` of the affine component (identity included).
    pub fn affine_matrix(&self) -> Result<SMatrix<f64, D, D>> {
        Ok(self.weights()?.affine)
    }

    /// Translational part `b` of the affine component.
    pub fn translation(&self) -> Result<SVector<f64, D>> {
        Ok(self.weights()?.translation)
    }

    /// The spline coefficient vector `c_i` of every landmark.
    pub fn deformation_coefficients(&self) -> Result<&[SVector<f64, D>]> {
        Ok(&self.weights()?.deformation)
    }

    // --- Evaluation ---

    /// Maps `point` through the transform.
    pub fn transform_point(&self, point: &Point<f64, D>) -> Result<Point<f64, D>> {
        let weights = self.weights()?;
        Ok(self.evaluate(weights, point))
    }

    /// Maps many points, in parallel.
    pub fn transform_points(&self, points: &[Point<f64, D>]) -> Result<Vec<Point<f64, D>>> {
        let weights = self.weights()?;
        Ok(points
            .par_iter()
            .map(|point| self.evaluate(weights, point))
            .collect())
    }

    /// Maps the rows of an `n x D` array of coordinates.
    pub fn transform_array(&self, points: ArrayView2<f64>) -> Result<Array2<f64>> {
        if points.ncols() != D {
            return Err(SplineError::DimensionMismatch {
                expected: D,
                actual: points.ncols(),
            });
        }
        let input: Vec<Point<f64, D>> = points
            .rows()
            .into_iter()
            .map(|row| Point::from(SVector::<f64, D>::from_fn(|axis, _| row[axis])))
            .collect();
        let output = self.transform_points(&input)?;
        Ok(Array2::from_shape_fn((output.len(), D), |(r, c)| output[r][c]))
    }

    /// The non-affine part of the transform, `sum_i G(x - p_i) c_i`.
    pub fn deformation_contribution(&self, point: &Point<f64, D>) -> Result<SVector<f64, D>> {
        let weights = self.weights()?;
        Ok(self.deformation_with(weights, point))
    }

    fn deformation_with(&self, weights: &SplineWeights<D>, point: &Point<f64, D>) -> SVector<f64, D> {
        self.landmarks
            .source()
            .iter()
            .zip(&weights.deformation)
            .fold(SVector::<f64, D>::zeros(), |acc, (landmark, coefficients)| {
                acc + self.kernel.influence(&(point - landmark)) * coefficients
            })
    }

    fn evaluate(&self, weights: &SplineWeights<D>, point: &Point<f64, D>) -> Point<f64, D> {
        let affine = weights.affine * point.coords + weights.translation;
        Point::from(affine + self.deformation_with(weights, point))
    }

    /// Derivative of the output with respect to the `N * D` parameters at `point`.
    ///
    /// Returns a `D x (N D)` matrix whose column block `i` is the kernel response
    /// `G(x - p_i)`, the same term that weighs `c_i` in
    /// [`KernelTransform::transform_point`]. Every parameter influences every
    /// point, see [`KernelTransform::nonzero_jacobian_indices`].
    pub fn jacobian(&self, point: &Point<f64, D>) -> Result<DMatrix<f64>> {
        let n = self.landmarks.pair_count()?;
        let mut jacobian = DMatrix::<f64>::zeros(D, n * D);
        for (i, landmark) in self.landmarks.source().iter().enumerate() {
            let g = self.kernel.influence(&(point - landmark));
            jacobian.fixed_view_mut::<D, D>(0, i * D).copy_from(&g);
        }
        Ok(jacobian)
    }

    /// Indices of the parameters with a nonzero Jacobian: all of them.
    pub fn nonzero_jacobian_indices(&self) -> Vec<usize> {
        (0..self.number_of_parameters()).collect()
    }

    /// Derivative of the output with respect to the input point, `dT/dx`.
    ///
    /// Entry `(o, a)` is the derivative of output coordinate `o` along input axis `a`.
    pub fn spatial_jacobian(&self, point: &Point<f64, D>) -> Result<SMatrix<f64, D, D>> {
        let weights = self.weights()?;
        let mut jacobian = weights.affine;
        for (landmark, coefficients) in self.landmarks.source().iter().zip(&weights.deformation) {
            let displacement = point - landmark;
            for axis in 0..D {
                let column = self.kernel.influence_derivative(&displacement, axis) * coefficients;
                for row in 0..D {
                    jacobian[(row, axis)] += column[row];
                }
            }
        }
        Ok(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelKind;
    use crate::kernel::ThinPlate;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    fn fitted() -> KernelTransform<ThinPlate, 2> {
        let mut transform = KernelTransform::new(ThinPlate);
        transform.set_source_landmarks(vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(1.0, 1.0),
        ]);
        transform.set_target_landmarks(vec![
            Point2::new(0.1, 0.0),
            Point2::new(1.0, 0.2),
            Point2::new(0.0, 1.0),
            Point2::new(1.3, 1.1),
        ]);
        transform
    }

    #[test]
    fn caches_advance_on_demand() {
        let transform = fitted();
        assert_eq!(transform.cache_state(), CacheState::Stale);

        transform.l_matrix().unwrap();
        assert_eq!(transform.cache_state(), CacheState::Assembled);

        transform.l_inverse().unwrap();
        assert_eq!(transform.cache_state(), CacheState::Factored);

        transform.transform_point(&Point2::new(0.5, 0.5)).unwrap();
        assert_eq!(transform.cache_state(), CacheState::Solved);
    }

    #[test]
    fn mutations_reset_caches() {
        let mut transform = fitted();
        transform.weights().unwrap();

        transform.set_stiffness(0.1);
        assert_eq!(transform.cache_state(), CacheState::Stale);

        transform.weights().unwrap();
        let target = transform.target_landmarks().to_vec();
        transform.set_target_landmarks(target);
        // Identical landmarks keep the solution.
        assert_eq!(transform.cache_state(), CacheState::Solved);

        transform.set_inversion_method(InversionMethod::Svd);
        assert_eq!(transform.cache_state(), CacheState::Assembled);

        transform.set_identity();
        assert_eq!(transform.cache_state(), CacheState::Stale);
    }

    #[test]
    fn factorization_follows_inversion_method() {
        let mut transform = fitted();
        assert_eq!(transform.factorization().unwrap(), Factorization::Lu);
        assert_eq!(transform.cache_state(), CacheState::Factored);

        let lu_output = transform.transform_point(&Point2::new(0.4, 0.9)).unwrap();
        transform.set_inversion_method(InversionMethod::Svd);
        assert_eq!(transform.factorization().unwrap(), Factorization::PseudoInverse);
        let svd_output = transform.transform_point(&Point2::new(0.4, 0.9)).unwrap();
        assert_relative_eq!(lu_output, svd_output, epsilon = 1e-10);
    }

    #[test]
    fn negative_stiffness_is_clamped() {
        let mut transform = fitted();
        transform.set_stiffness(-3.0);
        assert_eq!(transform.stiffness(), 0.0);
        transform.set_stiffness(f64::NAN);
        assert_eq!(transform.stiffness(), 0.0);
        transform.set_stiffness(0.05);
        assert_eq!(transform.stiffness(), 0.05);
    }

    #[test]
    fn mismatched_landmarks_fail_before_assembly() {
        let mut transform = fitted();
        transform.set_target_landmarks(vec![Point2::new(0.0, 0.0)]);

        let expected = SplineError::LandmarkCountMismatch {
            sources: 4,
            targets: 1,
        };
        assert_eq!(transform.transform_point(&Point2::origin()).unwrap_err(), expected);
        assert_eq!(transform.jacobian(&Point2::origin()).unwrap_err(), expected);
        assert_eq!(transform.cache_state(), CacheState::Stale);
    }

    #[test]
    fn parameter_length_is_checked() {
        let mut transform = fitted();
        assert_eq!(transform.number_of_parameters(), 8);
        assert_eq!(
            transform.set_parameters(&[0.0; 6]).unwrap_err(),
            SplineError::ParameterLength {
                expected: 8,
                actual: 6
            }
        );
        assert!(transform.set_fixed_parameters(&[0.0; 9]).is_err());

        let mut empty = KernelTransform::<ThinPlate, 2>::new(ThinPlate);
        assert!(empty.set_parameters(&[0.0; 3]).is_err());
        empty.set_parameters(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(empty.source_landmarks().len(), 2);
        // The fixed parameters now have to match the two landmarks.
        assert!(empty.set_fixed_parameters(&[0.0; 2]).is_err());
        empty.set_fixed_parameters(&[0.0, 0.0, 2.0, 2.0]).unwrap();
    }

    #[test]
    fn jacobian_blocks_are_kernel_responses() {
        let transform = fitted();
        let x = Point2::new(0.3, 0.7);
        let jacobian = transform.jacobian(&x).unwrap();
        assert_eq!(jacobian.shape(), (2, 8));

        for (i, landmark) in transform.source_landmarks().iter().enumerate() {
            let r = (x - landmark).norm();
            assert_relative_eq!(jacobian[(0, 2 * i)], r, epsilon = 1e-12);
            assert_relative_eq!(jacobian[(1, 2 * i + 1)], r, epsilon = 1e-12);
            assert_relative_eq!(jacobian[(0, 2 * i + 1)], 0.0);
        }
        assert_eq!(transform.nonzero_jacobian_indices(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn transform_array_checks_columns() {
        let transform = fitted();
        let points = Array2::<f64>::zeros((4, 3));
        assert_eq!(
            transform.transform_array(points.view()).unwrap_err(),
            SplineError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );

        let points = ndarray::array![[0.0, 0.0], [0.25, 0.5]];
        let mapped = transform.transform_array(points.view()).unwrap();
        let expected = transform.transform_point(&Point2::new(0.25, 0.5)).unwrap();
        assert_relative_eq!(mapped[[1, 0]], expected.x, epsilon = 1e-12);
        assert_relative_eq!(mapped[[1, 1]], expected.y, epsilon = 1e-12);
    }

    #[test]
    fn config_round_trip() {
        let config = SplineConfig {
            kernel: KernelKind::ElasticBodyReciprocal,
            stiffness: 0.02,
            poisson_ratio: 0.45,
            kernel_space: KernelSpace::Target,
            inversion: InversionMethod::Svd,
        };
        let transform = KernelTransform::<KernelFamily, 3>::from_config(&config);
        assert_eq!(transform.config(), config);
    }

    #[test]
    fn deformation_contribution_is_output_minus_affine() {
        let transform = fitted();
        let x = Point2::new(0.6, 0.2);
        let y = transform.transform_point(&x).unwrap();
        let affine = transform.affine_matrix().unwrap() * x.coords + transform.translation().unwrap();
        let contribution = transform.deformation_contribution(&x).unwrap();
        assert_relative_eq!(y.coords - affine, contribution, epsilon = 1e-12);
        assert_eq!(transform.deformation_coefficients().unwrap().len(), 4);
    }
}
