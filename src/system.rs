//! Assembly of the kernel spline linear system.
//!
//! For `N` landmarks in `D` dimensions the system reads
//!
//! ```text
//! | K   P | | c |   | d |
//! | P^T 0 | | a | = | 0 |
//! ```
//!
//! where `K` is the `(N D) x (N D)` block matrix of kernel responses between
//! landmarks, `P` is the `(N D) x (D^2 + D)` affine design matrix, `c` holds one
//! spline coefficient vector per landmark, `a` the affine coefficients and `d` the
//! landmark displacements. The zero rows below `d` enforce that the spline part
//! carries no affine component.

use nalgebra::{DMatrix, DVector, Point, SMatrix, SVector};

use crate::kernel::SplineKernel;

/// Number of affine coefficients in `D` dimensions: `D^2` linear terms plus `D` translations.
pub const fn affine_size(dimension: usize) -> usize {
    dimension * dimension + dimension
}

/// The assembled, landmark-dependent matrices of the spline system.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub k: DMatrix<f64>,
    pub p: DMatrix<f64>,
    pub l: DMatrix<f64>,
}

impl LinearSystem {
    /// Assembles `K`, `P` and `L`.
    ///
    /// # Arguments
    /// * `kernel` - The spline family.
    /// * `kernel_landmarks` - Landmarks whose pairwise displacements feed `K`.
    /// * `source` - Source landmarks, used for `P` and for the reflexive terms.
    /// * `stiffness` - Passed to the reflexive influence of every landmark.
    pub fn assemble<K, const D: usize>(
        kernel: &K,
        kernel_landmarks: &[Point<f64, D>],
        source: &[Point<f64, D>],
        stiffness: f64,
    ) -> Self
    where
        K: SplineKernel<D> + ?Sized,
    {
        let k = compute_k(kernel, kernel_landmarks, stiffness);
        let p = compute_p(source);
        let l = compute_l(&k, &p);
        LinearSystem { k, p, l }
    }
}

/// Builds the kernel matrix `K`.
///
/// Block `(i, j)` is `G(q_i - q_j)` for `i != j` and the reflexive influence of
/// landmark `i` on the diagonal. Symmetry is not assumed, every block is evaluated.
pub fn compute_k<K, const D: usize>(
    kernel: &K,
    landmarks: &[Point<f64, D>],
    stiffness: f64,
) -> DMatrix<f64>
where
    K: SplineKernel<D> + ?Sized,
{
    let n = landmarks.len();
    let mut k = DMatrix::<f64>::zeros(n * D, n * D);

    for (i, p_i) in landmarks.iter().enumerate() {
        for (j, p_j) in landmarks.iter().enumerate() {
            let block = if i == j {
                kernel.reflexive_influence(i, stiffness)
            } else {
                kernel.influence(&(p_i - p_j))
            };
            k.fixed_view_mut::<D, D>(i * D, j * D).copy_from(&block);
        }
    }
    k
}

/// Builds the affine design matrix `P`.
///
/// Block row `i` is `[p_i[0] I, p_i[1] I, ..., p_i[D-1] I, I]`: the linear
/// columns come first, the translation columns last.
pub fn compute_p<const D: usize>(landmarks: &[Point<f64, D>]) -> DMatrix<f64> {
    let n = landmarks.len();
    let identity = SMatrix::<f64, D, D>::identity();
    let mut p = DMatrix::<f64>::zeros(n * D, affine_size(D));

    for (i, landmark) in landmarks.iter().enumerate() {
        for axis in 0..D {
            p.fixed_view_mut::<D, D>(i * D, axis * D)
                .copy_from(&(identity * landmark[axis]));
        }
        p.fixed_view_mut::<D, D>(i * D, D * D).copy_from(&identity);
    }
    p
}

/// Builds the saddle-point matrix `L = [[K, P], [P^T, 0]]`.
pub fn compute_l(k: &DMatrix<f64>, p: &DMatrix<f64>) -> DMatrix<f64> {
    let nd = k.nrows();
    let m = p.ncols();
    let size = nd + m;
    let mut l = DMatrix::<f64>::zeros(size, size);

    l.view_mut((0, 0), (nd, nd)).copy_from(k);
    l.view_mut((0, nd), (nd, m)).copy_from(p);
    l.view_mut((nd, 0), (m, nd)).copy_from(&p.transpose());
    // The bottom-right block stays zero.
    l
}

/// Builds the right-hand side `Y`: the flattened displacements followed by
/// `D^2 + D` zeros.
pub fn compute_y<const D: usize>(displacements: &[SVector<f64, D>]) -> DVector<f64> {
    let nd = displacements.len() * D;
    let mut y = DVector::<f64>::zeros(nd + affine_size(D));
    for (i, d) in displacements.iter().enumerate() {
        y.fixed_rows_mut::<D>(i * D).copy_from(d);
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ThinPlate, VolumeSpline};
    use approx::assert_relative_eq;
    use nalgebra::{Point2, Vector2};

    fn triangle() -> Vec<Point2<f64>> {
        vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ]
    }

    #[test]
    fn affine_size_counts_linear_and_translation_terms() {
        assert_eq!(affine_size(2), 6);
        assert_eq!(affine_size(3), 12);
    }

    #[test]
    fn k_blocks_hold_kernel_and_reflexive_terms() {
        let k = compute_k(&ThinPlate, &triangle(), 0.25);
        assert_eq!(k.shape(), (6, 6));

        // Diagonal blocks: stiffness * I
        assert_relative_eq!(k[(0, 0)], 0.25);
        assert_relative_eq!(k[(1, 1)], 0.25);
        assert_relative_eq!(k[(0, 1)], 0.0);

        // Block (1, 2): |(1,0) - (0,1)| = sqrt(2)
        assert_relative_eq!(k[(2, 4)], 2.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(k[(3, 5)], 2.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(k[(2, 5)], 0.0);
    }

    #[test]
    fn p_places_coordinates_then_identity() {
        let p = compute_p(&[Point2::new(3.0, 5.0)]);
        assert_eq!(p.shape(), (2, 6));
        #[rustfmt::skip]
        let expected = DMatrix::from_row_slice(2, 6, &[
            3.0, 0.0, 5.0, 0.0, 1.0, 0.0,
            0.0, 3.0, 0.0, 5.0, 0.0, 1.0,
        ]);
        assert_eq!(p, expected);
    }

    #[test]
    fn l_is_symmetric_saddle_matrix() {
        let system = LinearSystem::assemble(&VolumeSpline, &triangle(), &triangle(), 0.0);
        let l = &system.l;
        assert_eq!(l.shape(), (12, 12));
        assert_relative_eq!(*l, l.transpose(), epsilon = 1e-12);
        assert_eq!(l.view((6, 6), (6, 6)).amax(), 0.0);
        assert_eq!(l.view((0, 6), (6, 6)), system.p.view((0, 0), (6, 6)));
    }

    #[test]
    fn y_stacks_displacements_over_zeros() {
        let y = compute_y(&[Vector2::new(1.0, 2.0), Vector2::new(3.0, 4.0)]);
        assert_eq!(y.len(), 10);
        assert_eq!(y.rows(0, 4).iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(y.rows(4, 6).iter().all(|&v| v == 0.0));
    }
}
