//! Landmark storage.
//!
//! Holds the ordered source landmarks `p` and target landmarks `q` of a transform,
//! together with the lazily derived displacements `d_i = q_i - p_i`. The position
//! of a landmark in its list is its index in every matrix of the spline system.

use nalgebra::{Point, SVector};
use once_cell::sync::OnceCell;

use crate::error::{Result, SplineError};

#[derive(Debug, Clone)]
pub struct LandmarkStore<const D: usize> {
    source: Vec<Point<f64, D>>,
    target: Vec<Point<f64, D>>,
    displacements: OnceCell<Vec<SVector<f64, D>>>,
}

impl<const D: usize> Default for LandmarkStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> LandmarkStore<D> {
    pub fn new() -> Self {
        LandmarkStore {
            source: Vec::new(),
            target: Vec::new(),
            displacements: OnceCell::new(),
        }
    }

    pub fn source(&self) -> &[Point<f64, D>] {
        &self.source
    }

    pub fn target(&self) -> &[Point<f64, D>] {
        &self.target
    }

    /// Replaces the source landmarks. Returns `true` if anything changed.
    pub fn set_source(&mut self, points: Vec<Point<f64, D>>) -> bool {
        if self.source == points {
            return false;
        }
        self.source = points;
        self.displacements.take();
        true
    }

    /// Replaces the target landmarks. Returns `true` if anything changed.
    pub fn set_target(&mut self, points: Vec<Point<f64, D>>) -> bool {
        if self.target == points {
            return false;
        }
        self.target = points;
        self.displacements.take();
        true
    }

    /// Removes all landmarks. Returns `true` if anything changed.
    pub fn clear(&mut self) -> bool {
        let changed = !self.source.is_empty() || !self.target.is_empty();
        self.source.clear();
        self.target.clear();
        self.displacements.take();
        changed
    }

    /// The number of landmark pairs, or an error when the two sets differ in size.
    pub fn pair_count(&self) -> Result<usize> {
        if self.source.len() != self.target.len() {
            return Err(SplineError::LandmarkCountMismatch {
                sources: self.source.len(),
                targets: self.target.len(),
            });
        }
        Ok(self.source.len())
    }

    /// `N * D`: one parameter per coordinate of every source landmark.
    pub fn number_of_parameters(&self) -> usize {
        self.source.len() * D
    }

    /// The displacements `q_i - p_i`, computed on first access.
    pub fn displacements(&self) -> Result<&[SVector<f64, D>]> {
        self.pair_count()?;
        let displacements = self.displacements.get_or_init(|| {
            self.source
                .iter()
                .zip(&self.target)
                .map(|(p, q)| q - p)
                .collect()
        });
        Ok(displacements)
    }
}

/// Flattens points landmark-major, axis-minor: `[p0.x, p0.y, p1.x, p1.y, ...]`.
pub fn flatten<const D: usize>(points: &[Point<f64, D>]) -> Vec<f64> {
    points.iter().flat_map(|p| p.coords.iter().copied()).collect()
}

/// Inverse of [`flatten`]. `values.len()` must be a multiple of `D`.
pub fn unflatten<const D: usize>(values: &[f64]) -> Result<Vec<Point<f64, D>>> {
    if values.len() % D != 0 {
        return Err(SplineError::ParameterLength {
            expected: values.len() - values.len() % D,
            actual: values.len(),
        });
    }
    Ok(values
        .chunks_exact(D)
        .map(|chunk| Point::from(SVector::<f64, D>::from_column_slice(chunk)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point2, Vector2};

    #[test]
    fn displacements_follow_target_minus_source() {
        let mut store = LandmarkStore::<2>::new();
        store.set_source(vec![Point2::new(0.0, 0.0), Point2::new(1.0, 2.0)]);
        store.set_target(vec![Point2::new(1.0, 1.0), Point2::new(0.0, 5.0)]);

        let d = store.displacements().unwrap();
        assert_eq!(d, &[Vector2::new(1.0, 1.0), Vector2::new(-1.0, 3.0)]);
        assert_eq!(store.number_of_parameters(), 4);
    }

    #[test]
    fn displacements_are_recomputed_after_replacement() {
        let mut store = LandmarkStore::<2>::new();
        store.set_source(vec![Point2::new(0.0, 0.0)]);
        store.set_target(vec![Point2::new(1.0, 0.0)]);
        assert_eq!(store.displacements().unwrap()[0], Vector2::new(1.0, 0.0));

        assert!(store.set_target(vec![Point2::new(0.0, 2.0)]));
        assert_eq!(store.displacements().unwrap()[0], Vector2::new(0.0, 2.0));
    }

    #[test]
    fn identical_replacement_reports_no_change() {
        let mut store = LandmarkStore::<2>::new();
        let points = vec![Point2::new(0.5, 0.5)];
        assert!(store.set_source(points.clone()));
        assert!(!store.set_source(points));
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let mut store = LandmarkStore::<2>::new();
        store.set_source(vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)]);
        store.set_target(vec![Point2::new(0.0, 0.0)]);
        assert_eq!(
            store.displacements().unwrap_err(),
            SplineError::LandmarkCountMismatch { sources: 2, targets: 1 }
        );
    }

    #[test]
    fn flatten_is_landmark_major() {
        let points = vec![Point2::new(1.0, 2.0), Point2::new(3.0, 4.0)];
        let flat = flatten(&points);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(unflatten::<2>(&flat).unwrap(), points);
        assert!(unflatten::<2>(&[1.0, 2.0, 3.0]).is_err());
    }
}
