//! # Kernel Spline
//!
//! Landmark-driven spline transforms for deformable registration. Given source
//! landmarks `p` and target landmarks `q`, a [`KernelTransform`] fits the spline
//! that maps every `p_i` onto `q_i` with minimal bending energy (or, with a
//! positive stiffness, approximates them), and evaluates it and its derivatives at
//! arbitrary points.
//!
//! The formulation follows Davis, Khotanzad, Flamig and Harms, "A physics-based
//! coordinate transformation for 3-D image matching", IEEE TMI 16(3), 1997.
//!
//! The main components are:
//! - [`SplineKernel`]: the pluggable spline family (thin-plate, volume, elastic body).
//! - [`system`]: assembly of the `K`, `P`, `L` and `Y` matrices.
//! - [`solver`]: equilibrated LU / SVD inversion of `L` and the split of the weights.
//! - [`KernelTransform`]: landmarks, lazy caches, evaluation and the flat
//!   parameter convention used by optimizers.
//! - [`TransformRecord`]: serde persistence of a fitted transform.
//!
//! ```
//! use kernel_spline::{KernelTransform, ThinPlate};
//! use nalgebra::Point2;
//!
//! let mut transform = KernelTransform::<_, 2>::new(ThinPlate);
//! transform.set_source_landmarks(vec![
//!     Point2::new(0.0, 0.0),
//!     Point2::new(1.0, 0.0),
//!     Point2::new(0.0, 1.0),
//! ]);
//! transform.set_target_landmarks(vec![
//!     Point2::new(0.0, 0.0),
//!     Point2::new(2.0, 0.0),
//!     Point2::new(0.0, 2.0),
//! ]);
//!
//! let mapped = transform.transform_point(&Point2::new(1.0, 1.0)).unwrap();
//! assert!((mapped - Point2::new(2.0, 2.0)).norm() < 1e-9);
//! ```

pub mod config;
pub mod error;
pub mod kernel;
pub mod landmarks;
pub mod record;
pub mod solver;
pub mod system;
pub mod transform;

pub use config::{InversionMethod, KernelKind, KernelSpace, SplineConfig};
pub use error::{Result, SplineError};
pub use kernel::{
    ElasticBody, ElasticBodyReciprocal, KernelFamily, SplineKernel, ThinPlate, ThinPlateR2LogR,
    VolumeSpline,
};
pub use record::TransformRecord;
pub use solver::{Factorization, SplineWeights, SINGULAR_VALUE_TOLERANCE};
pub use transform::{CacheState, KernelTransform};
