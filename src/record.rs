//! Persistence of kernel spline transforms.
//!
//! A transform is stored as its configuration plus the two flat landmark vectors
//! (parameters = source landmarks, fixed parameters = target landmarks). The flat
//! layout is positional, landmark-major then axis-minor, so the order of both
//! vectors is preserved exactly.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::SplineConfig;
use crate::error::{Result, SplineError};
use crate::kernel::KernelFamily;
use crate::transform::KernelTransform;

/// Serialisable snapshot of a [`KernelTransform`] with a [`KernelFamily`] kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub dimension: usize,
    #[serde(default)]
    pub config: SplineConfig,
    pub parameters: Vec<f64>,
    pub fixed_parameters: Vec<f64>,
}

impl TransformRecord {
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize transform record")
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Failed to parse transform record")
    }
}

impl<const D: usize> KernelTransform<KernelFamily, D> {
    /// Captures the configuration and landmarks of this transform.
    pub fn to_record(&self) -> TransformRecord {
        TransformRecord {
            dimension: D,
            config: self.config(),
            parameters: self.parameters(),
            fixed_parameters: self.fixed_parameters(),
        }
    }

    /// Rebuilds a transform from a record. The record's dimension must be `D`.
    pub fn from_record(record: &TransformRecord) -> Result<Self> {
        if record.dimension != D {
            return Err(SplineError::DimensionMismatch {
                expected: D,
                actual: record.dimension,
            });
        }
        let mut transform = Self::from_config(&record.config);
        transform.set_parameters(&record.parameters)?;
        transform.set_fixed_parameters(&record.fixed_parameters)?;
        Ok(transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelKind;

    #[test]
    fn malformed_json_reports_context() {
        let err = TransformRecord::from_json("{ \"dimension\": 2 ").unwrap_err();
        assert!(err.to_string().contains("Failed to parse transform record"));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let record = TransformRecord {
            dimension: 3,
            config: SplineConfig::default(),
            parameters: vec![0.0; 3],
            fixed_parameters: vec![1.0; 3],
        };
        assert_eq!(
            KernelTransform::<KernelFamily, 2>::from_record(&record).unwrap_err(),
            SplineError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert!(KernelTransform::<KernelFamily, 3>::from_record(&record).is_ok());
    }

    #[test]
    fn mismatched_fixed_parameters_are_rejected() {
        let record = TransformRecord {
            dimension: 2,
            config: SplineConfig {
                kernel: KernelKind::Volume,
                ..SplineConfig::default()
            },
            parameters: vec![0.0, 0.0, 1.0, 1.0],
            fixed_parameters: vec![0.0, 0.0],
        };
        assert!(matches!(
            KernelTransform::<KernelFamily, 2>::from_record(&record),
            Err(SplineError::ParameterLength { expected: 4, actual: 2 })
        ));
    }
}
