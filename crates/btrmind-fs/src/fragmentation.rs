//! Fragmentation estimation
//!
//! btrfs exposes no cheap fragmentation counter, so the estimate comes either
//! from a linear model trained offline on collected samples, or from a
//! utilization heuristic. The model predicts a percentage from six
//! standardized features; three of them are log-scaled file statistics.

use btrmind_core::FsStats;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

const MIB: f64 = 1024.0 * 1024.0;

/// Number of model inputs
pub const MODEL_FEATURES: usize = 6;

/// Why a fragmentation model cannot be used
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The model file could not be read
    #[error("cannot read {path}: {reason}")]
    Unreadable {
        /// File path
        path: String,
        /// Underlying error
        reason: String,
    },
    /// The file is not a model
    #[error("malformed model: {0}")]
    Malformed(String),
    /// The parameters are inconsistent
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Provenance of a trained model
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMetadata {
    /// Model family, e.g. `linear_regression`
    pub model_type: String,
    /// When the model was fitted
    pub training_date: String,
    /// Fitting framework
    pub framework: String,
    /// Estimation method
    pub algorithm: String,
}

/// Inputs of the fragmentation model
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FragmentationFeatures {
    /// Used space, percent
    pub utilization_pct: f64,
    /// Free space in MiB
    pub free_mib: f64,
    /// Metadata share of capacity, percent
    pub metadata_pct: f64,
    /// Regular files in the tree
    pub file_count: f64,
    /// Mean file size in MiB
    pub avg_file_size_mib: f64,
    /// Files modified in the recent-write window
    pub recent_writes: f64,
}

impl FragmentationFeatures {
    /// Features from raw statistics; missing file statistics count as zero
    #[must_use]
    pub fn from_stats(stats: &FsStats) -> Self {
        let total = stats.total_bytes.max(1) as f64;
        let files = stats.files.unwrap_or_default();
        Self {
            utilization_pct: stats.used_bytes as f64 / total * 100.0,
            free_mib: stats.free_bytes() as f64 / MIB,
            metadata_pct: stats.metadata_bytes as f64 / total * 100.0,
            file_count: files.file_count as f64,
            avg_file_size_mib: files.avg_file_size_bytes() / MIB,
            recent_writes: files.recent_writes as f64,
        }
    }

    /// Model input order, with `ln(1 + x)` applied to the file statistics
    #[must_use]
    pub fn to_vector(&self) -> [f64; MODEL_FEATURES] {
        [
            self.utilization_pct,
            self.free_mib,
            self.metadata_pct,
            self.file_count.max(0.0).ln_1p(),
            self.avg_file_size_mib.max(0.0).ln_1p(),
            self.recent_writes.max(0.0).ln_1p(),
        ]
    }
}

/// Standardized linear model: `intercept + Σ coef_i * (x_i - mean_i) / scale_i`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentationModel {
    /// One weight per feature
    pub coefficients: Vec<f64>,
    /// Bias term
    pub intercept: f64,
    /// Training-set feature means
    pub feature_means: Vec<f64>,
    /// Training-set feature scales
    pub feature_scales: Vec<f64>,
    /// Feature names, for display
    pub feature_names: Vec<String>,
    /// Provenance
    #[serde(default)]
    pub metadata: ModelMetadata,
}

impl FragmentationModel {
    /// Read and validate a JSON model file
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let model: Self =
            serde_json::from_str(&text).map_err(|e| ModelError::Malformed(e.to_string()))?;
        model.validate()?;
        info!(
            path = %path.display(),
            model_type = %model.metadata.model_type,
            training_date = %model.metadata.training_date,
            "Fragmentation model loaded"
        );
        Ok(model)
    }

    /// Check parameter lengths and scales
    pub fn validate(&self) -> Result<(), ModelError> {
        let lengths = [
            ("coefficients", self.coefficients.len()),
            ("feature_means", self.feature_means.len()),
            ("feature_scales", self.feature_scales.len()),
            ("feature_names", self.feature_names.len()),
        ];
        for (name, len) in lengths {
            if len != MODEL_FEATURES {
                return Err(ModelError::Invalid(format!(
                    "{name} has {len} entries, expected {MODEL_FEATURES}"
                )));
            }
        }
        if let Some(i) = self.feature_scales.iter().position(|s| *s == 0.0 || !s.is_finite()) {
            return Err(ModelError::Invalid(format!("feature scale {i} is zero or not finite")));
        }
        let finite = self.intercept.is_finite()
            && self.coefficients.iter().all(|c| c.is_finite())
            && self.feature_means.iter().all(|m| m.is_finite());
        if !finite {
            return Err(ModelError::Invalid("non-finite parameters".to_string()));
        }
        Ok(())
    }

    /// Predicted fragmentation, percent in `[0, 100]`
    #[must_use]
    pub fn predict(&self, features: &FragmentationFeatures) -> f64 {
        let x = features.to_vector();
        let raw = x
            .iter()
            .zip(&self.coefficients)
            .zip(self.feature_means.iter().zip(&self.feature_scales))
            .fold(self.intercept, |acc, ((x, coef), (mean, scale))| {
                acc + coef * (x - mean) / scale
            });
        if raw.is_finite() {
            raw.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Fragmentation percent from utilization alone: zero up to 80%, then two
/// points per point of utilization
#[must_use]
pub fn heuristic_fragmentation(utilization_pct: f64) -> f64 {
    if utilization_pct > 80.0 {
        ((utilization_pct - 80.0) * 2.0).min(100.0)
    } else {
        0.0
    }
}

/// Source of the fragmentation estimate
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FragmentationEstimator {
    /// Utilization heuristic
    #[default]
    Heuristic,
    /// Trained linear model
    Model(Box<FragmentationModel>),
}

impl FragmentationEstimator {
    /// Load the model at `path`. With `fallback`, a missing or invalid model
    /// degrades to the heuristic instead of failing.
    pub fn load(path: &Path, fallback: bool) -> Result<Self, ModelError> {
        match FragmentationModel::load(path) {
            Ok(model) => Ok(Self::Model(Box::new(model))),
            Err(err) if fallback => {
                warn!(path = %path.display(), error = %err, "Fragmentation model unavailable; using heuristic");
                Ok(Self::Heuristic)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether a trained model is in use
    #[must_use]
    pub fn uses_model(&self) -> bool {
        matches!(self, Self::Model(_))
    }

    /// Fragmentation ratio in `[0, 1]`
    #[must_use]
    pub fn estimate(&self, stats: &FsStats) -> f64 {
        let features = FragmentationFeatures::from_stats(stats);
        let pct = match self {
            Self::Heuristic => heuristic_fragmentation(features.utilization_pct),
            Self::Model(model) => {
                let pct = model.predict(&features);
                debug!(prediction = pct, utilization = features.utilization_pct, "Fragmentation model");
                pct
            }
        };
        pct / 100.0
    }
}

/// Helper for providers that fill in the estimate after collecting counters
pub(crate) fn with_estimate(mut stats: FsStats, estimator: &FragmentationEstimator) -> FsStats {
    stats.fragmentation_ratio = estimator.estimate(&stats);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> FragmentationModel {
        FragmentationModel {
            coefficients: vec![0.5, -0.3, 0.2, 0.1, -0.1, 0.05],
            intercept: 10.0,
            feature_means: vec![50.0, 5000.0, 5.0, 8.0, 2.0, 1.0],
            feature_scales: vec![20.0, 2000.0, 2.0, 3.0, 1.0, 0.5],
            feature_names: [
                "disk_usage_percent",
                "free_space_mb",
                "metadata_usage_percent",
                "file_count_log",
                "avg_file_size_log",
                "write_frequency_log",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            metadata: ModelMetadata {
                model_type: "linear_regression".to_string(),
                ..ModelMetadata::default()
            },
        }
    }

    fn stats(utilization_pct: f64) -> FsStats {
        let total = 1u64 << 30;
        FsStats {
            total_bytes: total,
            used_bytes: (total as f64 * utilization_pct / 100.0) as u64,
            metadata_bytes: total / 100,
            fragmentation_ratio: 0.0,
            files: None,
        }
    }

    #[test]
    fn test_heuristic() {
        assert_relative_eq!(heuristic_fragmentation(70.0), 0.0);
        assert_relative_eq!(heuristic_fragmentation(80.0), 0.0);
        assert_relative_eq!(heuristic_fragmentation(85.0), 10.0);
        assert_relative_eq!(heuristic_fragmentation(150.0), 100.0);
        assert_relative_eq!(FragmentationEstimator::Heuristic.estimate(&stats(90.0)), 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_model_prediction_is_standardized_and_clamped() {
        let model = model();
        let at_means = FragmentationFeatures {
            utilization_pct: 50.0,
            free_mib: 5000.0,
            metadata_pct: 5.0,
            file_count: 8.0_f64.exp_m1(),
            avg_file_size_mib: 2.0_f64.exp_m1(),
            recent_writes: 1.0_f64.exp_m1(),
        };
        assert_relative_eq!(model.predict(&at_means), 10.0, epsilon = 1e-9);

        let extreme = FragmentationFeatures {
            utilization_pct: 5000.0,
            ..at_means
        };
        assert_relative_eq!(model.predict(&extreme), 100.0);
    }

    #[test]
    fn test_validation() {
        assert!(model().validate().is_ok());
        let mut zero_scale = model();
        zero_scale.feature_scales[2] = 0.0;
        assert!(matches!(zero_scale.validate(), Err(ModelError::Invalid(_))));
        let mut short = model();
        short.coefficients.pop();
        assert!(matches!(short.validate(), Err(ModelError::Invalid(_))));
    }

    #[test]
    fn test_load_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragmentation_model.json");
        std::fs::write(&path, serde_json::to_string(&model()).unwrap()).unwrap();
        let estimator = FragmentationEstimator::load(&path, false).unwrap();
        assert!(estimator.uses_model());
        let ratio = estimator.estimate(&stats(95.0));
        assert!((0.0..=1.0).contains(&ratio));

        let missing = dir.path().join("absent.json");
        assert!(matches!(
            FragmentationEstimator::load(&missing, false),
            Err(ModelError::Unreadable { .. })
        ));
        assert_eq!(
            FragmentationEstimator::load(&missing, true).unwrap(),
            FragmentationEstimator::Heuristic
        );

        std::fs::write(&path, b"{\"coefficients\": []}").unwrap();
        assert!(matches!(
            FragmentationEstimator::load(&path, false),
            Err(ModelError::Malformed(_))
        ));
    }
}
