//! Filesystem observations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TelemetryError;

/// Number of features fed to the value function
pub const FEATURE_DIM: usize = 4;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Raw statistics returned by a filesystem-stat provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FsStats {
    /// Capacity in bytes
    pub total_bytes: u64,
    /// Bytes in use
    pub used_bytes: u64,
    /// Bytes used by filesystem metadata
    pub metadata_bytes: u64,
    /// Fragmentation in `[0, 1]`
    pub fragmentation_ratio: f64,
    /// File-population statistics, when collected
    #[serde(default)]
    pub files: Option<FileMetrics>,
}

/// File-population statistics of the monitored tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileMetrics {
    /// Regular files seen
    pub file_count: u64,
    /// Total apparent size of those files
    pub total_bytes: u64,
    /// Files modified within the recent-write window
    pub recent_writes: u64,
    /// The walk stopped at its entry limit, so counts are lower bounds
    pub truncated: bool,
}

impl FileMetrics {
    /// Mean file size in bytes; zero for an empty tree
    #[must_use]
    pub fn avg_file_size_bytes(&self) -> f64 {
        if self.file_count == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.file_count as f64
        }
    }
}

impl FsStats {
    /// Free bytes (never negative)
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Reject statistics that cannot describe a real filesystem
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.total_bytes == 0 {
            return Err(TelemetryError::Inconsistent("total_bytes is zero".to_string()));
        }
        if self.used_bytes > self.total_bytes {
            return Err(TelemetryError::Inconsistent(format!(
                "used_bytes {} exceeds total_bytes {}",
                self.used_bytes, self.total_bytes
            )));
        }
        if self.metadata_bytes > self.total_bytes {
            return Err(TelemetryError::Inconsistent(format!(
                "metadata_bytes {} exceeds total_bytes {}",
                self.metadata_bytes, self.total_bytes
            )));
        }
        if !self.fragmentation_ratio.is_finite() {
            return Err(TelemetryError::Inconsistent(
                "fragmentation_ratio is not finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// How much a snapshot can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Fresh values from the provider
    Full,
    /// Provider failed; last-known values were held over
    Reduced,
}

/// A single timestamped observation of filesystem utilization and trend.
///
/// Fields are read-only once built; percentages are always in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    timestamp: DateTime<Utc>,
    utilization_pct: f64,
    trend_slope: f64,
    free_space_delta: i64,
    metadata_overhead_pct: f64,
    fragmentation_pct: f64,
    free_bytes: u64,
    confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<FileMetrics>,
}

impl Snapshot {
    /// Create a snapshot from percentages.
    ///
    /// Trend, free-space fields and confidence start neutral and are filled
    /// in with the `with_*` methods before the snapshot is published.
    pub fn new(
        timestamp: DateTime<Utc>,
        utilization_pct: f64,
        metadata_overhead_pct: f64,
        fragmentation_pct: f64,
    ) -> Result<Self, TelemetryError> {
        check_pct("utilization_pct", utilization_pct)?;
        check_pct("metadata_overhead_pct", metadata_overhead_pct)?;
        check_pct("fragmentation_pct", fragmentation_pct)?;
        Ok(Self {
            timestamp,
            utilization_pct,
            trend_slope: 0.0,
            free_space_delta: 0,
            metadata_overhead_pct,
            fragmentation_pct,
            free_bytes: 0,
            confidence: Confidence::Full,
            files: None,
        })
    }

    /// Derive percentages from raw provider statistics
    pub fn from_stats(timestamp: DateTime<Utc>, stats: &FsStats) -> Result<Self, TelemetryError> {
        stats.validate()?;
        let total = stats.total_bytes as f64;
        let utilization = (stats.used_bytes as f64 / total * 100.0).clamp(0.0, 100.0);
        let metadata = (stats.metadata_bytes as f64 / total * 100.0).clamp(0.0, 100.0);
        let fragmentation = (stats.fragmentation_ratio * 100.0).clamp(0.0, 100.0);
        Ok(Self::new(timestamp, utilization, metadata, fragmentation)?
            .with_free_space(stats.free_bytes(), 0)
            .with_files(stats.files))
    }

    /// Set the trend slope (percentage points per hour)
    #[must_use]
    pub fn with_trend(mut self, slope: f64) -> Self {
        self.trend_slope = if slope.is_finite() { slope } else { 0.0 };
        self
    }

    /// Set free bytes and the signed change since the previous sample
    #[must_use]
    pub fn with_free_space(mut self, free_bytes: u64, delta: i64) -> Self {
        self.free_bytes = free_bytes;
        self.free_space_delta = delta;
        self
    }

    /// Set confidence
    #[must_use]
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    /// Attach file-population statistics
    #[must_use]
    pub fn with_files(mut self, files: Option<FileMetrics>) -> Self {
        self.files = files;
        self
    }

    /// Replace the timestamp, keeping every measured value
    #[must_use]
    pub fn restamped(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Observation time
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Used space as a percentage of capacity
    #[must_use]
    pub fn utilization_pct(&self) -> f64 {
        self.utilization_pct
    }

    /// Least-squares slope of utilization over the trend window, pct/hour
    #[must_use]
    pub fn trend_slope(&self) -> f64 {
        self.trend_slope
    }

    /// Change in free bytes since the previous successful sample
    #[must_use]
    pub fn free_space_delta(&self) -> i64 {
        self.free_space_delta
    }

    /// Metadata bytes as a percentage of capacity
    #[must_use]
    pub fn metadata_overhead_pct(&self) -> f64 {
        self.metadata_overhead_pct
    }

    /// Fragmentation estimate in percent
    #[must_use]
    pub fn fragmentation_pct(&self) -> f64 {
        self.fragmentation_pct
    }

    /// Free bytes at sample time
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Whether values are fresh or held over
    #[must_use]
    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    /// File-population statistics, when the provider collected them
    #[must_use]
    pub fn files(&self) -> Option<&FileMetrics> {
        self.files.as_ref()
    }

    /// Normalized feature vector for the value function:
    /// utilization, trend slope, free-space delta, metadata overhead.
    #[must_use]
    pub fn features(&self) -> [f64; FEATURE_DIM] {
        [
            self.utilization_pct / 100.0,
            (self.trend_slope / 5.0).tanh(),
            (self.free_space_delta as f64 / GIB / 4.0).tanh(),
            self.metadata_overhead_pct / 100.0,
        ]
    }
}

fn check_pct(name: &str, value: f64) -> Result<(), TelemetryError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(TelemetryError::Inconsistent(format!(
            "{name} = {value} outside [0, 100]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats(total: u64, used: u64) -> FsStats {
        FsStats {
            total_bytes: total,
            used_bytes: used,
            metadata_bytes: total / 50,
            fragmentation_ratio: 0.1,
            files: None,
        }
    }

    #[test]
    fn test_from_stats_percentages() {
        let snap = Snapshot::from_stats(Utc::now(), &stats(1000, 855)).unwrap();
        assert_relative_eq!(snap.utilization_pct(), 85.5);
        assert_relative_eq!(snap.metadata_overhead_pct(), 2.0);
        assert_relative_eq!(snap.fragmentation_pct(), 10.0);
        assert_eq!(snap.free_bytes(), 145);
        assert_eq!(snap.confidence(), Confidence::Full);
    }

    #[test]
    fn test_file_metrics_carried_into_snapshot() {
        let mut s = stats(1000, 500);
        s.files = Some(FileMetrics {
            file_count: 4,
            total_bytes: 1000,
            recent_writes: 1,
            truncated: false,
        });
        let snap = Snapshot::from_stats(Utc::now(), &s).unwrap();
        let files = snap.files().unwrap();
        assert_relative_eq!(files.avg_file_size_bytes(), 250.0);
        assert_eq!(files.recent_writes, 1);
        assert!(Snapshot::from_stats(Utc::now(), &stats(1000, 500)).unwrap().files().is_none());
        assert_relative_eq!(FileMetrics::default().avg_file_size_bytes(), 0.0);
    }

    #[test]
    fn test_rejects_inconsistent_stats() {
        assert!(Snapshot::from_stats(Utc::now(), &stats(0, 0)).is_err());
        assert!(Snapshot::from_stats(Utc::now(), &stats(100, 101)).is_err());
        let mut bad = stats(100, 50);
        bad.fragmentation_ratio = f64::NAN;
        assert!(Snapshot::from_stats(Utc::now(), &bad).is_err());
    }

    #[test]
    fn test_percentages_out_of_range() {
        assert!(Snapshot::new(Utc::now(), 100.5, 0.0, 0.0).is_err());
        assert!(Snapshot::new(Utc::now(), 50.0, -1.0, 0.0).is_err());
        assert!(Snapshot::new(Utc::now(), 100.0, 0.0, 0.0).is_ok());
    }

    #[test]
    fn test_fragmentation_ratio_is_clamped() {
        let mut s = stats(1000, 500);
        s.fragmentation_ratio = 1.7;
        let snap = Snapshot::from_stats(Utc::now(), &s).unwrap();
        assert_relative_eq!(snap.fragmentation_pct(), 100.0);
    }

    #[test]
    fn test_features_are_bounded() {
        let snap = Snapshot::new(Utc::now(), 92.0, 3.0, 0.0)
            .unwrap()
            .with_trend(1e9)
            .with_free_space(0, -i64::MAX);
        let f = snap.features();
        assert_relative_eq!(f[0], 0.92);
        assert!(f[1] <= 1.0 && f[1] > 0.99);
        assert!(f[2] >= -1.0 && f[2] < -0.99);
        assert_relative_eq!(f[3], 0.03);
    }
}
