//! Filesystem-stat providers

use async_trait::async_trait;
use btrmind_core::{FileMetrics, FsStats, TelemetryError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::fragmentation::{heuristic_fragmentation, with_estimate, FragmentationEstimator};
use crate::scan;

/// Source of raw filesystem statistics
#[async_trait]
pub trait StatProvider: Send + Sync {
    /// Query current statistics. Any error is treated as transient.
    async fn stats(&self) -> Result<FsStats, TelemetryError>;

    /// Human-readable name for logs
    fn describe(&self) -> String {
        "stat-provider".to_string()
    }
}

/// Limits of the per-sample file walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileScanConfig {
    /// A file modified within this window counts as a recent write
    pub recent_window: Duration,
    /// Entries visited before the walk stops
    pub max_entries: usize,
}

/// Reads statistics from `df` and `btrfs filesystem df`
#[derive(Debug, Clone)]
pub struct CommandStatProvider {
    target: PathBuf,
    btrfs_binary: String,
    estimator: FragmentationEstimator,
    file_scan: Option<FileScanConfig>,
}

impl CommandStatProvider {
    /// Provider for the filesystem containing `target`
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            btrfs_binary: "btrfs".to_string(),
            estimator: FragmentationEstimator::default(),
            file_scan: None,
        }
    }

    /// Estimate fragmentation with `estimator` instead of the heuristic
    #[must_use]
    pub fn with_fragmentation(mut self, estimator: FragmentationEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Walk the target on every sample to collect file statistics
    #[must_use]
    pub fn with_file_scan(mut self, scan: FileScanConfig) -> Self {
        self.file_scan = Some(scan);
        self
    }

    /// Active fragmentation estimator
    #[must_use]
    pub fn estimator(&self) -> &FragmentationEstimator {
        &self.estimator
    }

    /// Use a different `btrfs` executable
    #[must_use]
    pub fn with_btrfs_binary(mut self, binary: impl Into<String>) -> Self {
        self.btrfs_binary = binary.into();
        self
    }

    /// Monitored path
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    async fn run(program: &str, args: &[&str], target: &Path) -> Result<String, TelemetryError> {
        let output = Command::new(program)
            .args(args)
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TelemetryError::Unavailable(format!("{program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TelemetryError::Unavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn file_metrics(&self, config: FileScanConfig) -> Option<FileMetrics> {
        let target = self.target.clone();
        let walk = tokio::task::spawn_blocking(move || {
            scan::file_metrics(&target, config.recent_window, config.max_entries, SystemTime::now())
        });
        match walk.await {
            Ok(Ok(metrics)) => {
                if metrics.truncated {
                    debug!(entries = config.max_entries, "File walk stopped at entry limit");
                }
                Some(metrics)
            }
            Ok(Err(err)) => {
                warn!(target = %self.target.display(), error = %err, "File statistics unavailable");
                None
            }
            Err(err) => {
                warn!(error = %err, "File walk task failed");
                None
            }
        }
    }
}

#[async_trait]
impl StatProvider for CommandStatProvider {
    async fn stats(&self) -> Result<FsStats, TelemetryError> {
        let df = Self::run("df", &["-B1", "--output=size,used"], &self.target).await?;
        let (total_bytes, used_bytes) = parse_df(&df)?;

        // Metadata is optional: non-btrfs targets or a missing tool report 0
        let metadata_bytes = match Self::run(&self.btrfs_binary, &["filesystem", "df", "-b"], &self.target).await {
            Ok(output) => parse_btrfs_metadata(&output),
            Err(err) => {
                debug!(error = %err, "btrfs metadata unavailable");
                0
            }
        };

        let files = match self.file_scan {
            Some(config) => self.file_metrics(config).await,
            None => None,
        };
        let stats = FsStats {
            total_bytes,
            used_bytes,
            metadata_bytes,
            fragmentation_ratio: 0.0,
            files,
        };
        Ok(with_estimate(stats, &self.estimator))
    }

    fn describe(&self) -> String {
        format!("df/btrfs on {}", self.target.display())
    }
}

/// Parse `df -B1 --output=size,used` into `(total, used)` bytes
pub fn parse_df(output: &str) -> Result<(u64, u64), TelemetryError> {
    let line = output
        .lines()
        .skip(1)
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| TelemetryError::Malformed("df printed no data row".to_string()))?;
    let mut fields = line.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next()) {
        (Some(Ok(total)), Some(Ok(used))) => Ok((total, used)),
        _ => Err(TelemetryError::Malformed(format!("unexpected df row: {line:?}"))),
    }
}

/// Sum the `used=` values of every `Metadata` line of `btrfs filesystem df -b`
#[must_use]
pub fn parse_btrfs_metadata(output: &str) -> u64 {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("Metadata"))
        .filter_map(|line| {
            line.split(|c: char| c == ',' || c.is_whitespace())
                .find_map(|field| field.strip_prefix("used="))
                .and_then(|value| value.parse::<u64>().ok())
        })
        .sum()
}

/// Scripted provider for simulations and tests.
///
/// Returns queued results in order; once the queue is empty it keeps
/// returning the last successful statistics.
#[derive(Debug, Default)]
pub struct MemoryStatProvider {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: VecDeque<Result<FsStats, TelemetryError>>,
    last: Option<FsStats>,
    calls: u64,
}

impl MemoryStatProvider {
    /// Provider with an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that always reports `stats`
    #[must_use]
    pub fn constant(stats: FsStats) -> Self {
        let provider = Self::new();
        provider.push(Ok(stats));
        provider
    }

    /// Build `FsStats` for a utilization percentage of a 1 TiB volume
    #[must_use]
    pub fn stats_for(utilization_pct: f64) -> FsStats {
        const TOTAL: u64 = 1 << 40;
        let used = (TOTAL as f64 * utilization_pct / 100.0).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let used_bytes = used.clamp(0.0, TOTAL as f64) as u64;
        FsStats {
            total_bytes: TOTAL,
            used_bytes,
            metadata_bytes: TOTAL / 100,
            fragmentation_ratio: heuristic_fragmentation(utilization_pct) / 100.0,
            files: None,
        }
    }

    /// Queue a result
    pub fn push(&self, result: Result<FsStats, TelemetryError>) {
        self.lock().queue.push_back(result);
    }

    /// Queue a successful reading at a utilization percentage
    pub fn push_utilization(&self, utilization_pct: f64) {
        self.push(Ok(Self::stats_for(utilization_pct)));
    }

    /// Queue `count` failures
    pub fn push_failures(&self, count: usize) {
        let mut state = self.lock();
        for i in 0..count {
            state
                .queue
                .push_back(Err(TelemetryError::Unavailable(format!("scripted failure {i}"))));
        }
    }

    /// Number of `stats` calls served
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StatProvider for MemoryStatProvider {
    async fn stats(&self) -> Result<FsStats, TelemetryError> {
        let mut state = self.lock();
        state.calls += 1;
        match state.queue.pop_front() {
            Some(Ok(stats)) => {
                state.last = Some(stats);
                Ok(stats)
            }
            Some(Err(err)) => Err(err),
            None => state
                .last
                .ok_or_else(|| TelemetryError::Unavailable("script exhausted".to_string())),
        }
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df() {
        let output = " 1B-blocks         Used\n499963174912 123456789012\n";
        assert_eq!(parse_df(output).unwrap(), (499_963_174_912, 123_456_789_012));
        assert!(matches!(parse_df("1B-blocks Used\n"), Err(TelemetryError::Malformed(_))));
        assert!(matches!(
            parse_df("1B-blocks Used\nabc 12\n"),
            Err(TelemetryError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_btrfs_metadata() {
        let output = "\
Data, single: total=8589934592, used=4294967296
System, DUP: total=8388608, used=16384
Metadata, DUP: total=1073741824, used=268435456
GlobalReserve, single: total=16777216, used=0
";
        assert_eq!(parse_btrfs_metadata(output), 268_435_456);
        assert_eq!(parse_btrfs_metadata("garbage"), 0);
    }

    #[test]
    fn test_scripted_stats_use_heuristic() {
        assert!(MemoryStatProvider::stats_for(50.0).fragmentation_ratio.abs() < f64::EPSILON);
        assert!((MemoryStatProvider::stats_for(90.0).fragmentation_ratio - 0.2).abs() < 1e-9);
        assert!((MemoryStatProvider::stats_for(100.0).fragmentation_ratio - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_file_scan_attaches_metrics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 300]).unwrap();
        let provider = CommandStatProvider::new(dir.path()).with_file_scan(FileScanConfig {
            recent_window: Duration::from_secs(3600),
            max_entries: 1000,
        });
        let metrics = provider
            .file_metrics(FileScanConfig {
                recent_window: Duration::from_secs(3600),
                max_entries: 1000,
            })
            .await
            .unwrap();
        assert_eq!(metrics.file_count, 2);
        assert_eq!(metrics.total_bytes, 400);
        assert_eq!(metrics.recent_writes, 2);
        assert!((metrics.avg_file_size_bytes() - 200.0).abs() < 1e-9);

        let missing = CommandStatProvider::new(dir.path().join("gone"));
        let config = FileScanConfig {
            recent_window: Duration::ZERO,
            max_entries: 10,
        };
        assert!(missing.file_metrics(config).await.is_none());
        assert!(!provider.estimator().uses_model());
    }

    #[tokio::test]
    async fn test_memory_provider_script() {
        let provider = MemoryStatProvider::new();
        assert!(provider.stats().await.is_err());
        provider.push_utilization(70.0);
        provider.push_failures(1);
        let first = provider.stats().await.unwrap();
        assert!(provider.stats().await.is_err());
        assert_eq!(provider.stats().await.unwrap(), first);
        assert_eq!(provider.calls(), 4);
    }
}
