//! Structured cycle events
//!
//! Every [`CycleRecord`] becomes one flat `tracing` event on target
//! `btrmind::cycle` and, when an event log is configured, one JSON line.
//! [`TrainingDataLog`] separately collects samples as CSV rows for fitting
//! the fragmentation model offline.

use btrmind_core::{Confidence, CycleEvent, CycleRecord, Snapshot};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Destination for cycle records
#[derive(Debug, Default)]
pub struct EventSink {
    log: Option<(PathBuf, File)>,
}

impl EventSink {
    /// Sink that only emits `tracing` events
    #[must_use]
    pub fn tracing_only() -> Self {
        Self::default()
    }

    /// Sink that also appends JSON lines to `path`, creating parent directories
    ///
    /// # Errors
    ///
    /// Any I/O error opening the file.
    pub async fn with_log_file(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            log: Some((path.to_path_buf(), file)),
        })
    }

    /// Event log path, if any
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|(path, _)| path.as_path())
    }

    /// Emit one record. Write failures are logged and otherwise ignored.
    pub async fn emit(&mut self, record: &CycleRecord) {
        let event = record.to_event();
        trace_event(&event);

        let Some((path, file)) = self.log.as_mut() else {
            return;
        };
        let line = match event.to_json_line() {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                warn!(cycle_id = event.cycle_id, error = %e, "cannot serialize cycle event");
                return;
            }
        };
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            warn!(path = %path.display(), error = %e, "cannot append cycle event");
        }
    }
}

/// Column header of the training-data CSV
pub const TRAINING_DATA_HEADER: &str = "timestamp,disk_usage_percent,free_space_mb,metadata_usage_percent,\
file_count,avg_file_size_mb,write_frequency,fragmentation_proxy";

const MIB: f64 = 1024.0 * 1024.0;

/// Appends full-confidence samples to a CSV file
#[derive(Debug)]
pub struct TrainingDataLog {
    path: PathBuf,
    file: File,
    rows: u64,
}

impl TrainingDataLog {
    /// Open `path` for appending, writing the header when the file is new or empty
    ///
    /// # Errors
    ///
    /// Any I/O error creating or opening the file.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        if file.metadata().await?.len() == 0 {
            file.write_all(format!("{TRAINING_DATA_HEADER}\n").as_bytes()).await?;
            file.flush().await?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            rows: 0,
        })
    }

    /// CSV row for `snapshot`; missing file statistics are written as zero
    #[must_use]
    pub fn row(snapshot: &Snapshot) -> String {
        let files = snapshot.files().copied().unwrap_or_default();
        format!(
            "{},{:.4},{:.2},{:.4},{},{:.4},{},{:.4}",
            snapshot.timestamp().to_rfc3339(),
            snapshot.utilization_pct(),
            snapshot.free_bytes() as f64 / MIB,
            snapshot.metadata_overhead_pct(),
            files.file_count,
            files.avg_file_size_bytes() / MIB,
            files.recent_writes,
            snapshot.fragmentation_pct(),
        )
    }

    /// Append `snapshot` unless it holds over stale values.
    /// Write failures are logged and otherwise ignored.
    pub async fn append(&mut self, snapshot: &Snapshot) -> bool {
        if snapshot.confidence() != Confidence::Full {
            return false;
        }
        let line = format!("{}\n", Self::row(snapshot));
        let written = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.flush().await
        };
        match written.await {
            Ok(()) => {
                self.rows += 1;
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot append training sample");
                false
            }
        }
    }

    /// Rows appended by this process
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

fn trace_event(event: &CycleEvent) {
    info!(
        target: "btrmind::cycle",
        cycle_id = event.cycle_id,
        action = %event.action,
        explored = event.explored,
        epsilon = event.epsilon,
        success = event.success,
        error = ?event.error,
        bytes_reclaimed = event.bytes_reclaimed,
        duration_ms = event.duration_ms,
        dry_run = event.dry_run,
        rolled_back = event.rolled_back,
        reward = event.reward,
        loop_state = %event.loop_state,
        before_utilization_pct = event.before_utilization_pct,
        before_trend_slope = event.before_trend_slope,
        before_free_space_delta = event.before_free_space_delta,
        before_metadata_overhead_pct = event.before_metadata_overhead_pct,
        after_utilization_pct = event.after_utilization_pct,
        after_trend_slope = event.after_trend_slope,
        after_free_space_delta = event.after_free_space_delta,
        after_metadata_overhead_pct = event.after_metadata_overhead_pct,
        "cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrmind_core::{Action, ActionResult, LoopState, Snapshot};
    use chrono::Utc;
    use std::time::Duration;

    fn record(cycle_id: u64) -> CycleRecord {
        let before = Snapshot::new(Utc::now(), 92.0, 3.0, 20.0).unwrap();
        let after = Snapshot::new(before.timestamp() + chrono::Duration::seconds(60), 90.5, 3.0, 20.0)
            .unwrap();
        CycleRecord {
            cycle_id,
            before,
            after,
            action: Action::PruneSnapshots,
            explored: true,
            epsilon: 0.1,
            result: ActionResult::succeeded(Action::PruneSnapshots, 4096, Duration::from_millis(12)),
            reward: 15.0,
            loop_state: LoopState::Idle,
        }
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        let mut sink = EventSink::with_log_file(&path).await.unwrap();
        assert_eq!(sink.log_path(), Some(path.as_path()));
        sink.emit(&record(1)).await;
        sink.emit(&record(2)).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: CycleEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.cycle_id, 2);
        assert_eq!(second.action, Action::PruneSnapshots);
        assert_eq!(second.bytes_reclaimed, 4096);
    }

    #[tokio::test]
    async fn test_training_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/training.csv");
        let mut log = TrainingDataLog::open(&path).await.unwrap();

        let files = btrmind_core::FileMetrics {
            file_count: 4,
            total_bytes: 8 * 1024 * 1024,
            recent_writes: 3,
            truncated: false,
        };
        let full = Snapshot::new(Utc::now(), 91.0, 2.5, 22.0)
            .unwrap()
            .with_free_space(512 * 1024 * 1024, 0)
            .with_files(Some(files));
        assert!(log.append(&full).await);
        let held = full.clone().with_confidence(Confidence::Reduced);
        assert!(!log.append(&held).await);
        assert_eq!(log.rows(), 1);

        // Reopening keeps a single header
        drop(log);
        let mut log = TrainingDataLog::open(&path).await.unwrap();
        assert!(log.append(&full).await);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRAINING_DATA_HEADER);
        let fields: Vec<_> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[1], "91.0000");
        assert_eq!(fields[2], "512.00");
        assert_eq!(fields[4], "4");
        assert_eq!(fields[5], "2.0000");
        assert_eq!(fields[6], "3");
        assert_eq!(fields[7], "22.0000");
    }

    #[tokio::test]
    async fn test_tracing_only_sink_accepts_records() {
        let mut sink = EventSink::tracing_only();
        assert!(sink.log_path().is_none());
        sink.emit(&record(1)).await;
    }
}
