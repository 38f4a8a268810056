//! Execution results and per-cycle records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Action, Confidence, ExecutionError, ExecutionErrorKind, LoopState, Snapshot};

/// Outcome of one action execution. Produced once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Action that was attempted
    pub action: Action,
    /// Whether it completed as intended
    pub success: bool,
    /// Failure kind when `success` is false
    pub error: Option<ExecutionErrorKind>,
    /// Bytes freed on disk
    pub bytes_reclaimed: u64,
    /// Wall time spent
    pub duration: Duration,
    /// Simulated without mutation
    #[serde(default)]
    pub dry_run: bool,
    /// Pre-action state was restored after a failure
    #[serde(default)]
    pub rolled_back: bool,
    /// Human-readable detail
    #[serde(default)]
    pub message: String,
}

impl ActionResult {
    /// Result of a `NoOp`
    #[must_use]
    pub fn noop(duration: Duration) -> Self {
        Self::succeeded(Action::NoOp, 0, duration)
    }

    /// Successful completion
    #[must_use]
    pub fn succeeded(action: Action, bytes_reclaimed: u64, duration: Duration) -> Self {
        Self {
            action,
            success: true,
            error: None,
            bytes_reclaimed,
            duration,
            dry_run: false,
            rolled_back: false,
            message: String::new(),
        }
    }

    /// Failed completion
    #[must_use]
    pub fn failed(
        action: Action,
        kind: ExecutionErrorKind,
        bytes_reclaimed: u64,
        duration: Duration,
    ) -> Self {
        Self {
            action,
            success: false,
            error: Some(kind),
            bytes_reclaimed,
            duration,
            dry_run: false,
            rolled_back: false,
            message: String::new(),
        }
    }

    /// Convert an execution error into a failed result
    #[must_use]
    pub fn from_error(error: &ExecutionError, duration: Duration) -> Self {
        let rolled_back = matches!(
            error,
            ExecutionError::Timeout {
                rolled_back: true,
                ..
            } | ExecutionError::Io {
                rolled_back: true,
                ..
            }
        );
        Self {
            rolled_back,
            message: error.to_string(),
            ..Self::failed(error.action(), error.kind(), error.bytes_reclaimed(), duration)
        }
    }

    /// Mark as a dry run
    #[must_use]
    pub fn dry(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Attach a message
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Everything that happened in one control cycle; the unit of structured logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Monotonic cycle number within this process
    pub cycle_id: u64,
    /// Snapshot the decision was made on
    pub before: Snapshot,
    /// Snapshot taken after execution
    pub after: Snapshot,
    /// Selected action
    pub action: Action,
    /// Whether the action was chosen by exploration
    pub explored: bool,
    /// Exploration rate of the policy snapshot used
    pub epsilon: f64,
    /// Execution outcome
    pub result: ActionResult,
    /// Computed reward
    pub reward: f64,
    /// Loop state at the end of the cycle
    pub loop_state: LoopState,
}

impl CycleRecord {
    /// Flatten for machine-parseable output
    #[must_use]
    pub fn to_event(&self) -> CycleEvent {
        CycleEvent::from(self)
    }
}

/// Flat rendition of a [`CycleRecord`], one scalar per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CycleEvent {
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub explored: bool,
    pub epsilon: f64,
    pub success: bool,
    pub error: Option<ExecutionErrorKind>,
    pub bytes_reclaimed: u64,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub rolled_back: bool,
    pub reward: f64,
    pub loop_state: LoopState,
    pub before_utilization_pct: f64,
    pub before_trend_slope: f64,
    pub before_free_space_delta: i64,
    pub before_metadata_overhead_pct: f64,
    pub before_fragmentation_pct: f64,
    pub before_confidence: Confidence,
    pub after_utilization_pct: f64,
    pub after_trend_slope: f64,
    pub after_free_space_delta: i64,
    pub after_metadata_overhead_pct: f64,
    pub after_fragmentation_pct: f64,
    pub after_confidence: Confidence,
}

impl CycleEvent {
    /// Single-line JSON encoding
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&CycleRecord> for CycleEvent {
    fn from(record: &CycleRecord) -> Self {
        let before = &record.before;
        let after = &record.after;
        Self {
            cycle_id: record.cycle_id,
            timestamp: after.timestamp(),
            action: record.action,
            explored: record.explored,
            epsilon: record.epsilon,
            success: record.result.success,
            error: record.result.error,
            bytes_reclaimed: record.result.bytes_reclaimed,
            duration_ms: u64::try_from(record.result.duration.as_millis()).unwrap_or(u64::MAX),
            dry_run: record.result.dry_run,
            rolled_back: record.result.rolled_back,
            reward: record.reward,
            loop_state: record.loop_state,
            before_utilization_pct: before.utilization_pct(),
            before_trend_slope: before.trend_slope(),
            before_free_space_delta: before.free_space_delta(),
            before_metadata_overhead_pct: before.metadata_overhead_pct(),
            before_fragmentation_pct: before.fragmentation_pct(),
            before_confidence: before.confidence(),
            after_utilization_pct: after.utilization_pct(),
            after_trend_slope: after.trend_slope(),
            after_free_space_delta: after.free_space_delta(),
            after_metadata_overhead_pct: after.metadata_overhead_pct(),
            after_fragmentation_pct: after.fragmentation_pct(),
            after_confidence: after.confidence(),
        }
    }
}
