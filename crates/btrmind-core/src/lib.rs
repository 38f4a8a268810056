//! Core types for the btrmind storage-health control loop
//!
//! This crate holds the vocabulary shared by the sampler, the decision
//! engine, the executor and the orchestrator: snapshots and their trend
//! history, the closed action set, execution results, experiences, the
//! reward function and the per-cycle record.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod action;
pub mod error;
pub mod experience;
pub mod history;
pub mod record;
pub mod reward;
pub mod snapshot;
pub mod state;

// Re-export core types
pub use action::{Action, ActionMask};
pub use error::{
    ConfigurationError, ExecutionError, ExecutionErrorKind, PersistenceError, TelemetryError,
    TrainingError,
};
pub use experience::Experience;
pub use history::SnapshotHistory;
pub use record::{ActionResult, CycleEvent, CycleRecord};
pub use reward::{RewardCalculator, RewardFunction};
pub use snapshot::{Confidence, FileMetrics, FsStats, Snapshot, FEATURE_DIM};
pub use state::LoopState;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Action, ActionResult, Confidence, CycleRecord, Experience, LoopState, RewardCalculator,
        Snapshot, SnapshotHistory,
    };
}
