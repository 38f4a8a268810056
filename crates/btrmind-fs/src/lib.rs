//! Filesystem side of the btrmind control loop
//!
//! This crate provides:
//! - stat providers (`df`/`btrfs` commands, scripted in-memory)
//! - fragmentation estimation, model-based or heuristic
//! - the Telemetry Sampler with retry, backoff and degraded hold-over
//! - the Action Executor with one handler per action and a rollback journal
//! - the Safety Guard enforcing mutual exclusion, cool-downs and escalation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod executor;
pub mod fragmentation;
pub mod guard;
pub mod handlers;
pub mod journal;
pub mod provider;
pub mod sampler;
mod scan;

// Re-export main types
pub use executor::{
    ActionHandler, ActionTimeouts, ExecutionContext, Executor, ExecutorConfig, Plan,
    SnapshotBackend, StepError,
};
pub use fragmentation::{
    heuristic_fragmentation, FragmentationEstimator, FragmentationFeatures, FragmentationModel,
    ModelError,
};
pub use handlers::PackageCacheConfig;
pub use guard::{ActionGuardStatus, EscalationCause, GuardStatus, SafetyConfig, SafetyGuard};
pub use journal::{FileAttrs, Journal, JournalEntry};
pub use provider::{CommandStatProvider, FileScanConfig, MemoryStatProvider, StatProvider};
pub use sampler::{SamplerConfig, TelemetrySampler};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Executor, ExecutorConfig, MemoryStatProvider, SafetyConfig, SafetyGuard, StatProvider,
        TelemetrySampler,
    };
}
