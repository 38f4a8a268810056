//! Decision engine for the btrmind control loop
//!
//! This crate provides the learning half of the loop:
//! - a prioritized Experience Store
//! - a fixed-architecture Q-network (4 → 128 → 128 → 128 → 5)
//! - exploration schedules
//! - the double-buffered Policy and the Decision Engine that trains it
//! - policy persistence and the read-only knowledge summary

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod buffer;
pub mod engine;
pub mod network;
pub mod persistence;
pub mod policy;
pub mod schedule;
pub mod summary;

// Re-export engine
pub use engine::{Decision, DecisionEngine, EngineConfig, LearningStats, TrainingReport};

// Re-export components
pub use buffer::{EvictionPolicy, ExperienceStore, SampledBatch, StoreConfig};
pub use network::{Gradients, QNetwork, HIDDEN_LAYERS, HIDDEN_UNITS};
pub use persistence::{Checkpoint, PolicyStore, FORMAT_VERSION};
pub use policy::Policy;
pub use schedule::{ExplorationSchedule, ExponentialSchedule, LinearSchedule, Schedule};
pub use summary::{ActionSummary, KnowledgeSummary, SUMMARY_SCHEMA_VERSION};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Decision, DecisionEngine, EngineConfig, ExperienceStore, KnowledgeSummary, Policy,
        PolicyStore,
    };
    pub use btrmind_core::prelude::*;
}
