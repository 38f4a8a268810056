//! btrmind: autonomous storage-health control loop
//!
//! Wires the telemetry sampler, decision engine and guarded executor into a
//! timer-driven cycle, with TOML configuration and structured cycle events.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod events;
pub mod lock;
pub mod orchestrator;
pub mod status;

pub use config::{
    ActionsConfig, Config, LearningConfig, MonitoringConfig, SafetySection, ThresholdConfig,
    ThresholdLevel, DEFAULT_CONFIG_PATH,
};
pub use events::{EventSink, TrainingDataLog};
pub use lock::{InstanceLock, LockError};
pub use orchestrator::ControlLoop;
pub use status::StatusReport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Config, ControlLoop, EventSink};
    pub use btrmind_agent::prelude::*;
    pub use btrmind_fs::prelude::*;
}
