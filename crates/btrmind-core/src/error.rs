//! Error taxonomy for the control loop
//!
//! Each layer owns one error type. Only [`ConfigurationError`] is fatal, and
//! only at start-up; everything else is recovered inside the cycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::Action;

/// Failure to read filesystem statistics. Always treated as transient.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// The stat provider could not be queried
    #[error("stat provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with something that could not be parsed
    #[error("malformed provider output: {0}")]
    Malformed(String),

    /// The provider returned numbers that cannot describe a filesystem
    #[error("inconsistent statistics: {0}")]
    Inconsistent(String),

    /// All retries were used up and no previous sample exists to hold over
    #[error("no telemetry after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last underlying error message
        last: String,
    },
}

/// Discriminant of an [`ExecutionError`], carried inside `ActionResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// A precondition (path, binary, permission) did not hold
    Precondition,
    /// Required permission or capability is missing
    PermissionDenied,
    /// The action ran past its deadline
    Timeout,
    /// The operation failed part-way and could not be undone
    PartialFailure,
    /// Underlying I/O or subprocess failure
    Io,
    /// The action is disabled by configuration
    Disabled,
    /// The action is still inside its cool-down window
    CoolingDown,
    /// Another action is already executing
    Busy,
    /// Autonomous mutation is halted until reset
    Escalated,
}

impl ExecutionErrorKind {
    /// Whether this outcome counts toward the consecutive-failure threshold.
    ///
    /// Rejections issued by the guard itself never do.
    #[must_use]
    pub fn counts_as_failure(self) -> bool {
        !matches!(
            self,
            Self::Disabled | Self::CoolingDown | Self::Busy | Self::Escalated
        )
    }
}

/// Failure while validating, performing or rolling back an action
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// Precondition check failed before any mutation
    #[error("{action}: precondition failed: {reason}")]
    Precondition {
        /// Action being executed
        action: Action,
        /// What did not hold
        reason: String,
    },

    /// Missing permission on a target path
    #[error("{action}: permission denied on {path}")]
    PermissionDenied {
        /// Action being executed
        action: Action,
        /// Offending path
        path: String,
    },

    /// Deadline exceeded; `rolled_back` tells whether state was restored
    #[error("{action}: timed out after {elapsed:?} (rolled back: {rolled_back})")]
    Timeout {
        /// Action being executed
        action: Action,
        /// Time spent before giving up
        elapsed: Duration,
        /// Whether the pre-action state was restored
        rolled_back: bool,
        /// Bytes already reclaimed by irreversible sub-steps
        bytes_reclaimed: u64,
    },

    /// Failed part-way through irreversible work
    #[error("{action}: partial failure after reclaiming {bytes_reclaimed} bytes: {reason}")]
    PartialFailure {
        /// Action being executed
        action: Action,
        /// Bytes already reclaimed
        bytes_reclaimed: u64,
        /// Underlying cause
        reason: String,
    },

    /// I/O or subprocess failure; `rolled_back` tells whether state was restored
    #[error("{action}: {reason} (rolled back: {rolled_back})")]
    Io {
        /// Action being executed
        action: Action,
        /// Underlying cause
        reason: String,
        /// Whether the pre-action state was restored
        rolled_back: bool,
    },

    /// Disabled by configuration
    #[error("{0} is disabled by configuration")]
    Disabled(Action),

    /// Inside the cool-down window
    #[error("{action} is cooling down for another {remaining:?}")]
    CoolingDown {
        /// Action being executed
        action: Action,
        /// Time left in the window
        remaining: Duration,
    },

    /// Another action holds the mutation lock
    #[error("{0} rejected: another action is in flight")]
    Busy(Action),

    /// Safety guard has escalated
    #[error("{0} rejected: autonomous mutation halted pending reset")]
    Escalated(Action),
}

impl ExecutionError {
    /// Kind discriminant for structured records
    #[must_use]
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            Self::Precondition { .. } => ExecutionErrorKind::Precondition,
            Self::PermissionDenied { .. } => ExecutionErrorKind::PermissionDenied,
            Self::Timeout { .. } => ExecutionErrorKind::Timeout,
            Self::PartialFailure { .. } => ExecutionErrorKind::PartialFailure,
            Self::Io { .. } => ExecutionErrorKind::Io,
            Self::Disabled(_) => ExecutionErrorKind::Disabled,
            Self::CoolingDown { .. } => ExecutionErrorKind::CoolingDown,
            Self::Busy(_) => ExecutionErrorKind::Busy,
            Self::Escalated(_) => ExecutionErrorKind::Escalated,
        }
    }

    /// The action this error belongs to
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Self::Precondition { action, .. }
            | Self::PermissionDenied { action, .. }
            | Self::Timeout { action, .. }
            | Self::PartialFailure { action, .. }
            | Self::Io { action, .. }
            | Self::CoolingDown { action, .. } => *action,
            Self::Disabled(action) | Self::Busy(action) | Self::Escalated(action) => *action,
        }
    }

    /// Bytes reclaimed before the failure, if any
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        match self {
            Self::Timeout {
                bytes_reclaimed, ..
            }
            | Self::PartialFailure {
                bytes_reclaimed, ..
            } => *bytes_reclaimed,
            _ => 0,
        }
    }
}

/// Failure to load or store the persisted policy. Never fatal.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// No blob at the configured path
    #[error("no persisted policy at {0}")]
    Missing(String),

    /// The blob exists but cannot be used
    #[error("persisted policy is corrupt: {0}")]
    Corrupt(String),

    /// Blob written by an incompatible format version
    #[error("unsupported policy format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid configuration. Prevents the loop from starting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Configuration file could not be read
    #[error("cannot read configuration {path}: {reason}")]
    Unreadable {
        /// File path
        path: String,
        /// Underlying cause
        reason: String,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("cannot parse configuration: {0}")]
    Parse(String),

    /// A field holds a value outside its allowed range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigurationError {
    /// Shorthand for [`ConfigurationError::Invalid`]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure inside a training step. The live policy is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    /// Not enough experiences to draw a batch
    #[error("experience store holds {available} samples, need {required}")]
    InsufficientExperience {
        /// Experiences currently stored
        available: usize,
        /// Minimum required
        required: usize,
    },

    /// The divergence guard tripped
    #[error("training diverged: {0}")]
    Diverged(String),

    /// Shape mismatch between data and network
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },
}
