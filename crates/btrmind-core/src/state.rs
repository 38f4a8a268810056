//! Control loop phases

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the control loop.
///
/// A healthy cycle runs `Idle → Sampling → Deciding → Executing → Scoring → Idle`.
/// `Degraded` is entered when telemetry is unavailable and left on the next
/// good sample. `Aborted` marks a failed action whose cycle still completes.
/// `Escalated` persists across cycles until an external reset; cycles keep
/// sampling while escalated but never mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the next tick
    #[default]
    Idle,
    /// Querying the stat provider
    Sampling,
    /// Selecting an action
    Deciding,
    /// Running an action under the safety guard
    Executing,
    /// Re-sampling and computing the reward
    Scoring,
    /// Telemetry failed; last-known values are held over
    Degraded,
    /// The action failed; rollback was attempted
    Aborted,
    /// Autonomous mutation stopped
    Escalated,
}

impl LoopState {
    /// Whether `next` is a legal successor of `self`
    #[must_use]
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::{Aborted, Deciding, Degraded, Escalated, Executing, Idle, Sampling, Scoring};
        matches!(
            (self, next),
            (Idle | Degraded | Escalated, Sampling)
                | (Escalated, Idle)
                | (Sampling, Deciding | Degraded | Escalated)
                | (Degraded, Deciding | Idle)
                | (Deciding, Executing)
                | (Executing, Scoring | Aborted | Escalated)
                | (Aborted, Scoring | Escalated)
                | (Scoring, Idle | Degraded | Escalated)
        )
    }

    /// Whether the state blocks autonomous mutation
    #[must_use]
    pub fn is_escalated(self) -> bool {
        matches!(self, LoopState::Escalated)
    }

    /// Lower-case name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Sampling => "sampling",
            LoopState::Deciding => "deciding",
            LoopState::Executing => "executing",
            LoopState::Scoring => "scoring",
            LoopState::Degraded => "degraded",
            LoopState::Aborted => "aborted",
            LoopState::Escalated => "escalated",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
