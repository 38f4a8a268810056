//! Recorded transitions

use serde::{Deserialize, Serialize};

use crate::{Action, Snapshot};

/// One (state, action, reward, next-state) transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Snapshot the action was chosen on
    pub prev_state: Snapshot,
    /// Action taken
    pub action: Action,
    /// Reward assigned to the transition
    pub reward: f64,
    /// Snapshot observed after execution
    pub next_state: Snapshot,
}

impl Experience {
    /// Create a new experience
    #[must_use]
    pub fn new(prev_state: Snapshot, action: Action, reward: f64, next_state: Snapshot) -> Self {
        Self {
            prev_state,
            action,
            reward,
            next_state,
        }
    }

    /// Whether every numeric component is finite and usable for training
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.reward.is_finite()
            && self.prev_state.features().iter().all(|v| v.is_finite())
            && self.next_state.features().iter().all(|v| v.is_finite())
    }
}
