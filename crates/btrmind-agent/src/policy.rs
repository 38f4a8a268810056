//! Value-function policy

use btrmind_core::{Action, ActionMask, Snapshot, TrainingError};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::QNetwork;

/// Parameters of the value function plus the exploration rate.
///
/// A `Policy` is only ever mutated by the training step on a private copy;
/// readers hold an `Arc<Policy>` that stays fixed for the whole cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    network: QNetwork,
    epsilon: f64,
    version: u64,
    training_steps: u64,
}

impl Policy {
    /// Fresh, untrained policy
    pub fn fresh<R: Rng + ?Sized>(rng: &mut R, epsilon: f64) -> Self {
        Self {
            network: QNetwork::new(rng),
            epsilon: epsilon.clamp(0.0, 1.0),
            version: 0,
            training_steps: 0,
        }
    }

    /// Estimated return per action for a snapshot
    #[must_use]
    pub fn q_values(&self, snapshot: &Snapshot) -> [f64; Action::COUNT] {
        self.network.q_values(&snapshot.features())
    }

    /// Highest-valued allowed action; ties go to the lower index
    #[must_use]
    pub fn greedy(&self, snapshot: &Snapshot, mask: &ActionMask) -> Action {
        best_allowed(&self.q_values(snapshot), mask)
    }

    /// Exploration rate
    #[must_use]
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Incremented on every published update
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Successful training steps applied so far
    #[must_use]
    pub fn training_steps(&self) -> u64 {
        self.training_steps
    }

    /// Underlying network
    #[must_use]
    pub fn network(&self) -> &QNetwork {
        &self.network
    }

    pub(crate) fn network_mut(&mut self) -> &mut QNetwork {
        &mut self.network
    }

    /// Record a completed training step and its new exploration rate
    pub(crate) fn advance(&mut self, epsilon: f64) {
        self.training_steps += 1;
        self.version += 1;
        self.epsilon = epsilon.clamp(0.0, 1.0);
    }

    /// Reject parameters that cannot be used for decisions
    pub fn validate(&self) -> Result<(), TrainingError> {
        self.network.validate_shape()?;
        if !self.network.is_finite() {
            return Err(TrainingError::Diverged("non-finite parameters".to_string()));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(TrainingError::Diverged(format!(
                "exploration rate {} outside [0, 1]",
                self.epsilon
            )));
        }
        Ok(())
    }
}

pub(crate) fn best_allowed(q: &[f64; Action::COUNT], mask: &ActionMask) -> Action {
    let mut best = Action::NoOp;
    let mut best_value = f64::NEG_INFINITY;
    for action in Action::ALL {
        let value = q[action.index()];
        if mask.allows(action) && value > best_value {
            best = action;
            best_value = value;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_best_allowed_respects_mask() {
        let q = [0.0, 5.0, 1.0, 7.0, 2.0];
        assert_eq!(best_allowed(&q, &ActionMask::all()), Action::RebalanceMetadata);
        let mask = ActionMask::all().without(Action::RebalanceMetadata);
        assert_eq!(best_allowed(&q, &mask), Action::DeleteTemporary);
        assert_eq!(best_allowed(&q, &ActionMask::observe_only()), Action::NoOp);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let q = [1.0, 1.0, 1.0, 1.0, 1.0];
        assert_eq!(best_allowed(&q, &ActionMask::all()), Action::NoOp);
    }

    #[test]
    fn test_fresh_policy_is_valid() {
        let policy = Policy::fresh(&mut StdRng::seed_from_u64(3), 0.1);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.version(), 0);
        let snapshot = Snapshot::new(Utc::now(), 50.0, 1.0, 0.0).unwrap();
        let action = policy.greedy(&snapshot, &ActionMask::all());
        assert_eq!(action, policy.greedy(&snapshot, &ActionMask::all()));
    }
}
