//! Reward signal for a sampled transition

use serde::{Deserialize, Serialize};

use crate::{Action, ActionResult, Snapshot};

/// Reward per percentage point of utilization freed
pub const DELTA_WEIGHT: f64 = 10.0;
/// Utilization above which the high-watermark penalty applies (strict)
pub const HIGH_WATERMARK_PCT: f64 = 90.0;
/// Penalty for ending a transition above the high watermark
pub const HIGH_WATERMARK_PENALTY: f64 = 15.0;
/// Utilization at or above which the critical penalty applies
pub const CRITICAL_PCT: f64 = 99.0;
/// Penalty for ending a transition at or above the critical level
pub const CRITICAL_PENALTY: f64 = 50.0;
/// Freed percentage points above which the decline bonus applies (strict)
pub const DECLINE_BONUS_DELTA: f64 = 2.0;
/// Bonus for a sustained decline
pub const DECLINE_BONUS: f64 = 5.0;

/// Trait for reward functions over `(prev, action, next)` transitions
pub trait RewardFunction: Send + Sync {
    /// Compute reward for a transition
    fn reward(&self, prev: &Snapshot, action: Action, next: &Snapshot) -> f64;
}

/// Scores the transition between two consecutive snapshots.
///
/// The three threshold terms are independent and additive: one transition
/// may incur both penalties and the bonus at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardCalculator {
    /// Subtracted when the executed action failed; 0 means failures score
    /// like a `NoOp` over the same transition.
    pub failure_penalty: f64,
}

impl RewardCalculator {
    /// Create a calculator with the given failure penalty
    #[must_use]
    pub fn new(failure_penalty: f64) -> Self {
        Self { failure_penalty }
    }

    /// Pure, deterministic transition score
    #[must_use]
    pub fn score(prev: &Snapshot, curr: &Snapshot) -> f64 {
        score_utilization(prev.utilization_pct(), curr.utilization_pct())
    }

    /// Score a completed cycle, applying the failure penalty if configured
    #[must_use]
    pub fn score_cycle(&self, prev: &Snapshot, curr: &Snapshot, result: &ActionResult) -> f64 {
        let reward = Self::score(prev, curr);
        if result.success {
            reward
        } else {
            reward - self.failure_penalty
        }
    }
}

impl RewardFunction for RewardCalculator {
    fn reward(&self, prev: &Snapshot, _action: Action, next: &Snapshot) -> f64 {
        Self::score(prev, next)
    }
}

/// Reward from utilization percentages alone
#[must_use]
pub fn score_utilization(prev_util: f64, curr_util: f64) -> f64 {
    let delta = prev_util - curr_util;
    let mut reward = delta * DELTA_WEIGHT;
    if curr_util > HIGH_WATERMARK_PCT {
        reward -= HIGH_WATERMARK_PENALTY;
    }
    if curr_util >= CRITICAL_PCT {
        reward -= CRITICAL_PENALTY;
    }
    if delta > DECLINE_BONUS_DELTA {
        reward += DECLINE_BONUS;
    }
    reward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionErrorKind;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::time::Duration;

    fn snap(util: f64) -> Snapshot {
        Snapshot::new(Utc::now(), util, 1.0, 0.0).unwrap()
    }

    #[test]
    fn test_scenario_high_watermark_with_bonus() {
        // 30 freed, -15 watermark, +5 decline bonus
        assert_relative_eq!(score_utilization(95.0, 92.0), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_scenario_critical_both_penalties() {
        // 3 freed, -15 watermark, -50 critical
        assert_relative_eq!(score_utilization(99.5, 99.2), -62.0, epsilon = 1e-9);
    }

    #[test]
    fn test_scenario_decline_bonus() {
        assert_relative_eq!(score_utilization(80.0, 75.0), 55.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exactly_ninety_is_not_penalized() {
        assert_relative_eq!(score_utilization(90.0, 90.0), 0.0);
        assert_relative_eq!(score_utilization(90.5, 90.0), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exactly_ninety_nine_is_critical() {
        assert_relative_eq!(score_utilization(99.0, 99.0), -65.0);
    }

    #[test]
    fn test_delta_of_exactly_two_gets_no_bonus() {
        assert_relative_eq!(score_utilization(52.0, 50.0), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_failure_penalty_only_on_failure() {
        let calc = RewardCalculator::new(7.5);
        let prev = snap(80.0);
        let curr = snap(80.0);
        let ok = ActionResult::noop(Duration::ZERO);
        let failed = ActionResult::failed(
            Action::PruneSnapshots,
            ExecutionErrorKind::Io,
            0,
            Duration::ZERO,
        );
        assert_relative_eq!(calc.score_cycle(&prev, &curr, &ok), 0.0);
        assert_relative_eq!(calc.score_cycle(&prev, &curr, &failed), -7.5);
        assert_relative_eq!(
            RewardCalculator::default().score_cycle(&prev, &curr, &failed),
            0.0
        );
    }

    proptest! {
        #[test]
        fn prop_freeing_space_below_watermark_is_positive(
            curr in 0.0f64..=90.0,
            freed in 1e-6f64..10.0,
        ) {
            let prev = curr + freed;
            prop_assert!(score_utilization(prev, curr) > 0.0);
        }

        #[test]
        fn prop_monotonic_in_delta_within_bucket(
            curr in 0.0f64..=90.0,
            d1 in -20.0f64..20.0,
            d2 in -20.0f64..20.0,
        ) {
            let (lo, hi) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
            // same bonus bucket
            prop_assume!((lo > DECLINE_BONUS_DELTA) == (hi > DECLINE_BONUS_DELTA));
            prop_assert!(score_utilization(curr + lo, curr) <= score_utilization(curr + hi, curr));
        }

        #[test]
        fn prop_critical_penalty_bound(curr in 99.0f64..=100.0, prev in 0.0f64..=100.0) {
            let delta = prev - curr;
            let mut base = delta * DELTA_WEIGHT;
            if delta > DECLINE_BONUS_DELTA {
                base += DECLINE_BONUS;
            }
            prop_assert!(score_utilization(prev, curr) <= base - CRITICAL_PENALTY);
        }
    }
}
