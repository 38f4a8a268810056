//! Read-only knowledge export for cooperating agents

use btrmind_core::Action;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version of [`KnowledgeSummary`]
pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Aggregate statistics for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    /// The action
    pub action: Action,
    /// Times it was selected
    pub selections: u64,
    /// Mean reward observed after it ran
    pub mean_reward: f64,
    /// Mean estimated return at decision time
    pub mean_q: f64,
}

/// Versioned aggregate view of what the engine has learned.
///
/// Contains no weights; handed out by value so holders never observe
/// the engine's internal state changing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSummary {
    /// Schema of this message
    pub schema_version: u32,
    /// Version of the policy the numbers describe
    pub policy_version: u64,
    /// Training steps applied
    pub training_steps: u64,
    /// Current exploration rate
    pub epsilon: f64,
    /// Per-action aggregates, in action order
    pub actions: Vec<ActionSummary>,
    /// Experiences currently stored
    pub experience_count: usize,
    /// Mean reward over all recorded experiences
    pub average_reward: f64,
    /// When the summary was produced
    pub generated_at: DateTime<Utc>,
}

impl KnowledgeSummary {
    /// Empty summary for a policy that has seen nothing
    #[must_use]
    pub fn empty(policy_version: u64, epsilon: f64) -> Self {
        Self {
            schema_version: SUMMARY_SCHEMA_VERSION,
            policy_version,
            training_steps: 0,
            epsilon,
            actions: Action::ALL
                .iter()
                .map(|&action| ActionSummary {
                    action,
                    selections: 0,
                    mean_reward: 0.0,
                    mean_q: 0.0,
                })
                .collect(),
            experience_count: 0,
            average_reward: 0.0,
            generated_at: Utc::now(),
        }
    }

    /// Action with the best mean reward among those tried
    #[must_use]
    pub fn best_action(&self) -> Option<Action> {
        self.actions
            .iter()
            .filter(|a| a.selections > 0)
            .max_by(|a, b| a.mean_reward.total_cmp(&b.mean_reward))
            .map(|a| a.action)
    }
}
