//! Safety Guard around the Executor
//!
//! Enforces three rules before any mutating action runs:
//! at most one action in flight, a per-action cool-down window, and a halt
//! on repeated failures. Escalation stops every mutating action until
//! [`SafetyGuard::reset`] is called; `NoOp` always passes.

use btrmind_core::{Action, ActionMask, ActionResult, ExecutionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::Executor;

/// Guard configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum time between two attempts of the same action
    pub cooldown: Duration,
    /// Consecutive failures of one action that trigger escalation
    pub failure_threshold: u32,
    /// A failure older than this no longer counts as consecutive
    pub failure_window: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3600),
            failure_threshold: 3,
            failure_window: Duration::from_secs(24 * 3600),
        }
    }
}

/// Why the guard escalated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationCause {
    /// Action that kept failing
    pub action: Action,
    /// Consecutive failures counted
    pub failures: u32,
    /// Last error message
    pub last_error: String,
    /// When escalation happened
    pub at: DateTime<Utc>,
}

/// Per-action guard state for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGuardStatus {
    /// The action
    pub action: Action,
    /// Consecutive failures inside the window
    pub consecutive_failures: u32,
    /// Seconds since the last attempt
    pub last_attempt_secs_ago: Option<u64>,
    /// Cool-down left, in seconds
    pub cooldown_remaining_secs: u64,
}

/// Exportable guard state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardStatus {
    /// Set while escalated
    pub escalation: Option<EscalationCause>,
    /// Mutating actions only
    pub actions: Vec<ActionGuardStatus>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tracker {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Default)]
struct GuardState {
    trackers: [Tracker; Action::COUNT],
    escalation: Option<EscalationCause>,
}

/// Rate-limits and escalates around an [`Executor`]
pub struct SafetyGuard {
    executor: Executor,
    config: SafetyConfig,
    state: Mutex<GuardState>,
    in_flight: Mutex<()>,
}

impl SafetyGuard {
    /// Wrap `executor`
    #[must_use]
    pub fn new(executor: Executor, config: SafetyConfig) -> Self {
        Self {
            executor,
            config,
            state: Mutex::new(GuardState::default()),
            in_flight: Mutex::new(()),
        }
    }

    /// Wrapped executor
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run `action` if the guard allows it.
    ///
    /// Dry runs bypass cool-downs and are never counted.
    pub async fn execute(&self, action: Action, dry_run: bool) -> Result<ActionResult, ExecutionError> {
        if !action.is_mutating() {
            return self.executor.execute(action, dry_run).await;
        }
        let Ok(_permit) = self.in_flight.try_lock() else {
            return Err(ExecutionError::Busy(action));
        };

        {
            let mut state = self.state.lock().await;
            if state.escalation.is_some() {
                return Err(ExecutionError::Escalated(action));
            }
            if !dry_run {
                let tracker = &mut state.trackers[action.index()];
                if let Some(remaining) = self.cooldown_remaining(tracker) {
                    return Err(ExecutionError::CoolingDown { action, remaining });
                }
                tracker.last_attempt = Some(Instant::now());
            }
        }

        let outcome = self.executor.execute(action, dry_run).await;
        if !dry_run {
            self.observe(action, &outcome).await;
        }
        outcome
    }

    fn cooldown_remaining(&self, tracker: &Tracker) -> Option<Duration> {
        let elapsed = tracker.last_attempt?.elapsed();
        (elapsed < self.config.cooldown).then(|| self.config.cooldown - elapsed)
    }

    async fn observe(&self, action: Action, outcome: &Result<ActionResult, ExecutionError>) {
        let mut state = self.state.lock().await;
        let tracker = &mut state.trackers[action.index()];
        let err = match outcome {
            Ok(_) => {
                tracker.consecutive_failures = 0;
                tracker.last_failure = None;
                return;
            }
            Err(err) if !err.kind().counts_as_failure() => return,
            Err(err) => err,
        };

        let now = Instant::now();
        let within_window = tracker
            .last_failure
            .is_some_and(|t| now.duration_since(t) <= self.config.failure_window);
        tracker.consecutive_failures = if within_window {
            tracker.consecutive_failures + 1
        } else {
            1
        };
        tracker.last_failure = Some(now);
        let failures = tracker.consecutive_failures;
        warn!(%action, failures, threshold = self.config.failure_threshold, "Action failure counted");

        if failures >= self.config.failure_threshold {
            let cause = EscalationCause {
                action,
                failures,
                last_error: err.to_string(),
                at: Utc::now(),
            };
            error!(
                target: "btrmind::alert",
                %action,
                failures,
                last_error = %cause.last_error,
                "Escalated: autonomous mutation halted until reset"
            );
            state.escalation = Some(cause);
        }
    }

    /// Actions a non-dry `execute` would currently let through.
    ///
    /// Disabled and cooling-down actions are excluded; only `NoOp` remains
    /// while escalated.
    pub async fn available(&self) -> ActionMask {
        let enabled = self.executor.enabled();
        let state = self.state.lock().await;
        if state.escalation.is_some() {
            return enabled.intersect(ActionMask::observe_only());
        }
        enabled.intersect(ActionMask::from_fn(|action| {
            !action.is_mutating()
                || self
                    .cooldown_remaining(&state.trackers[action.index()])
                    .is_none()
        }))
    }

    /// Whether autonomous mutation is halted
    pub async fn is_escalated(&self) -> bool {
        self.state.lock().await.escalation.is_some()
    }

    /// Clear escalation and failure counters. Cool-downs stay in force.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let was = state.escalation.take();
        for tracker in &mut state.trackers {
            tracker.consecutive_failures = 0;
            tracker.last_failure = None;
        }
        if let Some(cause) = was {
            info!(action = %cause.action, "Safety guard reset; mutation resumed");
        }
    }

    /// Snapshot of the guard state
    pub async fn status(&self) -> GuardStatus {
        let state = self.state.lock().await;
        let actions = Action::ALL
            .iter()
            .filter(|a| a.is_mutating())
            .map(|&action| {
                let tracker = &state.trackers[action.index()];
                ActionGuardStatus {
                    action,
                    consecutive_failures: tracker.consecutive_failures,
                    last_attempt_secs_ago: tracker.last_attempt.map(|t| t.elapsed().as_secs()),
                    cooldown_remaining_secs: self
                        .cooldown_remaining(tracker)
                        .map_or(0, |d| d.as_secs()),
                }
            })
            .collect();
        GuardStatus {
            escalation: state.escalation.clone(),
            actions,
        }
    }
}
