//! Control loop orchestrator
//!
//! One cycle is `Sampling → Deciding → Executing → Scoring`. Cycles run on a
//! fixed timer; training runs in its own task, woken every
//! `train_every_cycles` cycles, and the policy is saved on its own timer and
//! once more at shutdown.
//!
//! A degraded sample (held-over values) forces `NoOp` and produces no
//! experience. While the safety guard is escalated, cycles only sample and
//! report a `NoOp` record with no experience.

use btrmind_agent::{DecisionEngine, PolicyStore};
use btrmind_core::{
    Action, ActionMask, ActionResult, Confidence, ConfigurationError, CycleRecord, Experience,
    LoopState, RewardCalculator, Snapshot, TrainingError,
};
use btrmind_fs::{Executor, SafetyGuard, StatProvider, TelemetrySampler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ThresholdConfig, ThresholdLevel};
use crate::events::{EventSink, TrainingDataLog};
use crate::status::StatusReport;

/// Deadline used when `now + period` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// The sampling/decision/execution/scoring loop
pub struct ControlLoop {
    run_id: Uuid,
    sampler: TelemetrySampler,
    engine: Arc<DecisionEngine>,
    guard: Arc<SafetyGuard>,
    store: PolicyStore,
    status_path: PathBuf,
    rewards: RewardCalculator,
    events: EventSink,
    training_data: Option<TrainingDataLog>,
    thresholds: ThresholdConfig,
    level: ThresholdLevel,
    state: LoopState,
    cycle_id: u64,
    dry_run: bool,
    poll_interval: Duration,
    persist_interval: Duration,
    train_every: u64,
}

impl ControlLoop {
    /// Validate `config`, load or create the policy and wire the components.
    ///
    /// # Errors
    ///
    /// The configuration gate: an invalid configuration never starts a loop.
    pub async fn new(
        config: &Config,
        provider: Arc<dyn StatProvider>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let engine_config = config.engine();
        let store = PolicyStore::new(&config.learning.model_path);
        let checkpoint = store
            .load_checkpoint_or_fresh(|| engine_config.fresh_policy())
            .await;
        let engine = Arc::new(DecisionEngine::restore(engine_config, checkpoint));
        let guard = Arc::new(SafetyGuard::new(
            Executor::new(config.executor()),
            config.safety(),
        ));

        let events = match &config.event_log_path {
            Some(path) => EventSink::with_log_file(path).await.unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Cannot open event log; tracing only");
                EventSink::tracing_only()
            }),
            None => EventSink::tracing_only(),
        };
        let training_data = match config.training_data_path() {
            Some(path) => match TrainingDataLog::open(path).await {
                Ok(log) => {
                    info!(path = %path.display(), "Collecting training samples");
                    Some(log)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open training data file");
                    None
                }
            },
            None => None,
        };

        let run_id = Uuid::new_v4();
        let policy = engine.policy_snapshot().await;
        info!(
            %run_id,
            target_path = %config.monitoring.target_path.display(),
            dry_run = config.dry_run,
            policy_version = policy.version(),
            epsilon = policy.epsilon(),
            enabled = ?guard.executor().enabled().allowed(),
            "Control loop ready"
        );

        Ok(Self {
            run_id,
            sampler: TelemetrySampler::new(provider, config.sampler()),
            engine,
            guard,
            status_path: StatusReport::path_for(&config.learning.model_path),
            store,
            rewards: RewardCalculator::new(config.safety.failure_penalty),
            events,
            training_data,
            thresholds: config.thresholds,
            level: ThresholdLevel::Normal,
            state: LoopState::Idle,
            cycle_id: 0,
            dry_run: config.dry_run,
            poll_interval: config.poll_interval(),
            persist_interval: config.persist_interval(),
            train_every: config.learning.train_every_cycles.max(1),
        })
    }

    /// Identifier of this process run
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current phase
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Cycles started so far
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycle_id
    }

    /// Shared decision engine, for statistics and summary subscription
    #[must_use]
    pub fn engine(&self) -> Arc<DecisionEngine> {
        Arc::clone(&self.engine)
    }

    /// Shared safety guard; `reset()` on it clears an escalation
    #[must_use]
    pub fn guard(&self) -> Arc<SafetyGuard> {
        Arc::clone(&self.guard)
    }

    /// Telemetry sampler
    #[must_use]
    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    fn enter(&mut self, next: LoopState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected loop transition");
        }
        debug!(cycle_id = self.cycle_id, from = %self.state, to = %next, "Loop transition");
        self.state = next;
    }

    fn observe_thresholds(&mut self, snapshot: &Snapshot) {
        let level = self.thresholds.level(snapshot.utilization_pct());
        if level == self.level {
            return;
        }
        let utilization = snapshot.utilization_pct();
        let previous = self.level.name();
        match level {
            ThresholdLevel::Normal | ThresholdLevel::Warning => info!(
                target: "btrmind::threshold",
                utilization, level = level.name(), previous, "Utilization level changed"
            ),
            ThresholdLevel::Critical => warn!(
                target: "btrmind::threshold",
                utilization, level = level.name(), previous, "Utilization level changed"
            ),
            ThresholdLevel::Emergency => error!(
                target: "btrmind::threshold",
                utilization, level = level.name(), previous, "Utilization level changed"
            ),
        }
        self.level = level;
    }

    /// Run one full cycle.
    ///
    /// Returns the cycle record, or `None` when no telemetry was available.
    /// An escalated cycle yields a `NoOp` record with `before == after`.
    pub async fn run_cycle(&mut self) -> Option<CycleRecord> {
        self.cycle_id += 1;
        let cycle_id = self.cycle_id;

        self.enter(LoopState::Sampling);
        let before = match self.sampler.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(cycle_id, error = %e, "No telemetry; cycle skipped");
                self.enter(LoopState::Degraded);
                self.enter(LoopState::Idle);
                return None;
            }
        };
        self.observe_thresholds(&before);
        if let Some(log) = self.training_data.as_mut() {
            log.append(&before).await;
        }

        if self.guard.is_escalated().await {
            debug!(cycle_id, "Escalated; observing only");
            self.enter(LoopState::Escalated);
            return Some(self.observe_only(cycle_id, before).await);
        }
        let degraded = before.confidence() == Confidence::Reduced;
        if degraded {
            self.enter(LoopState::Degraded);
        }

        self.enter(LoopState::Deciding);
        let policy = self.engine.policy_snapshot().await;
        let mask = if degraded {
            ActionMask::observe_only()
        } else {
            self.guard.available().await
        };
        let decision = self.engine.select_action(&before, &policy, &mask).await;
        drop(policy);
        debug!(
            cycle_id,
            action = %decision.action,
            explored = decision.explored,
            q = ?decision.q_values,
            "Decided"
        );

        self.enter(LoopState::Executing);
        let started = Instant::now();
        let result = match self.guard.execute(decision.action, self.dry_run).await {
            Ok(result) => result,
            Err(e) => {
                warn!(cycle_id, action = %decision.action, error = %e, "Action failed");
                self.enter(LoopState::Aborted);
                ActionResult::from_error(&e, started.elapsed())
            }
        };

        self.enter(LoopState::Scoring);
        let after = match self.sampler.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(cycle_id, error = %e, "No telemetry after action; cycle not scored");
                self.enter(LoopState::Degraded);
                return None;
            }
        };
        let reward = self.rewards.score_cycle(&before, &after, &result);

        let observed = after.confidence() == Confidence::Full && !degraded;
        let simulated = result.dry_run && decision.action != Action::NoOp;
        if observed && !simulated {
            let experience = Experience::new(before.clone(), decision.action, reward, after.clone());
            self.engine.record(experience).await;
        }

        let end = if self.guard.is_escalated().await {
            LoopState::Escalated
        } else if after.confidence() == Confidence::Reduced {
            LoopState::Degraded
        } else {
            LoopState::Idle
        };
        self.enter(end);

        let record = CycleRecord {
            cycle_id,
            before,
            after,
            action: decision.action,
            explored: decision.explored,
            epsilon: decision.epsilon,
            result,
            reward,
            loop_state: end,
        };
        self.events.emit(&record).await;
        Some(record)
    }

    /// Record for a cycle that sampled but was not allowed to act
    async fn observe_only(&mut self, cycle_id: u64, before: Snapshot) -> CycleRecord {
        let epsilon = self.engine.policy_snapshot().await.epsilon();
        let result = ActionResult::noop(Duration::ZERO);
        let reward = self.rewards.score_cycle(&before, &before, &result);
        let record = CycleRecord {
            cycle_id,
            after: before.clone(),
            before,
            action: Action::NoOp,
            explored: false,
            epsilon,
            result,
            reward,
            loop_state: LoopState::Escalated,
        };
        self.events.emit(&record).await;
        record
    }

    /// Current status of this run
    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            run_id: self.run_id,
            cycles: self.cycle_id,
            loop_state: self.state,
            learning: self.engine.stats().await,
            guard: self.guard.status().await,
            knowledge: self.engine.summary().await,
            written_at: chrono::Utc::now(),
        }
    }

    /// Save the live policy and refresh the status file.
    /// Failures are logged and retried next interval.
    pub async fn persist(&self) -> bool {
        let checkpoint = self.engine.checkpoint().await;
        let saved = match self.store.save_checkpoint(&checkpoint).await {
            Ok(()) => {
                debug!(version = checkpoint.policy.version(), "Policy persisted");
                true
            }
            Err(e) => {
                warn!(path = %self.store.path().display(), error = %e, "Policy save failed");
                false
            }
        };
        if let Err(e) = self.status_report().await.write(&self.status_path).await {
            warn!(path = %self.status_path.display(), error = %e, "Status write failed");
        }
        saved
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    ///
    /// The cycle in progress always completes; the trainer is stopped and the
    /// policy saved before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let (train_tx, train_rx) = mpsc::channel(1);
        let trainer = spawn_trainer(Arc::clone(&self.engine), train_rx);

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let now = Instant::now();
        let first_save = now
            .checked_add(self.persist_interval)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut persist_timer = interval_at(first_save, self.persist_interval);
        persist_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(run_id = %self.run_id, interval_secs = self.poll_interval.as_secs(), "Control loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = persist_timer.tick() => {
                    self.persist().await;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                    if self.cycle_id % self.train_every == 0 && train_tx.try_send(()).is_err() {
                        debug!("Trainer busy; skipping this training slot");
                    }
                }
            }
        }

        info!(run_id = %self.run_id, cycles = self.cycle_id, "Shutting down control loop");
        drop(train_tx);
        if let Err(e) = trainer.await {
            warn!(error = %e, "Trainer task ended abnormally");
        }
        self.persist().await;
    }
}

fn spawn_trainer(engine: Arc<DecisionEngine>, mut wake: mpsc::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while wake.recv().await.is_some() {
            match engine.train_step().await {
                Ok(report) => {
                    debug!(
                        step = report.step,
                        loss = report.loss,
                        grad_norm = report.grad_norm,
                        epsilon = report.epsilon,
                        target_synced = report.target_synced,
                        "Training step applied"
                    );
                    engine.publish_summary().await;
                }
                Err(TrainingError::InsufficientExperience { available, required }) => {
                    debug!(available, required, "Not enough experience to train yet");
                }
                Err(e) => warn!(error = %e, "Training step skipped"),
            }
        }
    })
}
