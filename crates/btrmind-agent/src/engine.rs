//! Decision Engine: epsilon-greedy selection and off-cadence training
//!
//! Action selection reads an immutable `Arc<Policy>` taken at the start of a
//! cycle. Training works on a private copy against a target network that is
//! synchronized every `target_sync_steps`, and publishes the copy only once
//! it has been validated. A failed step leaves the live policy untouched.

use btrmind_core::{Action, ActionMask, Experience, Snapshot, TrainingError};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::buffer::{ExperienceStore, SampledBatch, StoreConfig};
use crate::network::{Gradients, QNetwork};
use crate::persistence::Checkpoint;
use crate::policy::{best_allowed, Policy};
use crate::schedule::{ExplorationSchedule, Schedule};
use crate::summary::{ActionSummary, KnowledgeSummary, SUMMARY_SCHEMA_VERSION};

/// Decision Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Mini-batch size
    pub batch_size: usize,
    /// Experiences required before the first training step
    pub min_replay: usize,
    /// Copy the live network into the target every N training steps
    pub target_sync_steps: u64,
    /// SGD step size
    pub learning_rate: f64,
    /// Discount factor (gamma)
    pub discount_factor: f64,
    /// Multiplier applied to rewards in training targets
    pub reward_scale: f64,
    /// Global gradient norm limit
    pub max_grad_norm: f64,
    /// Huber loss transition point
    pub huber_delta: f64,
    /// Loss above which a step counts as diverged
    pub divergence_threshold: f64,
    /// Exploration rate schedule, indexed by training step
    pub exploration: ExplorationSchedule,
    /// Experience store settings
    pub store: StoreConfig,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            min_replay: 64,
            target_sync_steps: 100,
            learning_rate: 0.001,
            discount_factor: 0.99,
            reward_scale: 0.01,
            max_grad_norm: 10.0,
            huber_delta: 1.0,
            divergence_threshold: 1.0e6,
            exploration: ExplorationSchedule::default(),
            store: StoreConfig::default(),
            seed: None,
        }
    }
}

impl EngineConfig {
    /// Untrained policy at the schedule's starting exploration rate
    #[must_use]
    pub fn fresh_policy(&self) -> Policy {
        let mut rng = seeded_rng(self.seed, 0);
        Policy::fresh(&mut rng, self.exploration.start())
    }
}

fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

/// Outcome of one `select_action`
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Chosen action
    pub action: Action,
    /// Chosen at random rather than greedily
    pub explored: bool,
    /// Estimated returns under the policy snapshot
    pub q_values: [f64; Action::COUNT],
    /// Exploration rate of the snapshot
    pub epsilon: f64,
    /// Version of the snapshot
    pub policy_version: u64,
}

/// Result of a successful training step
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Training steps after this one
    pub step: u64,
    /// Importance-weighted Huber loss
    pub loss: f64,
    /// Gradient norm before clipping
    pub grad_norm: f64,
    /// Exploration rate after the step
    pub epsilon: f64,
    /// Whether the target network was refreshed
    pub target_synced: bool,
    /// Version of the newly published policy
    pub policy_version: u64,
}

/// Learning statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    /// Decisions made
    pub decisions: u64,
    /// Of which exploratory
    pub explorations: u64,
    /// Training steps applied to the live policy
    pub training_steps: u64,
    /// Steps skipped by the divergence guard
    pub skipped_steps: u64,
    /// Current exploration rate
    pub epsilon: f64,
    /// Current policy version
    pub policy_version: u64,
    /// Experiences stored
    pub buffer_size: usize,
    /// Mean reward over recorded experiences
    pub average_reward: f64,
    /// Selections per action, in action order
    pub action_counts: [u64; Action::COUNT],
    /// Moving average of training loss
    pub mean_loss: Option<f64>,
}

#[derive(Debug, Default)]
struct Tally {
    decisions: u64,
    explorations: u64,
    skipped_steps: u64,
    selections: [u64; Action::COUNT],
    q_sums: [f64; Action::COUNT],
    reward_sums: [f64; Action::COUNT],
    reward_counts: [u64; Action::COUNT],
    total_reward: f64,
    rewards: u64,
    mean_loss: Option<f64>,
}

impl Tally {
    fn average_reward(&self) -> f64 {
        if self.rewards == 0 {
            0.0
        } else {
            self.total_reward / self.rewards as f64
        }
    }
}

struct Trainer {
    target: QNetwork,
    rng: StdRng,
}

struct Update {
    policy: Policy,
    loss: f64,
    grad_norm: f64,
    td_errors: Vec<f64>,
}

/// Value-function decision engine with a single training writer
pub struct DecisionEngine {
    config: EngineConfig,
    live: RwLock<Arc<Policy>>,
    store: Mutex<ExperienceStore>,
    trainer: Mutex<Trainer>,
    tally: Mutex<Tally>,
    rng: Mutex<StdRng>,
    summary: watch::Sender<KnowledgeSummary>,
}

impl DecisionEngine {
    /// Create an engine around an initial policy; the target starts as a copy of it
    #[must_use]
    pub fn new(config: EngineConfig, policy: Policy) -> Self {
        let target = policy.network().clone();
        Self::with_target(config, policy, target)
    }

    /// Resume from a persisted checkpoint
    #[must_use]
    pub fn restore(config: EngineConfig, checkpoint: Checkpoint) -> Self {
        let Checkpoint { policy, target } = checkpoint;
        let target = target.unwrap_or_else(|| policy.network().clone());
        Self::with_target(config, policy, target)
    }

    fn with_target(config: EngineConfig, policy: Policy, target: QNetwork) -> Self {
        let (summary, _) = watch::channel(KnowledgeSummary::empty(
            policy.version(),
            policy.epsilon(),
        ));
        let trainer = Trainer {
            target,
            rng: seeded_rng(config.seed, 1),
        };
        Self {
            store: Mutex::new(ExperienceStore::new(config.store)),
            rng: Mutex::new(seeded_rng(config.seed, 2)),
            live: RwLock::new(Arc::new(policy)),
            trainer: Mutex::new(trainer),
            tally: Mutex::new(Tally::default()),
            summary,
            config,
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Immutable policy to decide with for one cycle
    pub async fn policy_snapshot(&self) -> Arc<Policy> {
        Arc::clone(&*self.live.read().await)
    }

    /// Consistent copy of the live policy and target network for saving
    pub async fn checkpoint(&self) -> Checkpoint {
        let trainer = self.trainer.lock().await;
        let policy = Policy::clone(&*self.policy_snapshot().await);
        Checkpoint {
            policy,
            target: Some(trainer.target.clone()),
        }
    }

    /// Epsilon-greedy selection among the actions `mask` allows
    pub async fn select_action(
        &self,
        snapshot: &Snapshot,
        policy: &Policy,
        mask: &ActionMask,
    ) -> Decision {
        let q_values = policy.q_values(snapshot);
        let (action, explored) = {
            let mut rng = self.rng.lock().await;
            if rng.gen::<f64>() < policy.epsilon() {
                let allowed = mask.allowed();
                let action = allowed.choose(&mut *rng).copied().unwrap_or(Action::NoOp);
                (action, true)
            } else {
                (best_allowed(&q_values, mask), false)
            }
        };

        let mut tally = self.tally.lock().await;
        tally.decisions += 1;
        if explored {
            tally.explorations += 1;
        }
        tally.selections[action.index()] += 1;
        tally.q_sums[action.index()] += q_values[action.index()];

        Decision {
            action,
            explored,
            q_values,
            epsilon: policy.epsilon(),
            policy_version: policy.version(),
        }
    }

    /// Hand an experience to the store. Returns false if it was rejected.
    pub async fn record(&self, experience: Experience) -> bool {
        if !experience.is_finite() {
            warn!(action = %experience.action, "Dropping experience with non-finite values");
            return false;
        }
        let action = experience.action;
        let reward = experience.reward;
        self.store.lock().await.push(experience);

        let mut tally = self.tally.lock().await;
        tally.reward_sums[action.index()] += reward;
        tally.reward_counts[action.index()] += 1;
        tally.total_reward += reward;
        tally.rewards += 1;
        true
    }

    /// Run one training step.
    ///
    /// Returns `InsufficientExperience` until the store holds enough
    /// samples, and `Diverged` when the guard rejects the update; in both
    /// cases the live policy is unchanged.
    pub async fn train_step(&self) -> Result<TrainingReport, TrainingError> {
        let mut trainer = self.trainer.lock().await;
        let batch = {
            let mut store = self.store.lock().await;
            let available = store.len();
            let required = self.config.min_replay.max(self.config.batch_size).max(1);
            let insufficient = TrainingError::InsufficientExperience {
                available,
                required,
            };
            if available < required {
                return Err(insufficient);
            }
            let batch = store
                .sample(self.config.batch_size, &mut trainer.rng)
                .ok_or(insufficient)?;
            store.anneal_beta();
            batch
        };

        let live = self.policy_snapshot().await;
        let update = match self.compute_update(&live, &trainer.target, &batch) {
            Ok(update) => update,
            Err(err) => {
                self.tally.lock().await.skipped_steps += 1;
                warn!(error = %err, "Training step skipped; live policy unchanged");
                return Err(err);
            }
        };

        let step = update.policy.training_steps();
        let target_synced = step % self.config.target_sync_steps.max(1) == 0;
        if target_synced {
            trainer.target = update.policy.network().clone();
            debug!(step, "Target network synchronized");
        }

        let report = TrainingReport {
            step,
            loss: update.loss,
            grad_norm: update.grad_norm,
            epsilon: update.policy.epsilon(),
            target_synced,
            policy_version: update.policy.version(),
        };
        *self.live.write().await = Arc::new(update.policy);
        self.store
            .lock()
            .await
            .update_priorities(&batch.ids, &update.td_errors);
        {
            let mut tally = self.tally.lock().await;
            tally.mean_loss = Some(match tally.mean_loss {
                Some(mean) => mean * 0.95 + update.loss * 0.05,
                None => update.loss,
            });
        }
        drop(trainer);

        debug!(
            step = report.step,
            loss = report.loss,
            grad_norm = report.grad_norm,
            epsilon = report.epsilon,
            "Training step applied"
        );
        if report.target_synced {
            info!(step = report.step, version = report.policy_version, "Policy checkpoint");
        }
        self.publish_summary().await;
        Ok(report)
    }

    fn compute_update(
        &self,
        live: &Policy,
        target: &QNetwork,
        batch: &SampledBatch,
    ) -> Result<Update, TrainingError> {
        let config = &self.config;
        let mut policy = live.clone();
        let mut grads = Gradients::zeros_like(policy.network());
        let n = batch.len().max(1) as f64;
        let delta = config.huber_delta;
        let mut loss = 0.0;
        let mut td_errors = Vec::with_capacity(batch.len());

        for (experience, &weight) in batch.experiences.iter().zip(&batch.weights) {
            let next_q = target.q_values(&experience.next_state.features());
            let max_next = next_q.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let y = experience.reward * config.reward_scale + config.discount_factor * max_next;
            let q = policy.network().accumulate(
                &experience.prev_state.features(),
                experience.action,
                |q| weight * huber_grad(q - y, delta) / n,
                &mut grads,
            );
            let error = q - y;
            loss += weight * huber(error, delta) / n;
            td_errors.push(error.abs());
        }

        if !loss.is_finite() || loss > config.divergence_threshold {
            return Err(TrainingError::Diverged(format!("loss {loss}")));
        }
        let grad_norm = grads.clip(config.max_grad_norm);
        if !grad_norm.is_finite() {
            return Err(TrainingError::Diverged(format!("gradient norm {grad_norm}")));
        }
        policy
            .network_mut()
            .apply(&grads, config.learning_rate as f32);
        if !policy.network().is_finite() {
            return Err(TrainingError::Diverged(
                "non-finite parameters after update".to_string(),
            ));
        }
        let epsilon = config.exploration.value(policy.training_steps() + 1);
        policy.advance(epsilon);

        Ok(Update {
            policy,
            loss,
            grad_norm,
            td_errors,
        })
    }

    /// Current learning statistics
    pub async fn stats(&self) -> LearningStats {
        let policy = self.policy_snapshot().await;
        let buffer_size = self.store.lock().await.len();
        let tally = self.tally.lock().await;
        LearningStats {
            decisions: tally.decisions,
            explorations: tally.explorations,
            training_steps: policy.training_steps(),
            skipped_steps: tally.skipped_steps,
            epsilon: policy.epsilon(),
            policy_version: policy.version(),
            buffer_size,
            average_reward: tally.average_reward(),
            action_counts: tally.selections,
            mean_loss: tally.mean_loss,
        }
    }

    /// Build a fresh knowledge summary
    pub async fn summary(&self) -> KnowledgeSummary {
        let policy = self.policy_snapshot().await;
        let experience_count = self.store.lock().await.len();
        let tally = self.tally.lock().await;
        let actions = Action::ALL
            .iter()
            .map(|&action| {
                let i = action.index();
                ActionSummary {
                    action,
                    selections: tally.selections[i],
                    mean_reward: mean(tally.reward_sums[i], tally.reward_counts[i]),
                    mean_q: mean(tally.q_sums[i], tally.selections[i]),
                }
            })
            .collect();
        KnowledgeSummary {
            schema_version: SUMMARY_SCHEMA_VERSION,
            policy_version: policy.version(),
            training_steps: policy.training_steps(),
            epsilon: policy.epsilon(),
            actions,
            experience_count,
            average_reward: tally.average_reward(),
            generated_at: chrono::Utc::now(),
        }
    }

    /// Rebuild the summary and hand it to subscribers
    pub async fn publish_summary(&self) {
        let summary = self.summary().await;
        self.summary.send_replace(summary);
    }

    /// Receive summaries as they are published
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<KnowledgeSummary> {
        self.summary.subscribe()
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn huber(error: f64, delta: f64) -> f64 {
    let abs = error.abs();
    if abs <= delta {
        0.5 * error * error
    } else {
        delta * (abs - 0.5 * delta)
    }
}

fn huber_grad(error: f64, delta: f64) -> f64 {
    error.clamp(-delta, delta)
}
