//! Prioritized experience store

use btrmind_core::Experience;
use rand::Rng;
use rand_distr::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which entry to drop when the store is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest first
    #[default]
    Fifo,
    /// Smallest priority first, oldest among ties
    LowestPriority,
}

/// Experience store configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of experiences
    pub capacity: usize,
    /// Priority exponent (alpha)
    pub alpha: f64,
    /// Initial importance sampling exponent (beta)
    pub beta: f64,
    /// Added to beta after every sample, up to 1
    pub beta_increment: f64,
    /// Eviction policy
    pub eviction: EvictionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            alpha: 0.6,
            beta: 0.4,
            beta_increment: 0.001,
            eviction: EvictionPolicy::Fifo,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: u64,
    experience: Experience,
    priority: f64,
}

/// A priority-weighted mini-batch
#[derive(Debug, Clone)]
pub struct SampledBatch {
    /// Sampled experiences (cloned; the store is not consumed)
    pub experiences: Vec<Experience>,
    /// Normalized importance sampling weights, max 1
    pub weights: Vec<f64>,
    /// Stable ids for priority updates
    pub ids: Vec<u64>,
}

impl SampledBatch {
    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    /// Check if batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }
}

/// Bounded, priority-aware buffer of experiences.
///
/// New entries get the current maximum priority so that every experience
/// is likely to be replayed at least once. Reads never remove entries.
#[derive(Debug, Clone)]
pub struct ExperienceStore {
    slots: VecDeque<Slot>,
    config: StoreConfig,
    beta: f64,
    next_id: u64,
    max_priority: f64,
    /// Small constant to ensure non-zero probabilities
    epsilon: f64,
}

impl ExperienceStore {
    /// Create a new store
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity.min(65_536)),
            config: StoreConfig { capacity, ..config },
            beta: config.beta.clamp(0.0, 1.0),
            next_id: 0,
            max_priority: 1.0,
            epsilon: 1e-6,
        }
    }

    /// Add an experience at maximum priority, evicting if full. Returns its id.
    pub fn push(&mut self, experience: Experience) -> u64 {
        if self.slots.len() >= self.config.capacity {
            self.evict();
        }
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push_back(Slot {
            id,
            experience,
            priority: self.max_priority,
        });
        id
    }

    fn evict(&mut self) {
        match self.config.eviction {
            EvictionPolicy::Fifo => {
                self.slots.pop_front();
            }
            EvictionPolicy::LowestPriority => {
                let victim = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.priority.total_cmp(&b.priority))
                    .map(|(index, _)| index);
                if let Some(index) = victim {
                    self.slots.remove(index);
                }
            }
        }
    }

    /// Sample a batch with importance weights.
    ///
    /// Returns `None` when fewer than `batch_size` experiences are stored.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Option<SampledBatch> {
        if batch_size == 0 || self.slots.len() < batch_size {
            return None;
        }

        // Compute sampling probabilities
        let scaled: Vec<f64> = self
            .slots
            .iter()
            .map(|slot| (slot.priority + self.epsilon).powf(self.config.alpha))
            .collect();
        let total: f64 = scaled.iter().sum();
        let dist = WeightedIndex::new(&scaled).ok()?;

        let n = self.slots.len() as f64;
        let min_prob = scaled.iter().copied().fold(f64::INFINITY, f64::min) / total;
        let max_weight = (n * min_prob).powf(-self.beta);

        let mut batch = SampledBatch {
            experiences: Vec::with_capacity(batch_size),
            weights: Vec::with_capacity(batch_size),
            ids: Vec::with_capacity(batch_size),
        };
        for _ in 0..batch_size {
            let index = dist.sample(rng);
            let slot = &self.slots[index];
            let prob = scaled[index] / total;
            batch.experiences.push(slot.experience.clone());
            batch.weights.push((n * prob).powf(-self.beta) / max_weight);
            batch.ids.push(slot.id);
        }
        Some(batch)
    }

    /// Move beta one increment toward 1
    pub fn anneal_beta(&mut self) {
        self.beta = (self.beta + self.config.beta_increment).min(1.0);
    }

    /// Update priorities from absolute TD errors. Ids that were evicted are ignored.
    pub fn update_priorities(&mut self, ids: &[u64], td_errors: &[f64]) {
        for (&id, &error) in ids.iter().zip(td_errors) {
            if !error.is_finite() {
                continue;
            }
            // Ids are increasing front to back
            if let Ok(index) = self.slots.binary_search_by_key(&id, |slot| slot.id) {
                let priority = error.abs() + self.epsilon;
                self.slots[index].priority = priority;
                self.max_priority = self.max_priority.max(priority);
            }
        }
    }

    /// Stored experiences, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.slots.iter().map(|slot| &slot.experience)
    }

    /// Priority of an entry, if still stored
    #[must_use]
    pub fn priority(&self, id: u64) -> Option<f64> {
        self.slots
            .binary_search_by_key(&id, |slot| slot.id)
            .ok()
            .map(|index| self.slots[index].priority)
    }

    /// Current importance sampling exponent
    #[must_use]
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Get current store size
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of experiences
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Clear the store
    pub fn clear(&mut self) {
        self.slots.clear();
        self.max_priority = 1.0;
    }
}
