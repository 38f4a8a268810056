//! Exploration-rate schedules

use serde::{Deserialize, Serialize};

/// Trait for schedules indexed by training step
pub trait Schedule: Send + Sync {
    /// Get value at step t
    fn value(&self, t: u64) -> f64;
}

/// Linear schedule that decays from start to end over steps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSchedule {
    /// Starting value
    pub start: f64,
    /// Ending value
    pub end: f64,
    /// Number of steps for decay
    pub steps: u64,
}

impl LinearSchedule {
    /// Create a new linear schedule
    #[must_use]
    pub fn new(start: f64, end: f64, steps: u64) -> Self {
        Self { start, end, steps }
    }
}

impl Schedule for LinearSchedule {
    fn value(&self, t: u64) -> f64 {
        if t >= self.steps {
            self.end
        } else {
            let progress = t as f64 / self.steps as f64;
            self.start + (self.end - self.start) * progress
        }
    }
}

/// Exponential decay schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialSchedule {
    /// Starting value
    pub start: f64,
    /// Minimum value
    pub min_value: f64,
    /// Decay rate per step
    pub decay_rate: f64,
}

impl ExponentialSchedule {
    /// Create a new exponential schedule
    #[must_use]
    pub fn new(start: f64, min_value: f64, decay_rate: f64) -> Self {
        Self {
            start,
            min_value,
            decay_rate,
        }
    }
}

impl Schedule for ExponentialSchedule {
    fn value(&self, t: u64) -> f64 {
        let exponent = i32::try_from(t).unwrap_or(i32::MAX);
        let value = self.start * self.decay_rate.powi(exponent);
        value.max(self.min_value)
    }
}

/// Configured exploration schedule.
///
/// Values never rise over time and never drop below the floor, so some
/// exploration always remains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExplorationSchedule {
    /// `start * decay^t`, floored
    Exponential {
        /// Initial rate
        start: f64,
        /// Residual rate
        floor: f64,
        /// Per-step multiplier in `(0, 1]`
        decay: f64,
    },
    /// Straight line from `start` to `floor` over `steps`
    Linear {
        /// Initial rate
        start: f64,
        /// Residual rate
        floor: f64,
        /// Steps to reach the floor
        steps: u64,
    },
}

impl ExplorationSchedule {
    /// Initial rate
    #[must_use]
    pub fn start(&self) -> f64 {
        match *self {
            Self::Exponential { start, .. } | Self::Linear { start, .. } => start,
        }
    }

    /// Residual rate
    #[must_use]
    pub fn floor(&self) -> f64 {
        match *self {
            Self::Exponential { floor, .. } | Self::Linear { floor, .. } => floor,
        }
    }
}

impl Default for ExplorationSchedule {
    fn default() -> Self {
        Self::Exponential {
            start: 0.1,
            floor: 0.01,
            decay: 0.995,
        }
    }
}

impl Schedule for ExplorationSchedule {
    fn value(&self, t: u64) -> f64 {
        let floor = self.floor();
        let raw = match *self {
            Self::Exponential { start, floor, decay } => {
                ExponentialSchedule::new(start, floor, decay.clamp(0.0, 1.0)).value(t)
            }
            Self::Linear { start, floor, steps } => LinearSchedule::new(start, floor, steps).value(t),
        };
        raw.max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exponential_floor() {
        let schedule = ExplorationSchedule::default();
        assert_relative_eq!(schedule.value(0), 0.1);
        assert_relative_eq!(schedule.value(1), 0.1 * 0.995);
        assert_relative_eq!(schedule.value(1_000_000), 0.01);
    }

    #[test]
    fn test_linear_reaches_floor() {
        let schedule = ExplorationSchedule::Linear {
            start: 0.5,
            floor: 0.05,
            steps: 10,
        };
        assert_relative_eq!(schedule.value(5), 0.275);
        assert_relative_eq!(schedule.value(10), 0.05);
        assert_relative_eq!(schedule.value(11), 0.05);
    }

    #[test]
    fn test_monotone_non_increasing() {
        for schedule in [
            ExplorationSchedule::default(),
            ExplorationSchedule::Linear {
                start: 1.0,
                floor: 0.1,
                steps: 100,
            },
        ] {
            let mut last = f64::INFINITY;
            for t in 0..500 {
                let v = schedule.value(t);
                assert!(v <= last);
                assert!(v >= schedule.floor());
                last = v;
            }
        }
    }
}
