//! Telemetry Sampler

use btrmind_core::{Confidence, FsStats, Snapshot, SnapshotHistory, TelemetryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::StatProvider;

/// Sampler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Provider attempts per sample
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub max_delay: Duration,
    /// Maximum snapshots kept for trend regression
    pub history_capacity: usize,
    /// Age limit of snapshots used for the trend
    pub trend_window: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            history_capacity: 2048,
            trend_window: Duration::from_secs(24 * 3600),
        }
    }
}

impl SamplerConfig {
    /// Delay after the given failed attempt (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Produces snapshots from a stat provider and keeps their history.
///
/// After `max_attempts` failed queries the last-known values are held over
/// as a `Reduced`-confidence snapshot and the sampler reports degraded
/// until the next successful query.
pub struct TelemetrySampler {
    provider: Arc<dyn StatProvider>,
    config: SamplerConfig,
    history: SnapshotHistory,
    last_free: Option<u64>,
    degraded: bool,
}

impl TelemetrySampler {
    /// Create a sampler over `provider`
    pub fn new(provider: Arc<dyn StatProvider>, config: SamplerConfig) -> Self {
        let window = chrono::Duration::from_std(config.trend_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            history: SnapshotHistory::new(config.history_capacity, window),
            provider,
            config,
            last_free: None,
            degraded: false,
        }
    }

    /// Sample now
    pub async fn sample(&mut self) -> Result<Snapshot, TelemetryError> {
        self.sample_at(Utc::now()).await
    }

    /// Sample with an explicit wall-clock reading
    pub async fn sample_at(&mut self, now: DateTime<Utc>) -> Result<Snapshot, TelemetryError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.provider.stats().await {
                Ok(stats) => match self.accept(now, &stats) {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(err) => last_error = Some(err),
                },
                Err(err) => last_error = Some(err),
            }
            if let Some(err) = &last_error {
                warn!(
                    provider = %self.provider.describe(),
                    attempt,
                    attempts,
                    error = %err,
                    "Telemetry query failed"
                );
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        let last = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        self.hold_over(now, attempts, last)
    }

    fn accept(&mut self, now: DateTime<Utc>, stats: &FsStats) -> Result<Snapshot, TelemetryError> {
        let timestamp = self.history.next_timestamp(now);
        let base = Snapshot::from_stats(timestamp, stats)?;
        let free = stats.free_bytes();
        let delta = self.last_free.map_or(0, |previous| signed_delta(previous, free));
        let slope = self
            .history
            .trend_slope_with(timestamp, base.utilization_pct());
        let snapshot = base.with_trend(slope).with_free_space(free, delta);
        self.history.push(snapshot.clone())?;
        self.last_free = Some(free);

        if self.degraded {
            info!(provider = %self.provider.describe(), "Telemetry recovered");
            self.degraded = false;
        }
        debug!(
            utilization = snapshot.utilization_pct(),
            trend = snapshot.trend_slope(),
            free_delta = snapshot.free_space_delta(),
            "Sampled"
        );
        Ok(snapshot)
    }

    fn hold_over(
        &mut self,
        now: DateTime<Utc>,
        attempts: u32,
        last: String,
    ) -> Result<Snapshot, TelemetryError> {
        let Some(previous) = self.history.latest().cloned() else {
            self.degraded = true;
            return Err(TelemetryError::Exhausted { attempts, last });
        };
        let timestamp = self.history.next_timestamp(now);
        let slope = self
            .history
            .trend_slope_with(timestamp, previous.utilization_pct());
        let snapshot = previous
            .clone()
            .restamped(timestamp)
            .with_trend(slope)
            .with_free_space(previous.free_bytes(), 0)
            .with_confidence(Confidence::Reduced);
        self.history.push(snapshot.clone())?;

        if !self.degraded {
            warn!(attempts, error = %last, "Telemetry degraded; holding over last-known values");
        }
        self.degraded = true;
        Ok(snapshot)
    }

    /// Whether the last sample was a hold-over (or failed outright)
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Retained snapshots
    #[must_use]
    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Most recent snapshot
    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.history.latest()
    }
}

fn signed_delta(previous: u64, current: u64) -> i64 {
    if current >= previous {
        i64::try_from(current - previous).unwrap_or(i64::MAX)
    } else {
        i64::try_from(previous - current).map_or(i64::MIN, |d| -d)
    }
}
