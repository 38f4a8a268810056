//! Bounded snapshot history and utilization trend

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::{Snapshot, TelemetryError};

/// Ring buffer of recent snapshots, bounded by count and by age.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    buffer: VecDeque<Snapshot>,
    capacity: usize,
    window: Duration,
}

impl SnapshotHistory {
    /// Create a history holding at most `capacity` snapshots no older than `window`
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Append a snapshot, evicting the oldest entries on overflow or expiry.
    ///
    /// Timestamps must be strictly increasing.
    pub fn push(&mut self, snapshot: Snapshot) -> Result<(), TelemetryError> {
        if let Some(last) = self.buffer.back() {
            if snapshot.timestamp() <= last.timestamp() {
                return Err(TelemetryError::Inconsistent(format!(
                    "timestamp {} does not advance past {}",
                    snapshot.timestamp(),
                    last.timestamp()
                )));
            }
        }
        let horizon = snapshot.timestamp() - self.window;
        self.buffer.push_back(snapshot);
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }
        while self
            .buffer
            .front()
            .is_some_and(|s| s.timestamp() < horizon)
        {
            self.buffer.pop_front();
        }
        Ok(())
    }

    /// Earliest timestamp that is strictly after the newest entry, preferring `now`
    #[must_use]
    pub fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.buffer.back() {
            Some(last) if now <= last.timestamp() => last.timestamp() + Duration::milliseconds(1),
            _ => now,
        }
    }

    /// Trend slope over the stored snapshots, pct/hour
    #[must_use]
    pub fn trend_slope(&self) -> f64 {
        let points: Vec<(DateTime<Utc>, f64)> = self
            .buffer
            .iter()
            .map(|s| (s.timestamp(), s.utilization_pct()))
            .collect();
        regression_slope(&points)
    }

    /// Trend slope as if a point `(timestamp, utilization)` were appended
    #[must_use]
    pub fn trend_slope_with(&self, timestamp: DateTime<Utc>, utilization: f64) -> f64 {
        let horizon = timestamp - self.window;
        let mut points: Vec<(DateTime<Utc>, f64)> = self
            .buffer
            .iter()
            .filter(|s| s.timestamp() >= horizon && s.timestamp() < timestamp)
            .map(|s| (s.timestamp(), s.utilization_pct()))
            .collect();
        points.push((timestamp, utilization));
        regression_slope(&points)
    }

    /// Most recent snapshot
    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.buffer.back()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.buffer.iter()
    }

    /// Number of stored snapshots
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Ordinary least-squares slope of `y` against time in hours.
///
/// Returns 0 for fewer than two points or a degenerate time axis.
fn regression_slope(points: &[(DateTime<Utc>, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let origin = points[0].0;
    let xs: Vec<f64> = points
        .iter()
        .map(|(t, _)| (*t - origin).num_milliseconds() as f64 / 3_600_000.0)
        .collect();
    let n = points.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (x, (_, y)) in xs.iter().zip(points) {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den <= f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn snap(t: DateTime<Utc>, util: f64) -> Snapshot {
        Snapshot::new(t, util, 1.0, 0.0).unwrap()
    }

    #[test]
    fn test_slope_needs_two_points() {
        let mut history = SnapshotHistory::new(10, Duration::hours(24));
        assert_eq!(history.trend_slope(), 0.0);
        history.push(snap(Utc::now(), 50.0)).unwrap();
        assert_eq!(history.trend_slope(), 0.0);
    }

    #[test]
    fn test_linear_growth_slope() {
        let start = Utc::now();
        let mut history = SnapshotHistory::new(100, Duration::hours(24));
        for h in 0..6 {
            history
                .push(snap(start + Duration::hours(h), 50.0 + 2.0 * h as f64))
                .unwrap();
        }
        assert_relative_eq!(history.trend_slope(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(
            history.trend_slope_with(start + Duration::hours(6), 62.0),
            2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_rejects_non_increasing_timestamps() {
        let t = Utc::now();
        let mut history = SnapshotHistory::new(10, Duration::hours(24));
        history.push(snap(t, 10.0)).unwrap();
        assert!(history.push(snap(t, 11.0)).is_err());
        assert!(history.push(snap(t - Duration::seconds(1), 11.0)).is_err());
        assert_eq!(history.next_timestamp(t), t + Duration::milliseconds(1));
    }

    #[test]
    fn test_capacity_eviction() {
        let start = Utc::now();
        let mut history = SnapshotHistory::new(3, Duration::hours(24));
        for i in 0..5 {
            history
                .push(snap(start + Duration::minutes(i), i as f64))
                .unwrap();
        }
        assert_eq!(history.len(), 3);
        assert_relative_eq!(history.iter().next().unwrap().utilization_pct(), 2.0);
    }

    #[test]
    fn test_window_eviction() {
        let start = Utc::now();
        let mut history = SnapshotHistory::new(100, Duration::hours(2));
        history.push(snap(start, 10.0)).unwrap();
        history.push(snap(start + Duration::hours(1), 20.0)).unwrap();
        history.push(snap(start + Duration::hours(4), 30.0)).unwrap();
        assert_eq!(history.len(), 1);
        assert_relative_eq!(history.latest().unwrap().utilization_pct(), 30.0);
    }

    proptest! {
        #[test]
        fn prop_constant_series_has_zero_slope(level in 0.0f64..100.0, n in 2usize..50) {
            let start = Utc::now();
            let mut history = SnapshotHistory::new(100, Duration::hours(24));
            for i in 0..n {
                history.push(snap(start + Duration::minutes(i as i64), level)).unwrap();
            }
            prop_assert!(history.trend_slope().abs() < 1e-6);
        }
    }
}
