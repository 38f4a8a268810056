//! Daemon configuration
//!
//! Loaded from TOML. Every section and field falls back to its default, so a
//! partial file (or none at all) is valid. [`Config::validate`] is the only
//! gate that may stop the daemon from starting.

use btrmind_agent::{EngineConfig, EvictionPolicy, ExplorationSchedule, StoreConfig};
use btrmind_core::{Action, ActionMask, ConfigurationError};
use btrmind_fs::{
    ActionTimeouts, CommandStatProvider, ExecutorConfig, FileScanConfig, FragmentationEstimator,
    PackageCacheConfig, SafetyConfig, SamplerConfig, SnapshotBackend,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/btrmind/config.toml";

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;
const YEAR: u64 = 365 * DAY;

// Upper bounds keep every derived duration and deadline representable
const MAX_POLL_INTERVAL_SECS: u64 = DAY;
const MAX_TREND_WINDOW_HOURS: u64 = YEAR / HOUR;
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;
const MAX_RECENT_WRITE_WINDOW_MINS: u64 = 7 * DAY / MINUTE;
const MAX_ACTION_TIMEOUT_SECS: u64 = 7 * DAY;
const MAX_TEMP_AGE_HOURS: u64 = 10 * YEAR / HOUR;
const MAX_COLD_AGE_DAYS: u64 = 10 * YEAR / DAY;
const MAX_PERIOD_SECS: u64 = 30 * DAY;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Simulate every action without touching the filesystem
    pub dry_run: bool,
    /// Append one JSON line per cycle to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log_path: Option<PathBuf>,
    /// Sampling cadence and telemetry
    pub monitoring: MonitoringConfig,
    /// Alert levels
    pub thresholds: ThresholdConfig,
    /// Per-action toggles and parameters
    pub actions: ActionsConfig,
    /// Decision engine and persistence
    pub learning: LearningConfig,
    /// Safety guard
    pub safety: SafetySection,
}

/// `[monitoring]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Mount point of the managed volume
    pub target_path: PathBuf,
    /// Seconds between cycles
    pub poll_interval_secs: u64,
    /// Trend regression window
    pub trend_window_hours: u64,
    /// Snapshots kept for the trend
    pub history_capacity: usize,
    /// Provider attempts per sample
    pub retry_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay_ms: u64,
    /// Binary used for metadata statistics and btrfs actions
    pub btrfs_binary: String,
    /// Walk the target every sample for file count, size and write activity
    pub collect_file_metrics: bool,
    /// Entries visited per walk before it stops
    pub file_scan_limit: usize,
    /// Files modified within this many minutes count as recent writes
    pub recent_write_window_mins: u64,
    /// Estimate fragmentation with a trained model
    pub use_fragmentation_model: bool,
    /// JSON model file
    pub fragmentation_model_path: PathBuf,
    /// Use the utilization heuristic when the model cannot be loaded
    pub fallback_to_heuristic: bool,
    /// Append samples to a CSV file for offline model training
    pub collect_training_data: bool,
    /// CSV output
    pub training_data_path: PathBuf,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            target_path: PathBuf::from("/"),
            poll_interval_secs: 60,
            trend_window_hours: 24,
            history_capacity: 2048,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            btrfs_binary: "btrfs".to_string(),
            collect_file_metrics: false,
            file_scan_limit: 100_000,
            recent_write_window_mins: 60,
            use_fragmentation_model: false,
            fragmentation_model_path: PathBuf::from("/var/lib/btrmind/fragmentation_model.json"),
            fallback_to_heuristic: true,
            collect_training_data: false,
            training_data_path: PathBuf::from("/var/lib/btrmind/training_data.csv"),
        }
    }
}

/// Utilization level relative to the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    /// Below the warning level
    Normal,
    /// At or above the warning level
    Warning,
    /// At or above the critical level
    Critical,
    /// At or above the emergency level
    Emergency,
}

impl ThresholdLevel {
    /// Lowercase name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

/// `[thresholds]`, utilization percentages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Warning level
    pub warning: f64,
    /// Critical level
    pub critical: f64,
    /// Emergency level
    pub emergency: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            warning: 85.0,
            critical: 95.0,
            emergency: 98.0,
        }
    }
}

impl ThresholdConfig {
    /// Classify a utilization percentage
    #[must_use]
    pub fn level(&self, utilization_pct: f64) -> ThresholdLevel {
        if utilization_pct >= self.emergency {
            ThresholdLevel::Emergency
        } else if utilization_pct >= self.critical {
            ThresholdLevel::Critical
        } else if utilization_pct >= self.warning {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }
}

/// `[actions]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Allow `DeleteTemporary`
    pub enable_delete_temporary: bool,
    /// Allow `CompressInactive`
    pub enable_compress_inactive: bool,
    /// Allow `RebalanceMetadata`
    pub enable_rebalance_metadata: bool,
    /// Allow `PruneSnapshots`
    pub enable_prune_snapshots: bool,
    /// Temporary roots; a `*` component matches any directory
    pub temp_paths: Vec<PathBuf>,
    /// Minimum age of a temporary file before removal
    pub temp_max_age_hours: u64,
    /// Roots searched for cold files
    pub cold_paths: Vec<PathBuf>,
    /// Days without modification before a file is cold
    pub cold_age_days: u64,
    /// Files smaller than this are never compressed
    pub compress_min_bytes: u64,
    /// Directory holding snapshots
    pub snapshot_dir: PathBuf,
    /// Newest snapshots never pruned
    pub snapshot_keep_count: usize,
    /// How snapshots are deleted
    pub snapshot_backend: SnapshotBackend,
    /// `-musage` filter for metadata balance, in percent
    pub balance_musage: u8,
    /// Time limit for `DeleteTemporary`
    pub timeout_delete_temporary_secs: u64,
    /// Time limit for `CompressInactive`
    pub timeout_compress_inactive_secs: u64,
    /// Time limit for `RebalanceMetadata`
    pub timeout_rebalance_metadata_secs: u64,
    /// Time limit for `PruneSnapshots`
    pub timeout_prune_snapshots_secs: u64,
    /// Also run package-manager cache cleaning with `DeleteTemporary`
    pub clean_package_caches: bool,
    /// Cleaning commands; programs not installed are skipped
    pub package_cache_commands: Vec<Vec<String>>,
    /// Cache directories measured to count freed bytes
    pub package_cache_dirs: Vec<PathBuf>,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        let executor = ExecutorConfig::default();
        let caches = executor.package_caches;
        Self {
            enable_delete_temporary: true,
            enable_compress_inactive: true,
            enable_rebalance_metadata: true,
            enable_prune_snapshots: true,
            temp_paths: executor.temp_paths,
            temp_max_age_hours: 7 * 24,
            cold_paths: executor.cold_paths,
            cold_age_days: 30,
            compress_min_bytes: executor.compress_min_bytes,
            snapshot_dir: executor.snapshot_dir,
            snapshot_keep_count: executor.snapshot_keep,
            snapshot_backend: executor.snapshot_backend,
            balance_musage: executor.balance_musage,
            timeout_delete_temporary_secs: executor.timeouts.delete_temporary.as_secs(),
            timeout_compress_inactive_secs: executor.timeouts.compress_inactive.as_secs(),
            timeout_rebalance_metadata_secs: executor.timeouts.rebalance_metadata.as_secs(),
            timeout_prune_snapshots_secs: executor.timeouts.prune_snapshots.as_secs(),
            clean_package_caches: caches.enabled,
            package_cache_commands: caches.commands,
            package_cache_dirs: caches.dirs,
        }
    }
}

impl ActionsConfig {
    /// Mask of enabled actions; `NoOp` is always enabled
    #[must_use]
    pub fn enabled(&self) -> ActionMask {
        ActionMask::from_fn(|action| match action {
            Action::NoOp => true,
            Action::DeleteTemporary => self.enable_delete_temporary,
            Action::CompressInactive => self.enable_compress_inactive,
            Action::RebalanceMetadata => self.enable_rebalance_metadata,
            Action::PruneSnapshots => self.enable_prune_snapshots,
        })
    }
}

/// `[learning]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Persisted policy blob
    pub model_path: PathBuf,
    /// Seconds between policy saves
    pub persist_interval_secs: u64,
    /// Experience store capacity
    pub store_capacity: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Experiences required before training starts
    pub min_replay: usize,
    /// One training step every N cycles
    pub train_every_cycles: u64,
    /// Target network refresh period, in training steps
    pub target_sync_steps: u64,
    /// SGD step size
    pub learning_rate: f64,
    /// Discount factor (gamma)
    pub discount_factor: f64,
    /// Reward multiplier inside training targets
    pub reward_scale: f64,
    /// Priority exponent
    pub priority_alpha: f64,
    /// Initial importance-sampling exponent
    pub priority_beta: f64,
    /// Which experience leaves a full store
    pub eviction: EvictionPolicy,
    /// Fixed seed for reproducible runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Exploration rate schedule
    pub exploration: ExplorationSchedule,
}

impl Default for LearningConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            model_path: PathBuf::from("/var/lib/btrmind/policy.json"),
            persist_interval_secs: HOUR,
            store_capacity: engine.store.capacity,
            batch_size: engine.batch_size,
            min_replay: engine.min_replay,
            train_every_cycles: 10,
            target_sync_steps: engine.target_sync_steps,
            learning_rate: engine.learning_rate,
            discount_factor: engine.discount_factor,
            reward_scale: engine.reward_scale,
            priority_alpha: engine.store.alpha,
            priority_beta: engine.store.beta,
            eviction: engine.store.eviction,
            seed: None,
            exploration: engine.exploration,
        }
    }
}

/// `[safety]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    /// Minimum seconds between two attempts of one action
    pub cooldown_secs: u64,
    /// Consecutive failures that halt autonomous mutation
    pub failure_threshold: u32,
    /// Failures further apart than this are not consecutive
    pub failure_window_secs: u64,
    /// Subtracted from the reward of a failed action
    pub failure_penalty: f64,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            cooldown_secs: HOUR,
            failure_threshold: 3,
            failure_window_secs: DAY,
            failure_penalty: 0.0,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::invalid(field, reason)
}

fn at_most<T: PartialOrd + std::fmt::Display>(
    field: &'static str,
    value: T,
    max: T,
) -> Result<(), ConfigurationError> {
    if value > max {
        Err(invalid(field, format!("{value} exceeds the maximum of {max}")))
    } else {
        Ok(())
    }
}

fn unit_interval(field: &'static str, value: f64, open_low: bool) -> Result<(), ConfigurationError> {
    let low_ok = if open_low { value > 0.0 } else { value >= 0.0 };
    if value.is_finite() && low_ok && value <= 1.0 {
        Ok(())
    } else {
        let range = if open_low { "(0, 1]" } else { "[0, 1]" };
        Err(invalid(field, format!("{value} is outside {range}")))
    }
}

impl Config {
    /// Load and validate. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// `Unreadable` for I/O failures, `Parse` for bad TOML, `Invalid` for
    /// out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no configuration file, using defaults");
                Self::default()
            }
            Err(err) => {
                return Err(ConfigurationError::Unreadable {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    ///
    /// # Errors
    ///
    /// `Parse` when the text is not valid for this schema.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// `Parse` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigurationError> {
        toml::to_string_pretty(self).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Check every range the control loop depends on
    ///
    /// # Errors
    ///
    /// The first offending field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let m = &self.monitoring;
        if m.target_path.as_os_str().is_empty() {
            return Err(invalid("monitoring.target_path", "must not be empty"));
        }
        if m.poll_interval_secs == 0 {
            return Err(invalid("monitoring.poll_interval_secs", "must be positive"));
        }
        if m.trend_window_hours == 0 {
            return Err(invalid("monitoring.trend_window_hours", "must be positive"));
        }
        if m.history_capacity < 2 {
            return Err(invalid("monitoring.history_capacity", "must hold at least 2 snapshots"));
        }
        if m.retry_attempts == 0 {
            return Err(invalid("monitoring.retry_attempts", "must be positive"));
        }
        at_most("monitoring.poll_interval_secs", m.poll_interval_secs, MAX_POLL_INTERVAL_SECS)?;
        at_most("monitoring.trend_window_hours", m.trend_window_hours, MAX_TREND_WINDOW_HOURS)?;
        at_most("monitoring.retry_attempts", m.retry_attempts, MAX_RETRY_ATTEMPTS)?;
        at_most("monitoring.retry_base_delay_ms", m.retry_base_delay_ms, MAX_RETRY_BASE_DELAY_MS)?;
        if m.collect_file_metrics && m.file_scan_limit == 0 {
            return Err(invalid("monitoring.file_scan_limit", "must be positive"));
        }
        at_most(
            "monitoring.recent_write_window_mins",
            m.recent_write_window_mins,
            MAX_RECENT_WRITE_WINDOW_MINS,
        )?;
        if m.use_fragmentation_model && m.fragmentation_model_path.as_os_str().is_empty() {
            return Err(invalid("monitoring.fragmentation_model_path", "must not be empty"));
        }
        if m.collect_training_data && m.training_data_path.as_os_str().is_empty() {
            return Err(invalid("monitoring.training_data_path", "must not be empty"));
        }

        let t = &self.thresholds;
        let ordered = t.warning.is_finite()
            && t.warning > 0.0
            && t.warning < t.critical
            && t.critical < t.emergency
            && t.emergency < 100.0;
        if !ordered {
            return Err(invalid(
                "thresholds",
                format!(
                    "need 0 < warning < critical < emergency < 100, got {} / {} / {}",
                    t.warning, t.critical, t.emergency
                ),
            ));
        }

        let a = &self.actions;
        if a.balance_musage > 100 {
            return Err(invalid("actions.balance_musage", "must be a percentage"));
        }
        let timeouts = [
            ("actions.timeout_delete_temporary_secs", a.timeout_delete_temporary_secs),
            ("actions.timeout_compress_inactive_secs", a.timeout_compress_inactive_secs),
            ("actions.timeout_rebalance_metadata_secs", a.timeout_rebalance_metadata_secs),
            ("actions.timeout_prune_snapshots_secs", a.timeout_prune_snapshots_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(invalid(field, "must be positive"));
            }
            at_most(field, secs, MAX_ACTION_TIMEOUT_SECS)?;
        }
        at_most("actions.temp_max_age_hours", a.temp_max_age_hours, MAX_TEMP_AGE_HOURS)?;
        at_most("actions.cold_age_days", a.cold_age_days, MAX_COLD_AGE_DAYS)?;
        if a.clean_package_caches && a.package_cache_commands.iter().any(Vec::is_empty) {
            return Err(invalid("actions.package_cache_commands", "commands must not be empty"));
        }

        let l = &self.learning;
        if l.store_capacity == 0 {
            return Err(invalid("learning.store_capacity", "must be positive"));
        }
        if l.batch_size == 0 {
            return Err(invalid("learning.batch_size", "must be positive"));
        }
        if l.batch_size > l.store_capacity {
            return Err(invalid("learning.batch_size", "exceeds store_capacity"));
        }
        let min_replay = l.min_replay.max(l.batch_size);
        if min_replay > l.store_capacity {
            return Err(invalid(
                "learning.min_replay",
                format!("{min_replay} exceeds store_capacity {}; training would never start", l.store_capacity),
            ));
        }
        if l.train_every_cycles == 0 {
            return Err(invalid("learning.train_every_cycles", "must be positive"));
        }
        if l.target_sync_steps == 0 {
            return Err(invalid("learning.target_sync_steps", "must be positive"));
        }
        if l.persist_interval_secs == 0 {
            return Err(invalid("learning.persist_interval_secs", "must be positive"));
        }
        at_most("learning.persist_interval_secs", l.persist_interval_secs, MAX_PERIOD_SECS)?;
        unit_interval("learning.learning_rate", l.learning_rate, true)?;
        unit_interval("learning.discount_factor", l.discount_factor, false)?;
        unit_interval("learning.priority_alpha", l.priority_alpha, false)?;
        unit_interval("learning.priority_beta", l.priority_beta, false)?;
        if !(l.reward_scale.is_finite() && l.reward_scale > 0.0) {
            return Err(invalid("learning.reward_scale", "must be positive"));
        }

        let exploration = &l.exploration;
        unit_interval("learning.exploration.start", exploration.start(), false)?;
        let floor = exploration.floor();
        if !(floor > 0.0 && floor <= exploration.start()) {
            return Err(invalid(
                "learning.exploration.floor",
                format!("{floor} must be in (0, start]"),
            ));
        }
        match *exploration {
            ExplorationSchedule::Exponential { decay, .. } => {
                unit_interval("learning.exploration.decay", decay, true)?;
            }
            ExplorationSchedule::Linear { steps, .. } => {
                if steps == 0 {
                    return Err(invalid("learning.exploration.steps", "must be positive"));
                }
            }
        }

        let s = &self.safety;
        if s.failure_threshold == 0 {
            return Err(invalid("safety.failure_threshold", "must be positive"));
        }
        if s.failure_window_secs == 0 {
            return Err(invalid("safety.failure_window_secs", "must be positive"));
        }
        at_most("safety.failure_window_secs", s.failure_window_secs, MAX_PERIOD_SECS)?;
        at_most("safety.cooldown_secs", s.cooldown_secs, MAX_PERIOD_SECS)?;
        if !(s.failure_penalty.is_finite() && s.failure_penalty >= 0.0) {
            return Err(invalid("safety.failure_penalty", "must be non-negative"));
        }
        Ok(())
    }

    /// Cycle period
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.poll_interval_secs)
    }

    /// Policy save period
    #[must_use]
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.learning.persist_interval_secs)
    }

    /// Telemetry sampler settings
    #[must_use]
    pub fn sampler(&self) -> SamplerConfig {
        let m = &self.monitoring;
        SamplerConfig {
            max_attempts: m.retry_attempts,
            base_delay: Duration::from_millis(m.retry_base_delay_ms),
            history_capacity: m.history_capacity,
            trend_window: Duration::from_secs(m.trend_window_hours.saturating_mul(HOUR)),
            ..SamplerConfig::default()
        }
    }

    /// Executor settings
    #[must_use]
    pub fn executor(&self) -> ExecutorConfig {
        let a = &self.actions;
        ExecutorConfig {
            target_path: self.monitoring.target_path.clone(),
            enabled: a.enabled(),
            temp_paths: a.temp_paths.clone(),
            temp_max_age: Duration::from_secs(a.temp_max_age_hours.saturating_mul(HOUR)),
            package_caches: PackageCacheConfig {
                enabled: a.clean_package_caches,
                commands: a.package_cache_commands.clone(),
                dirs: a.package_cache_dirs.clone(),
            },
            cold_paths: a.cold_paths.clone(),
            cold_age: Duration::from_secs(a.cold_age_days.saturating_mul(DAY)),
            compress_min_bytes: a.compress_min_bytes,
            snapshot_dir: a.snapshot_dir.clone(),
            snapshot_keep: a.snapshot_keep_count,
            snapshot_backend: a.snapshot_backend,
            balance_musage: a.balance_musage,
            btrfs_binary: self.monitoring.btrfs_binary.clone(),
            timeouts: ActionTimeouts {
                delete_temporary: Duration::from_secs(a.timeout_delete_temporary_secs),
                compress_inactive: Duration::from_secs(a.timeout_compress_inactive_secs),
                rebalance_metadata: Duration::from_secs(a.timeout_rebalance_metadata_secs),
                prune_snapshots: Duration::from_secs(a.timeout_prune_snapshots_secs),
            },
        }
    }

    /// Statistics provider for the monitored volume
    ///
    /// # Errors
    ///
    /// `Invalid` when the fragmentation model is required but unusable.
    pub fn stat_provider(&self) -> Result<CommandStatProvider, ConfigurationError> {
        let m = &self.monitoring;
        let mut provider =
            CommandStatProvider::new(&m.target_path).with_btrfs_binary(m.btrfs_binary.clone());
        if m.use_fragmentation_model {
            let estimator =
                FragmentationEstimator::load(&m.fragmentation_model_path, m.fallback_to_heuristic)
                    .map_err(|e| invalid("monitoring.fragmentation_model_path", e.to_string()))?;
            provider = provider.with_fragmentation(estimator);
        }
        if m.collect_file_metrics || m.collect_training_data {
            provider = provider.with_file_scan(FileScanConfig {
                recent_window: Duration::from_secs(m.recent_write_window_mins.saturating_mul(MINUTE)),
                max_entries: m.file_scan_limit.max(1),
            });
        }
        Ok(provider)
    }

    /// CSV file receiving training samples, when collection is on
    #[must_use]
    pub fn training_data_path(&self) -> Option<&Path> {
        self.monitoring
            .collect_training_data
            .then_some(self.monitoring.training_data_path.as_path())
    }

    /// Decision engine settings
    #[must_use]
    pub fn engine(&self) -> EngineConfig {
        let l = &self.learning;
        EngineConfig {
            batch_size: l.batch_size,
            min_replay: l.min_replay.max(l.batch_size),
            target_sync_steps: l.target_sync_steps,
            learning_rate: l.learning_rate,
            discount_factor: l.discount_factor,
            reward_scale: l.reward_scale,
            exploration: l.exploration,
            store: StoreConfig {
                capacity: l.store_capacity,
                alpha: l.priority_alpha,
                beta: l.priority_beta,
                eviction: l.eviction,
                ..StoreConfig::default()
            },
            seed: l.seed,
            ..EngineConfig::default()
        }
    }

    /// Safety guard settings
    #[must_use]
    pub fn safety(&self) -> SafetyConfig {
        SafetyConfig {
            cooldown: Duration::from_secs(self.safety.cooldown_secs),
            failure_threshold: self.safety.failure_threshold,
            failure_window: Duration::from_secs(self.safety.failure_window_secs),
        }
    }
}
