//! Action Executor
//!
//! Every [`Action`] maps to exactly one handler through an exhaustive
//! match. A handler first builds a [`Plan`] (checking preconditions without
//! mutating anything), then runs it step by step, calling
//! [`ExecutionContext::checkpoint`] between atomic sub-steps. Reversible
//! steps go into the context's [`Journal`]; on timeout or failure the
//! executor replays the journal backwards before reporting.

use async_trait::async_trait;
use btrmind_core::{Action, ActionMask, ActionResult, ExecutionError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::handlers::{Compressor, PackageCacheConfig, Rebalancer, SnapshotPruner, TempCleaner};
use crate::journal::Journal;

/// How snapshots under `snapshot_dir` are removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    /// Plain directories, removed recursively
    Directory,
    /// btrfs subvolumes, removed with `btrfs subvolume delete`
    #[default]
    Btrfs,
}

/// Per-action deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTimeouts {
    /// DeleteTemporary deadline
    pub delete_temporary: Duration,
    /// CompressInactive deadline
    pub compress_inactive: Duration,
    /// RebalanceMetadata deadline
    pub rebalance_metadata: Duration,
    /// PruneSnapshots deadline
    pub prune_snapshots: Duration,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            delete_temporary: Duration::from_secs(300),
            compress_inactive: Duration::from_secs(900),
            rebalance_metadata: Duration::from_secs(3600),
            prune_snapshots: Duration::from_secs(600),
        }
    }
}

impl ActionTimeouts {
    /// Deadline for `action`; `NoOp` has none
    #[must_use]
    pub fn for_action(&self, action: Action) -> Duration {
        match action {
            Action::NoOp => Duration::ZERO,
            Action::DeleteTemporary => self.delete_temporary,
            Action::CompressInactive => self.compress_inactive,
            Action::RebalanceMetadata => self.rebalance_metadata,
            Action::PruneSnapshots => self.prune_snapshots,
        }
    }
}

/// Execution parameters. Actions carry none of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Mount point of the monitored filesystem
    pub target_path: PathBuf,
    /// Actions allowed to run
    pub enabled: ActionMask,
    /// Temporary directories; `*` components are expanded
    pub temp_paths: Vec<PathBuf>,
    /// Minimum idle age of a temporary file
    pub temp_max_age: Duration,
    /// Package-manager cache cleaning after DeleteTemporary
    #[serde(default)]
    pub package_caches: PackageCacheConfig,
    /// Directories searched for cold files
    pub cold_paths: Vec<PathBuf>,
    /// Minimum age since modification of a cold file
    pub cold_age: Duration,
    /// Files smaller than this are not compressed
    pub compress_min_bytes: u64,
    /// Directory holding snapshots
    pub snapshot_dir: PathBuf,
    /// Newest snapshots always kept
    pub snapshot_keep: usize,
    /// Snapshot removal backend
    pub snapshot_backend: SnapshotBackend,
    /// `-musage` filter for metadata balance
    pub balance_musage: u8,
    /// `btrfs` executable name or path
    pub btrfs_binary: String,
    /// Per-action deadlines
    pub timeouts: ActionTimeouts,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            target_path: PathBuf::from("/"),
            enabled: ActionMask::all(),
            temp_paths: ["/tmp", "/var/tmp", "/var/cache", "/home/*/.cache"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            temp_max_age: Duration::from_secs(7 * 24 * 3600),
            package_caches: PackageCacheConfig::default(),
            cold_paths: vec![PathBuf::from("/var/log")],
            cold_age: Duration::from_secs(30 * 24 * 3600),
            compress_min_bytes: 1024 * 1024,
            snapshot_dir: PathBuf::from("/.snapshots"),
            snapshot_keep: 10,
            snapshot_backend: SnapshotBackend::Btrfs,
            balance_musage: 50,
            btrfs_binary: "btrfs".to_string(),
            timeouts: ActionTimeouts::default(),
        }
    }
}

/// A file or object an action will touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    /// Item location
    pub path: PathBuf,
    /// Search root the item was found under
    pub root: PathBuf,
    /// Size in bytes
    pub bytes: u64,
}

/// What an action would do, computed without mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Items to process
    pub items: Vec<PlanItem>,
    /// Human-readable description
    pub detail: String,
}

impl Plan {
    /// Plan over `items`
    #[must_use]
    pub fn new(items: Vec<PlanItem>, detail: impl Into<String>) -> Self {
        Self {
            items,
            detail: detail.into(),
        }
    }

    /// Sum of item sizes
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.bytes).sum()
    }

    /// One-line summary
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} ({} items, ~{} bytes)",
            self.detail,
            self.items.len(),
            self.estimated_bytes()
        )
    }
}

/// Why a running step stopped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Checkpoint reached after the deadline
    #[error("deadline exceeded")]
    Deadline,
    /// Permission missing on a path
    #[error("permission denied on {}", .0.display())]
    PermissionDenied(PathBuf),
    /// Any other failure
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Classify an I/O error on `path`
    #[must_use]
    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path.to_path_buf())
        } else {
            Self::Failed(format!("{}: {err}", path.display()))
        }
    }
}

/// Deadline used when `started + timeout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// State of one running action
#[derive(Debug)]
pub struct ExecutionContext {
    action: Action,
    started: Instant,
    deadline: Instant,
    journal: Journal,
    reclaimed: u64,
    irreversible_steps: u32,
}

impl ExecutionContext {
    /// Context for `action` that must finish within `timeout`
    #[must_use]
    pub fn new(action: Action, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            action,
            started,
            deadline: started
                .checked_add(timeout)
                .unwrap_or_else(|| started + FAR_FUTURE),
            journal: Journal::new(),
            reclaimed: 0,
            irreversible_steps: 0,
        }
    }

    /// Cancellation point between atomic sub-steps
    pub fn checkpoint(&self) -> Result<(), StepError> {
        if Instant::now() >= self.deadline {
            Err(StepError::Deadline)
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time since the action started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Action being executed
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Journal of reversible steps
    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Record an irreversible step that freed `bytes`
    pub fn commit_irreversible(&mut self, bytes: u64) {
        self.irreversible_steps += 1;
        self.reclaimed += bytes;
    }

    /// Bytes freed by irreversible steps
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed
    }
}

/// One handler per mutating action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Action this handler performs
    fn action(&self) -> Action;

    /// Check preconditions and list the work, without mutating anything
    async fn plan(&self) -> Result<Plan, ExecutionError>;

    /// Perform the plan, checkpointing between sub-steps
    async fn run(&self, plan: Plan, ctx: &mut ExecutionContext) -> Result<(), StepError>;
}

/// Performs actions against the filesystem
pub struct Executor {
    config: ExecutorConfig,
    delete_temporary: TempCleaner,
    compress_inactive: Compressor,
    rebalance_metadata: Rebalancer,
    prune_snapshots: SnapshotPruner,
}

impl Executor {
    /// Build the handler table from `config`
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            delete_temporary: TempCleaner::new(config.temp_paths.clone(), config.temp_max_age)
                .with_package_caches(config.package_caches.clone()),
            compress_inactive: Compressor::new(
                config.cold_paths.clone(),
                config.cold_age,
                config.compress_min_bytes,
            ),
            rebalance_metadata: Rebalancer::new(
                config.target_path.clone(),
                config.balance_musage,
                config.btrfs_binary.clone(),
            ),
            prune_snapshots: SnapshotPruner::new(
                config.snapshot_dir.clone(),
                config.snapshot_keep,
                config.snapshot_backend,
                config.btrfs_binary.clone(),
            ),
            config,
        }
    }

    /// Executor configuration
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Actions enabled by configuration
    #[must_use]
    pub fn enabled(&self) -> ActionMask {
        self.config.enabled
    }

    fn handler(&self, action: Action) -> Option<&dyn ActionHandler> {
        match action {
            Action::NoOp => None,
            Action::DeleteTemporary => Some(&self.delete_temporary),
            Action::CompressInactive => Some(&self.compress_inactive),
            Action::RebalanceMetadata => Some(&self.rebalance_metadata),
            Action::PruneSnapshots => Some(&self.prune_snapshots),
        }
    }

    /// Plan an action without running it
    pub async fn plan(&self, action: Action) -> Result<Option<Plan>, ExecutionError> {
        match self.handler(action) {
            Some(handler) => handler.plan().await.map(Some),
            None => Ok(None),
        }
    }

    /// Validate and perform `action`. With `dry_run` nothing is mutated.
    pub async fn execute(&self, action: Action, dry_run: bool) -> Result<ActionResult, ExecutionError> {
        let started = Instant::now();
        let Some(handler) = self.handler(action) else {
            return Ok(ActionResult::noop(started.elapsed()));
        };
        if !self.config.enabled.allows(action) {
            return Err(ExecutionError::Disabled(action));
        }

        let plan = handler.plan().await?;
        if dry_run {
            info!(%action, plan = %plan.summary(), "Dry run; nothing changed");
            return Ok(ActionResult::succeeded(action, 0, started.elapsed())
                .dry()
                .with_message(plan.summary()));
        }

        let summary = plan.summary();
        let mut ctx = ExecutionContext::new(action, self.config.timeouts.for_action(action));
        match handler.run(plan, &mut ctx).await {
            Ok(()) => {
                let reversible: u64 = ctx
                    .journal
                    .commit()
                    .iter()
                    .map(crate::JournalEntry::bytes_freed)
                    .sum();
                let bytes = ctx.reclaimed + reversible;
                info!(%action, bytes_reclaimed = bytes, elapsed_ms = ctx.elapsed().as_millis(), "Action completed");
                Ok(ActionResult::succeeded(action, bytes, ctx.elapsed()).with_message(summary))
            }
            Err(step) => Err(Self::recover(step, ctx).await),
        }
    }

    /// Roll back what can be undone and classify the failure
    async fn recover(step: StepError, mut ctx: ExecutionContext) -> ExecutionError {
        let action = ctx.action;
        let rollback_ok = if ctx.journal.is_empty() {
            true
        } else {
            let mut journal = std::mem::take(&mut ctx.journal);
            tokio::task::spawn_blocking(move || journal.rollback())
                .await
                .unwrap_or(false)
        };
        let restored = rollback_ok && ctx.irreversible_steps == 0;
        let bytes_reclaimed = ctx.reclaimed;

        let error = match step {
            StepError::Deadline => ExecutionError::Timeout {
                action,
                elapsed: ctx.elapsed(),
                rolled_back: restored,
                bytes_reclaimed,
            },
            StepError::PermissionDenied(path) if restored => ExecutionError::PermissionDenied {
                action,
                path: path.display().to_string(),
            },
            StepError::PermissionDenied(path) => ExecutionError::PartialFailure {
                action,
                bytes_reclaimed,
                reason: format!("permission denied on {}", path.display()),
            },
            StepError::Failed(reason) if restored => ExecutionError::Io {
                action,
                reason,
                rolled_back: true,
            },
            StepError::Failed(reason) if ctx.irreversible_steps == 0 => ExecutionError::Io {
                action,
                reason,
                rolled_back: false,
            },
            StepError::Failed(reason) => ExecutionError::PartialFailure {
                action,
                bytes_reclaimed,
                reason,
            },
        };
        warn!(%action, kind = ?error.kind(), error = %error, "Action failed");
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrmind_core::ExecutionErrorKind;

    fn config(dir: &std::path::Path) -> ExecutorConfig {
        ExecutorConfig {
            target_path: dir.to_path_buf(),
            temp_paths: vec![dir.join("tmp")],
            temp_max_age: Duration::ZERO,
            cold_paths: vec![dir.join("cold")],
            cold_age: Duration::ZERO,
            compress_min_bytes: 0,
            snapshot_dir: dir.join("snapshots"),
            snapshot_keep: 1,
            snapshot_backend: SnapshotBackend::Directory,
            btrfs_binary: "btrmind-test-missing-btrfs".to_string(),
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_noop_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp/keep"), b"data").unwrap();
        let executor = Executor::new(config(dir.path()));
        let result = executor.execute(Action::NoOp, false).await.unwrap();
        assert!(result.success);
        assert_eq!(result.bytes_reclaimed, 0);
        assert!(dir.path().join("tmp/keep").exists());
    }

    #[tokio::test]
    async fn test_disabled_action() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.enabled = ActionMask::all().without(Action::DeleteTemporary);
        let executor = Executor::new(config);
        let err = executor.execute(Action::DeleteTemporary, false).await.unwrap_err();
        assert_eq!(err.kind(), ExecutionErrorKind::Disabled);
        assert!(!err.kind().counts_as_failure());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp/old"), b"0123456789").unwrap();
        let executor = Executor::new(config(dir.path()));
        let result = executor.execute(Action::DeleteTemporary, true).await.unwrap();
        assert!(result.success);
        assert!(result.dry_run);
        assert!(result.message.contains("1 items"));
        assert!(dir.path().join("tmp/old").exists());
    }

    #[tokio::test]
    async fn test_missing_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Executor::new(config(dir.path()));
        let err = executor.execute(Action::PruneSnapshots, false).await.unwrap_err();
        assert_eq!(err.kind(), ExecutionErrorKind::Precondition);
        let err = executor.execute(Action::RebalanceMetadata, false).await.unwrap_err();
        assert_eq!(err.kind(), ExecutionErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let ctx = ExecutionContext::new(Action::DeleteTemporary, Duration::MAX);
        assert!(ctx.checkpoint().is_ok());
        assert!(ctx.remaining() > Duration::from_secs(365 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_zero_deadline_times_out_with_rollback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp/old"), b"x").unwrap();
        let mut config = config(dir.path());
        config.timeouts.delete_temporary = Duration::ZERO;
        let executor = Executor::new(config);
        let err = executor.execute(Action::DeleteTemporary, false).await.unwrap_err();
        match err {
            ExecutionError::Timeout { rolled_back, bytes_reclaimed, .. } => {
                assert!(rolled_back);
                assert_eq!(bytes_reclaimed, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dir.path().join("tmp/old").exists());
    }
}
