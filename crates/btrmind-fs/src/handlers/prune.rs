//! PruneSnapshots: keep the newest N snapshots, delete the rest

use async_trait::async_trait;
use btrmind_core::{Action, ExecutionError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::process::Command;
use tracing::debug;

use crate::executor::{ActionHandler, ExecutionContext, Plan, PlanItem, SnapshotBackend, StepError};
use crate::scan;

/// Deletes all but the newest `keep` entries of the snapshot directory.
/// Not reversible.
#[derive(Debug, Clone)]
pub struct SnapshotPruner {
    dir: PathBuf,
    keep: usize,
    backend: SnapshotBackend,
    binary: String,
}

impl SnapshotPruner {
    /// Handler over `dir`
    #[must_use]
    pub fn new(dir: PathBuf, keep: usize, backend: SnapshotBackend, binary: String) -> Self {
        Self {
            dir,
            keep,
            backend,
            binary,
        }
    }

    /// Entries ordered newest first
    fn list(dir: &Path, backend: SnapshotBackend) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)?.flatten() {
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.file_type().is_symlink() || (backend == SnapshotBackend::Btrfs && !meta.is_dir()) {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(entries)
    }

    async fn remove(&self, item: &PlanItem, ctx: &ExecutionContext) -> Result<(), StepError> {
        match self.backend {
            SnapshotBackend::Directory => {
                let path = item.path.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    }
                })
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
                outcome.map_err(|e| StepError::io(&item.path, &e))
            }
            SnapshotBackend::Btrfs => {
                let delete = Command::new(&self.binary)
                    .args(["subvolume", "delete"])
                    .arg(&item.path)
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output();
                match tokio::time::timeout(ctx.remaining(), delete).await {
                    Ok(Ok(output)) if output.status.success() => Ok(()),
                    Ok(Ok(output)) => Err(StepError::Failed(format!(
                        "subvolume delete {}: {}",
                        item.path.display(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ))),
                    Ok(Err(err)) => Err(StepError::io(&item.path, &err)),
                    Err(_) => Err(StepError::Deadline),
                }
            }
        }
    }
}

#[async_trait]
impl ActionHandler for SnapshotPruner {
    fn action(&self) -> Action {
        Action::PruneSnapshots
    }

    async fn plan(&self) -> Result<Plan, ExecutionError> {
        if self.backend == SnapshotBackend::Btrfs {
            which::which(&self.binary).map_err(|e| ExecutionError::Precondition {
                action: self.action(),
                reason: format!("{} not found: {e}", self.binary),
            })?;
        }
        if !self.dir.is_dir() {
            return Err(ExecutionError::Precondition {
                action: self.action(),
                reason: format!("snapshot directory {} does not exist", self.dir.display()),
            });
        }

        let dir = self.dir.clone();
        let backend = self.backend;
        let keep = self.keep;
        let listed = tokio::task::spawn_blocking(move || {
            Self::list(&dir, backend).map(|entries| {
                entries
                    .into_iter()
                    .skip(keep)
                    .map(|(path, _)| PlanItem {
                        // btrfs frees extents asynchronously; size is unknown up front
                        bytes: match backend {
                            SnapshotBackend::Directory => scan::tree_size(&path),
                            SnapshotBackend::Btrfs => 0,
                        },
                        root: dir.clone(),
                        path,
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| ExecutionError::Io {
            action: Action::PruneSnapshots,
            reason: e.to_string(),
            rolled_back: true,
        })?;

        let items = listed.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ExecutionError::PermissionDenied {
                action: Action::PruneSnapshots,
                path: self.dir.display().to_string(),
            },
            _ => ExecutionError::Precondition {
                action: Action::PruneSnapshots,
                reason: e.to_string(),
            },
        })?;
        Ok(Plan::new(
            items,
            format!("prune snapshots in {} keeping newest {}", self.dir.display(), self.keep),
        ))
    }

    async fn run(&self, plan: Plan, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        for item in &plan.items {
            ctx.checkpoint()?;
            self.remove(item, ctx).await?;
            ctx.commit_irreversible(item.bytes);
            debug!(snapshot = %item.path.display(), "Snapshot deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Executor, ExecutorConfig};
    use std::time::Duration;

    fn make_snapshots(dir: &Path, count: u64) {
        for i in 0..count {
            let snap = dir.join(format!("snap-{i}"));
            std::fs::create_dir_all(&snap).unwrap();
            std::fs::write(snap.join("data"), vec![0u8; 10]).unwrap();
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i * 60);
            std::fs::File::open(&snap).unwrap().set_modified(mtime).unwrap();
        }
    }

    #[tokio::test]
    async fn test_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        make_snapshots(dir.path(), 5);
        let executor = Executor::new(ExecutorConfig {
            snapshot_dir: dir.path().to_path_buf(),
            snapshot_keep: 2,
            snapshot_backend: SnapshotBackend::Directory,
            ..ExecutorConfig::default()
        });
        let result = executor.execute(Action::PruneSnapshots, false).await.unwrap();
        assert_eq!(result.bytes_reclaimed, 30);
        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["snap-3", "snap-4"]);
    }

    #[tokio::test]
    async fn test_nothing_to_prune() {
        let dir = tempfile::tempdir().unwrap();
        make_snapshots(dir.path(), 2);
        let pruner = SnapshotPruner::new(
            dir.path().to_path_buf(),
            10,
            SnapshotBackend::Directory,
            "btrfs".to_string(),
        );
        assert!(pruner.plan().await.unwrap().items.is_empty());
    }
}
