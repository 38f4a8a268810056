//! DeleteTemporary: stage old temporary files, then purge them

use async_trait::async_trait;
use btrmind_core::{Action, ExecutionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{existing_roots, scan_roots};
use crate::executor::{ActionHandler, ExecutionContext, Plan, PlanItem, StepError};
use crate::journal::JournalEntry;
use crate::scan::{self, STAGING_PREFIX};

/// Package-manager cache cleaning, run after temporary files are purged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCacheConfig {
    /// Run the commands at all
    pub enabled: bool,
    /// Commands as argv vectors; missing programs are skipped
    pub commands: Vec<Vec<String>>,
    /// Cache directories measured before and after to count freed bytes
    pub dirs: Vec<PathBuf>,
}

impl Default for PackageCacheConfig {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(ToString::to_string).collect();
        Self {
            enabled: false,
            commands: vec![
                argv(&["apt-get", "clean"]),
                argv(&["dnf", "clean", "all"]),
                argv(&["paccache", "-r"]),
                argv(&["eclean", "distfiles"]),
            ],
            dirs: [
                "/var/cache/apt/archives",
                "/var/cache/dnf",
                "/var/cache/pacman/pkg",
                "/var/cache/distfiles",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

/// Removes files under the temporary directories that have been idle for `max_age`.
///
/// Files are first moved into a staging directory inside their root
/// (reversible), and only purged once every file is staged. Staging
/// directories found at plan time belong to an interrupted run and are
/// purged as a whole.
#[derive(Debug, Clone)]
pub struct TempCleaner {
    patterns: Vec<PathBuf>,
    max_age: Duration,
    package_caches: PackageCacheConfig,
}

impl TempCleaner {
    /// Handler over `patterns`
    #[must_use]
    pub fn new(patterns: Vec<PathBuf>, max_age: Duration) -> Self {
        Self {
            patterns,
            max_age,
            package_caches: PackageCacheConfig::default(),
        }
    }

    /// Also clean package-manager caches when `config.enabled`
    #[must_use]
    pub fn with_package_caches(mut self, config: PackageCacheConfig) -> Self {
        self.package_caches = config;
        self
    }

    fn is_stale_staging(item: &PlanItem) -> bool {
        item.path.parent() == Some(item.root.as_path())
            && item
                .path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(STAGING_PREFIX))
    }

    async fn stale_staging(roots: Vec<PathBuf>) -> Vec<PlanItem> {
        tokio::task::spawn_blocking(move || {
            roots
                .iter()
                .flat_map(|root| {
                    scan::staging_dirs(root).into_iter().map(|path| PlanItem {
                        bytes: scan::tree_size(&path),
                        root: root.clone(),
                        path,
                    })
                })
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    async fn remove_stale(items: &[PlanItem], ctx: &mut ExecutionContext) -> Result<(), StepError> {
        for item in items {
            ctx.checkpoint()?;
            match tokio::fs::remove_dir_all(&item.path).await {
                Ok(()) => {
                    info!(path = %item.path.display(), bytes = item.bytes, "Removed leftover staging directory");
                    ctx.commit_irreversible(item.bytes);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StepError::io(&item.path, &err)),
            }
        }
        Ok(())
    }

    async fn cache_size(dirs: &[PathBuf]) -> u64 {
        let dirs = dirs.to_vec();
        tokio::task::spawn_blocking(move || dirs.iter().map(|d| scan::tree_size(d)).sum())
            .await
            .unwrap_or(0)
    }

    async fn run_cache_command(argv: &[String], ctx: &ExecutionContext) {
        let Some((program, args)) = argv.split_first() else {
            return;
        };
        let Ok(resolved) = which::which(program) else {
            debug!(program = %program, "Package manager not installed");
            return;
        };
        let output = Command::new(&resolved)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(ctx.remaining(), output).await {
            Ok(Ok(output)) if output.status.success() => debug!(program = %program, "Package cache cleaned"),
            Ok(Ok(output)) => warn!(
                program = %program,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Package cache cleaning failed"
            ),
            Ok(Err(err)) => warn!(program = %program, error = %err, "Package cache cleaning failed"),
            Err(_) => warn!(program = %program, "Package cache cleaning timed out"),
        }
    }

    /// Failures here only warn: the temporary files are already gone
    async fn clean_package_caches(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        if !self.package_caches.enabled {
            return Ok(());
        }
        let before = Self::cache_size(&self.package_caches.dirs).await;
        let mut ran = false;
        for argv in &self.package_caches.commands {
            ctx.checkpoint()?;
            Self::run_cache_command(argv, ctx).await;
            ran = true;
        }
        if ran {
            let after = Self::cache_size(&self.package_caches.dirs).await;
            let freed = before.saturating_sub(after);
            debug!(freed, "Package caches cleaned");
            ctx.commit_irreversible(freed);
        }
        Ok(())
    }

    async fn purge(ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let mut staged = ctx.journal_mut().commit().into_iter();
        while let Some(entry) = staged.next() {
            if let Err(err) = ctx.checkpoint() {
                // Unpurged files stay restorable
                ctx.journal_mut().record(entry);
                for rest in staged {
                    ctx.journal_mut().record(rest);
                }
                return Err(err);
            }
            let JournalEntry::Staged { staged: path, bytes, .. } = &entry else {
                continue;
            };
            match tokio::fs::remove_file(path).await {
                Ok(()) => ctx.commit_irreversible(*bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let failure = StepError::io(path, &err);
                    ctx.journal_mut().record(entry);
                    for rest in staged {
                        ctx.journal_mut().record(rest);
                    }
                    return Err(failure);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for TempCleaner {
    fn action(&self) -> Action {
        Action::DeleteTemporary
    }

    async fn plan(&self) -> Result<Plan, ExecutionError> {
        let roots = existing_roots(self.action(), &self.patterns)?;
        let mut items = scan_roots(self.action(), roots.clone(), self.max_age, true).await?;
        let stale = Self::stale_staging(roots.clone()).await;
        if !stale.is_empty() {
            debug!(count = stale.len(), "Leftover staging directories found");
        }
        items.extend(stale);
        let caches = if self.package_caches.enabled { " and package caches" } else { "" };
        Ok(Plan::new(
            items,
            format!(
                "delete temporary files idle > {}h in {} dirs{caches}",
                self.max_age.as_secs() / 3600,
                roots.len()
            ),
        ))
    }

    async fn run(&self, plan: Plan, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let mut staging_dirs = BTreeSet::new();
        let (stale, files): (Vec<PlanItem>, Vec<PlanItem>) =
            plan.items.into_iter().partition(Self::is_stale_staging);

        for (index, item) in files.iter().enumerate() {
            ctx.checkpoint()?;
            let staging = item.root.join(format!("{STAGING_PREFIX}-{stamp}"));
            if staging_dirs.insert(staging.clone()) {
                tokio::fs::create_dir_all(&staging)
                    .await
                    .map_err(|e| StepError::io(&staging, &e))?;
            }
            let name = item
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let destination = staging.join(format!("{index}-{name}"));
            match tokio::fs::rename(&item.path, &destination).await {
                Ok(()) => ctx.journal_mut().record(JournalEntry::Staged {
                    original: item.path.clone(),
                    staged: destination,
                    bytes: item.bytes,
                }),
                // Removed by someone else since planning
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StepError::io(&item.path, &err)),
            }
        }
        debug!(staged = ctx.journal_mut().entries().len(), "Temporary files staged");

        Self::purge(ctx).await?;
        for dir in staging_dirs {
            if let Err(err) = tokio::fs::remove_dir(&dir).await {
                warn!(path = %dir.display(), error = %err, "Staging directory not removed");
            }
        }
        Self::remove_stale(&stale, ctx).await?;
        self.clean_package_caches(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Executor, ExecutorConfig};

    #[tokio::test]
    async fn test_deletes_old_files_and_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(tmp.join("nested")).unwrap();
        std::fs::write(tmp.join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(tmp.join("nested/b"), vec![0u8; 50]).unwrap();

        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![tmp.clone()],
            temp_max_age: Duration::ZERO,
            ..ExecutorConfig::default()
        });
        let result = executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert!(result.success);
        assert_eq!(result.bytes_reclaimed, 150);
        assert!(!tmp.join("a").exists());
        assert!(!tmp.join("nested/b").exists());
        let leftovers: Vec<_> = std::fs::read_dir(&tmp)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("new"), b"x").unwrap();
        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![dir.path().to_path_buf()],
            temp_max_age: Duration::from_secs(3600),
            ..ExecutorConfig::default()
        });
        let result = executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert_eq!(result.bytes_reclaimed, 0);
        assert!(dir.path().join("new").exists());
    }

    #[tokio::test]
    async fn test_leftover_staging_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let leftover = tmp.join(format!("{STAGING_PREFIX}-20240101000000000"));
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("0-a"), vec![0u8; 70]).unwrap();
        std::fs::write(leftover.join("1-b"), vec![0u8; 30]).unwrap();
        std::fs::write(tmp.join("fresh"), b"x").unwrap();

        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![tmp.clone()],
            temp_max_age: Duration::from_secs(3600),
            ..ExecutorConfig::default()
        });
        let plan = executor.plan(Action::DeleteTemporary).await.unwrap().unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.estimated_bytes(), 100);

        let result = executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert!(result.success);
        assert_eq!(result.bytes_reclaimed, 100);
        assert!(!leftover.exists());
        assert!(tmp.join("fresh").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_package_cache_commands_count_freed_bytes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("pkg.deb"), vec![0u8; 500]).unwrap();
        let script = dir.path().join("fake-clean");
        std::fs::write(&script, format!("#!/bin/sh
rm -f {}/*
", cache.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![tmp],
            temp_max_age: Duration::ZERO,
            package_caches: PackageCacheConfig {
                enabled: true,
                commands: vec![
                    vec![script.display().to_string()],
                    vec!["btrmind-test-missing-package-manager".to_string()],
                ],
                dirs: vec![cache.clone()],
            },
            ..ExecutorConfig::default()
        });
        let result = executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert!(result.success);
        assert_eq!(result.bytes_reclaimed, 500);
        assert!(!cache.join("pkg.deb").exists());
    }

    #[tokio::test]
    async fn test_package_caches_are_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("pkg.rpm"), vec![0u8; 10]).unwrap();
        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![dir.path().join("tmp-missing"), cache.clone()],
            temp_max_age: Duration::from_secs(3600),
            package_caches: PackageCacheConfig {
                enabled: false,
                commands: vec![vec!["rm".to_string(), "-rf".to_string(), cache.display().to_string()]],
                dirs: vec![cache.clone()],
            },
            ..ExecutorConfig::default()
        });
        executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert!(cache.join("pkg.rpm").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("precious"), b"keep").unwrap();
        std::os::unix::fs::symlink(&outside, tmp.join("link")).unwrap();

        let executor = Executor::new(ExecutorConfig {
            temp_paths: vec![tmp],
            temp_max_age: Duration::ZERO,
            ..ExecutorConfig::default()
        });
        executor.execute(Action::DeleteTemporary, false).await.unwrap();
        assert!(outside.join("precious").exists());
    }
}
