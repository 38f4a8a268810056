//! Candidate discovery shared by the file-based handlers

use btrmind_core::FileMetrics;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::executor::PlanItem;

/// Prefix of staging directories; never treated as candidates
pub(crate) const STAGING_PREFIX: &str = ".btrmind-staging";

/// Expand `*` path components (e.g. `/home/*/.cache`) into existing directories
pub(crate) fn expand(pattern: &Path) -> Vec<PathBuf> {
    let mut current = vec![PathBuf::new()];
    for component in pattern.components() {
        let mut next = Vec::new();
        match component {
            Component::Normal(part) if part == "*" => {
                for base in &current {
                    let Ok(entries) = std::fs::read_dir(base) else {
                        continue;
                    };
                    for entry in entries.flatten() {
                        if entry.file_type().is_ok_and(|t| t.is_dir()) {
                            next.push(entry.path());
                        }
                    }
                }
                next.sort();
            }
            other => {
                next = current.iter().map(|base| base.join(other)).collect();
            }
        }
        current = next;
    }
    current.retain(|path| path.is_dir());
    current
}

/// Regular files under `root` whose last use is older than `min_age`.
///
/// Symlinks are never followed; staging directories are skipped. `last
/// use` is the later of access and modification time, or modification time
/// alone when `by_access` is false.
pub(crate) fn old_files(
    root: &Path,
    min_age: Duration,
    by_access: bool,
    now: SystemTime,
) -> io::Result<Vec<PlanItem>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if dir == root => return Err(err),
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                let modified = meta.modified().unwrap_or(now);
                let last_use = if by_access {
                    meta.accessed().map_or(modified, |a| a.max(modified))
                } else {
                    modified
                };
                let age = now.duration_since(last_use).unwrap_or_default();
                if age >= min_age {
                    found.push(PlanItem {
                        path: entry.path(),
                        root: root.to_path_buf(),
                        bytes: meta.len(),
                    });
                }
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

/// Staging directories left directly under `root` by an interrupted run
pub(crate) fn staging_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| entry.path())
        .collect();
    found.sort();
    found
}

/// Count regular files under `root`, visiting at most `max_entries` entries.
///
/// A file counts as a recent write when it was modified within `recent`.
pub(crate) fn file_metrics(
    root: &Path,
    recent: Duration,
    max_entries: usize,
    now: SystemTime,
) -> io::Result<FileMetrics> {
    let mut metrics = FileMetrics::default();
    let mut visited = 0usize;
    let mut stack = vec![std::fs::read_dir(root)?];
    while let Some(entries) = stack.last_mut() {
        let Some(entry) = entries.next() else {
            stack.pop();
            continue;
        };
        let Ok(entry) = entry else {
            continue;
        };
        visited += 1;
        if visited > max_entries {
            metrics.truncated = true;
            break;
        }
        let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
            continue;
        };
        if meta.is_dir() {
            if let Ok(children) = std::fs::read_dir(entry.path()) {
                stack.push(children);
            }
        } else if meta.is_file() {
            metrics.file_count += 1;
            metrics.total_bytes = metrics.total_bytes.saturating_add(meta.len());
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if now.duration_since(modified).unwrap_or_default() <= recent {
                metrics.recent_writes += 1;
            }
        }
    }
    Ok(metrics)
}

/// Apparent size of a file or directory tree, without following symlinks
pub(crate) fn tree_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("alice/.cache")).unwrap();
        std::fs::create_dir_all(dir.path().join("bob/.cache")).unwrap();
        std::fs::create_dir_all(dir.path().join("carol")).unwrap();
        let expanded = expand(&dir.path().join("*").join(".cache"));
        assert_eq!(
            expanded,
            vec![
                dir.path().join("alice/.cache"),
                dir.path().join("bob/.cache")
            ]
        );
        assert!(expand(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_old_files_skips_staging_and_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::create_dir(dir.path().join(".btrmind-staging-1")).unwrap();
        std::fs::write(dir.path().join(".btrmind-staging-1/b"), b"x").unwrap();
        let later = SystemTime::now() + Duration::from_secs(3600);

        let old = old_files(dir.path(), Duration::from_secs(60), false, later).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].bytes, 5);

        let none = old_files(dir.path(), Duration::from_secs(60), false, SystemTime::now()).unwrap();
        assert!(none.is_empty());
        assert_eq!(tree_size(dir.path()), 6);
        assert_eq!(staging_dirs(dir.path()), vec![dir.path().join(".btrmind-staging-1")]);
    }

    #[test]
    fn test_file_metrics_counts_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("one"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/two"), vec![0u8; 20]).unwrap();
        std::fs::write(dir.path().join("a/b/three"), vec![0u8; 30]).unwrap();

        let now = SystemTime::now();
        let metrics = file_metrics(dir.path(), Duration::from_secs(3600), 100, now).unwrap();
        assert_eq!(metrics.file_count, 3);
        assert_eq!(metrics.total_bytes, 60);
        assert_eq!(metrics.recent_writes, 3);
        assert!(!metrics.truncated);

        let later = now + Duration::from_secs(7200);
        let stale = file_metrics(dir.path(), Duration::from_secs(3600), 100, later).unwrap();
        assert_eq!(stale.recent_writes, 0);

        let partial = file_metrics(dir.path(), Duration::from_secs(3600), 2, now).unwrap();
        assert!(partial.truncated);
        assert!(partial.file_count < 3);

        assert!(file_metrics(&dir.path().join("missing"), Duration::ZERO, 10, now).is_err());
    }
}
