//! One handler per mutating action

mod compress;
mod prune;
mod rebalance;
mod temp;

pub use compress::Compressor;
pub use prune::SnapshotPruner;
pub use rebalance::Rebalancer;
pub use temp::{PackageCacheConfig, TempCleaner};

use btrmind_core::{Action, ExecutionError};
use std::path::PathBuf;

use crate::executor::PlanItem;
use crate::scan;

/// Expand path patterns and fail if none of them exist
pub(crate) fn existing_roots(
    action: Action,
    patterns: &[PathBuf],
) -> Result<Vec<PathBuf>, ExecutionError> {
    let roots: Vec<PathBuf> = patterns.iter().flat_map(|p| scan::expand(p)).collect();
    if roots.is_empty() {
        return Err(ExecutionError::Precondition {
            action,
            reason: format!("none of {patterns:?} exist"),
        });
    }
    Ok(roots)
}

/// Scan roots on the blocking pool
pub(crate) async fn scan_roots(
    action: Action,
    roots: Vec<PathBuf>,
    min_age: std::time::Duration,
    by_access: bool,
) -> Result<Vec<PlanItem>, ExecutionError> {
    tokio::task::spawn_blocking(move || {
        let now = std::time::SystemTime::now();
        let mut items = Vec::new();
        for root in &roots {
            match scan::old_files(root, min_age, by_access, now) {
                Ok(found) => items.extend(found),
                Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(ExecutionError::PermissionDenied {
                        action,
                        path: root.display().to_string(),
                    });
                }
                Err(err) => {
                    tracing::debug!(root = %root.display(), error = %err, "Skipping unreadable root");
                }
            }
        }
        Ok(items)
    })
    .await
    .map_err(|e| ExecutionError::Io {
        action,
        reason: e.to_string(),
        rolled_back: true,
    })?
}
