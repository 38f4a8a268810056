//! Status file written next to the persisted policy
//!
//! The daemon refreshes it on every persist; `btrmind stats` reads it from a
//! separate process.

use btrmind_agent::{KnowledgeSummary, LearningStats};
use btrmind_core::{LoopState, PersistenceError};
use btrmind_fs::{EscalationCause, GuardStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Point-in-time view of a running daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Process run that wrote the report
    pub run_id: Uuid,
    /// Cycles started by that run
    pub cycles: u64,
    /// Loop phase when written
    pub loop_state: LoopState,
    /// Decision engine counters
    pub learning: LearningStats,
    /// Safety guard state
    pub guard: GuardStatus,
    /// Read-only knowledge summary
    pub knowledge: KnowledgeSummary,
    /// Write time
    pub written_at: DateTime<Utc>,
}

impl StatusReport {
    /// Status file belonging to a policy blob
    #[must_use]
    pub fn path_for(model_path: &Path) -> PathBuf {
        model_path.with_extension("status.json")
    }

    /// Write atomically
    ///
    /// # Errors
    ///
    /// Serialization or I/O failure.
    pub async fn write(&self, path: &Path) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read a status file
    ///
    /// # Errors
    ///
    /// `Missing` when absent, `Corrupt` when unparsable.
    pub async fn read(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::Missing(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }

    /// Escalation recorded by the last status write next to `model_path`.
    /// No status file means no escalation.
    ///
    /// # Errors
    ///
    /// I/O failures and `Corrupt` status files.
    pub async fn recorded_escalation(
        model_path: &Path,
    ) -> Result<Option<EscalationCause>, PersistenceError> {
        match Self::read(&Self::path_for(model_path)).await {
            Ok(report) => Ok(report.guard.escalation),
            Err(PersistenceError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_sits_next_to_model() {
        let path = StatusReport::path_for(Path::new("/var/lib/btrmind/policy.json"));
        assert_eq!(path, PathBuf::from("/var/lib/btrmind/policy.status.json"));
    }

    #[tokio::test]
    async fn test_recorded_escalation() {
        use crate::{Config, ControlLoop};
        use btrmind_core::Action;
        use btrmind_fs::MemoryStatProvider;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.monitoring.target_path = dir.path().to_path_buf();
        config.learning.model_path = dir.path().join("policy.json");
        let model_path = config.learning.model_path.clone();
        assert_eq!(StatusReport::recorded_escalation(&model_path).await.unwrap(), None);

        let control = ControlLoop::new(&config, Arc::new(MemoryStatProvider::new()))
            .await
            .unwrap();
        let mut report = control.status_report().await;
        report.write(&StatusReport::path_for(&model_path)).await.unwrap();
        assert_eq!(StatusReport::recorded_escalation(&model_path).await.unwrap(), None);

        let cause = EscalationCause {
            action: Action::PruneSnapshots,
            failures: 3,
            last_error: "btrfs not found".to_string(),
            at: Utc::now(),
        };
        report.guard.escalation = Some(cause.clone());
        report.write(&StatusReport::path_for(&model_path)).await.unwrap();
        assert_eq!(
            StatusReport::recorded_escalation(&model_path).await.unwrap(),
            Some(cause)
        );
    }

    #[tokio::test]
    async fn test_read_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.status.json");
        assert!(matches!(
            StatusReport::read(&path).await,
            Err(PersistenceError::Missing(_))
        ));
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            StatusReport::read(&path).await,
            Err(PersistenceError::Corrupt(_))
        ));
    }
}
