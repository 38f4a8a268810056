//! Versioned policy blob on disk

use btrmind_core::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{Policy, QNetwork};

/// Version written into every policy blob
pub const FORMAT_VERSION: u32 = 1;

/// A policy together with the target network it is trained against.
///
/// Blobs written without a target load with `target: None`; the engine then
/// re-synchronizes the target from the policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Live policy
    pub policy: Policy,
    /// Target network at save time
    pub target: Option<QNetwork>,
}

impl From<Policy> for Checkpoint {
    fn from(policy: Policy) -> Self {
        Self {
            policy,
            target: None,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    saved_at: DateTime<Utc>,
    policy: &'a Policy,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a QNetwork>,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    #[allow(dead_code)]
    saved_at: DateTime<Utc>,
    policy: Policy,
    #[serde(default)]
    target: Option<QNetwork>,
}

/// Loads and saves the policy at a fixed path
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    /// Create a store for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the blob
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the policy alone
    pub async fn save(&self, policy: &Policy) -> Result<(), PersistenceError> {
        self.write(policy, None).await
    }

    /// Write the policy and its target network
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.write(&checkpoint.policy, checkpoint.target.as_ref()).await
    }

    /// Write atomically: temp file in the same directory, fsync, rename
    async fn write(&self, policy: &Policy, target: Option<&QNetwork>) -> Result<(), PersistenceError> {
        let envelope = EnvelopeRef {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            policy,
            target,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            version = policy.version(),
            bytes = bytes.len(),
            with_target = target.is_some(),
            "Policy saved"
        );
        Ok(())
    }

    /// Read and validate the policy
    pub async fn load(&self) -> Result<Policy, PersistenceError> {
        self.load_checkpoint().await.map(|checkpoint| checkpoint.policy)
    }

    /// Read and validate the policy and, when present, its target network
    pub async fn load_checkpoint(&self) -> Result<Checkpoint, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::Missing(self.path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        #[derive(Deserialize)]
        struct VersionHeader {
            format_version: u32,
        }
        let header: VersionHeader = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if header.format_version != FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        debug_assert_eq!(envelope.format_version, FORMAT_VERSION);
        envelope
            .policy
            .validate()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        if let Some(target) = &envelope.target {
            target
                .validate_shape()
                .map_err(|e| PersistenceError::Corrupt(format!("target network: {e}")))?;
            if !target.is_finite() {
                return Err(PersistenceError::Corrupt(
                    "target network has non-finite parameters".to_string(),
                ));
            }
        }
        Ok(Checkpoint {
            policy: envelope.policy,
            target: envelope.target,
        })
    }

    /// Load the persisted policy, or fall back to `fresh` on any failure
    pub async fn load_or_fresh(&self, fresh: impl FnOnce() -> Policy) -> Policy {
        self.load_checkpoint_or_fresh(fresh).await.policy
    }

    /// Load the persisted checkpoint, or fall back to `fresh` on any failure
    pub async fn load_checkpoint_or_fresh(&self, fresh: impl FnOnce() -> Policy) -> Checkpoint {
        match self.load_checkpoint().await {
            Ok(checkpoint) => {
                info!(
                    path = %self.path.display(),
                    version = checkpoint.policy.version(),
                    training_steps = checkpoint.policy.training_steps(),
                    with_target = checkpoint.target.is_some(),
                    "Loaded persisted policy"
                );
                checkpoint
            }
            Err(PersistenceError::Missing(_)) => {
                info!(path = %self.path.display(), "No persisted policy; starting fresh");
                fresh().into()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Unusable persisted policy; starting fresh");
                fresh().into()
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "policy".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DecisionEngine, EngineConfig};
    use btrmind_core::{Action, ActionMask, Experience, Snapshot};
    use chrono::Utc;

    fn config() -> EngineConfig {
        EngineConfig {
            seed: Some(5),
            ..EngineConfig::default()
        }
    }

    fn training_config() -> EngineConfig {
        EngineConfig {
            batch_size: 4,
            min_replay: 4,
            target_sync_steps: 2,
            ..config()
        }
    }

    async fn trained_engine(steps: u64) -> DecisionEngine {
        let config = training_config();
        let engine = DecisionEngine::new(config.clone(), config.fresh_policy());
        let base = Utc::now();
        for i in 0..16u32 {
            let util = 80.0 + f64::from(i % 8);
            let at = |offset: u32| base + chrono::Duration::minutes(i64::from(offset));
            let prev = Snapshot::new(at(i), util, 2.0, 5.0).unwrap();
            let next = Snapshot::new(at(i + 1), util - 1.0, 2.0, 5.0).unwrap();
            let action = Action::ALL[i as usize % Action::COUNT];
            assert!(engine.record(Experience::new(prev, action, 10.0, next)).await);
        }
        for _ in 0..steps {
            tokio_test::assert_ok!(engine.train_step().await);
        }
        engine
    }

    fn assert_same_outputs(a: &QNetwork, b: &QNetwork) {
        for util in [5.0, 50.0, 88.0, 99.0] {
            let features = Snapshot::new(Utc::now(), util, 2.0, 5.0)
                .unwrap()
                .with_trend(0.5)
                .features();
            for (x, y) in a.q_values(&features).iter().zip(&b.q_values(&features)) {
                approx::assert_relative_eq!(x, y, epsilon = 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("model").join("policy.json"));
        let policy = config().fresh_policy();
        tokio_test::assert_ok!(store.save(&policy).await);
        let loaded = tokio_test::assert_ok!(store.load().await);

        assert_eq!(loaded.version(), policy.version());
        for util in [10.0, 55.5, 90.0, 97.25, 99.9] {
            let snapshot = Snapshot::new(Utc::now(), util, 3.0, 12.0)
                .unwrap()
                .with_trend(1.5)
                .with_free_space(1 << 30, -(1 << 28));
            let mask = ActionMask::all();
            assert_eq!(loaded.greedy(&snapshot, &mask), policy.greedy(&snapshot, &mask));
            let a = loaded.q_values(&snapshot);
            let b = policy.q_values(&snapshot);
            for (x, y) in a.iter().zip(&b) {
                approx::assert_relative_eq!(x, y, epsilon = 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load().await, Err(PersistenceError::Missing(_))));
    }

    #[tokio::test]
    async fn test_corrupt_and_wrong_version_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::new(&path);

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(store.load().await, Err(PersistenceError::Corrupt(_))));

        tokio::fs::write(&path, br#"{"format_version": 9, "saved_at": "2024-01-01T00:00:00Z", "policy": null}"#)
            .await
            .unwrap();
        assert!(matches!(
            store.load().await,
            Err(PersistenceError::UnsupportedVersion { found: 9, expected: 1 })
        ));

        let fallback = store.load_or_fresh(|| config().fresh_policy()).await;
        assert_eq!(fallback, config().fresh_policy());
    }

    #[tokio::test]
    async fn test_engine_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("policy.json"));
        let engine = DecisionEngine::new(config(), config().fresh_policy());
        store.save(&*engine.policy_snapshot().await).await.unwrap();

        let restored = store.load_or_fresh(|| unreachable!()).await;
        assert_eq!(restored.epsilon(), engine.policy_snapshot().await.epsilon());
        assert!(!dir.path().join("policy.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_trained_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("policy.json"));
        let engine = trained_engine(3).await;
        let saved = engine.checkpoint().await;
        let saved_target = saved.target.clone().unwrap();
        assert_eq!(saved.policy.training_steps(), 3);
        // Synced at step 2, so the live network has moved on since
        assert_ne!(&saved_target, saved.policy.network());

        tokio_test::assert_ok!(store.save_checkpoint(&saved).await);
        let loaded = tokio_test::assert_ok!(store.load_checkpoint().await);
        assert_eq!(loaded.policy.version(), saved.policy.version());
        assert_eq!(loaded.policy.training_steps(), 3);
        approx::assert_relative_eq!(loaded.policy.epsilon(), saved.policy.epsilon(), epsilon = 1e-12);
        assert_eq!(
            loaded.policy.network().parameter_count(),
            saved.policy.network().parameter_count()
        );
        assert_same_outputs(loaded.policy.network(), saved.policy.network());
        let loaded_target = loaded.target.clone().unwrap();
        assert_same_outputs(&loaded_target, &saved_target);

        // Training resumes from the persisted counters and target
        let resumed = DecisionEngine::restore(training_config(), loaded);
        assert_eq!(resumed.checkpoint().await.target, Some(loaded_target));
        assert_eq!(resumed.stats().await.training_steps, 3);
        assert_eq!(resumed.policy_snapshot().await.version(), saved.policy.version());
    }

    #[tokio::test]
    async fn test_policy_without_target_resyncs_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("policy.json"));
        let engine = trained_engine(1).await;
        let policy = Policy::clone(&*engine.policy_snapshot().await);
        tokio_test::assert_ok!(store.save(&policy).await);

        let loaded = tokio_test::assert_ok!(store.load_checkpoint().await);
        assert!(loaded.target.is_none());
        let restored = DecisionEngine::restore(training_config(), loaded);
        let checkpoint = restored.checkpoint().await;
        assert_eq!(checkpoint.target.as_ref(), Some(checkpoint.policy.network()));
    }

    #[tokio::test]
    async fn test_future_format_version_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::new(&path);
        let engine = trained_engine(2).await;
        tokio_test::assert_ok!(store.save_checkpoint(&engine.checkpoint().await).await);

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("\"format_version\":1"));
        let bumped = text.replacen("\"format_version\":1", "\"format_version\":2", 1);
        tokio::fs::write(&path, bumped).await.unwrap();

        assert!(matches!(
            store.load_checkpoint().await,
            Err(PersistenceError::UnsupportedVersion { found: 2, expected: 1 })
        ));
        let fallback = store
            .load_checkpoint_or_fresh(|| training_config().fresh_policy())
            .await;
        assert_eq!(fallback.policy, training_config().fresh_policy());
        assert_eq!(fallback.policy.training_steps(), 0);
        assert!(fallback.target.is_none());
    }
}
