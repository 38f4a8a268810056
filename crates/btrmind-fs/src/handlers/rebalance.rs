//! RebalanceMetadata: `btrfs balance start -musage=<n>`

use async_trait::async_trait;
use btrmind_core::{Action, ExecutionError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::executor::{ActionHandler, ExecutionContext, Plan, StepError};

const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Compacts partially used metadata chunks. Not reversible.
#[derive(Debug, Clone)]
pub struct Rebalancer {
    target: PathBuf,
    musage: u8,
    binary: String,
}

impl Rebalancer {
    /// Handler for the filesystem mounted at `target`
    #[must_use]
    pub fn new(target: PathBuf, musage: u8, binary: String) -> Self {
        Self {
            target,
            musage: musage.min(100),
            binary,
        }
    }

    fn resolve(&self) -> Result<PathBuf, ExecutionError> {
        which::which(&self.binary).map_err(|e| ExecutionError::Precondition {
            action: Action::RebalanceMetadata,
            reason: format!("{} not found: {e}", self.binary),
        })
    }

    async fn cancel(&self, program: &Path) {
        let cancel = Command::new(program)
            .args(["balance", "cancel"])
            .arg(&self.target)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(CANCEL_TIMEOUT, cancel).await {
            Ok(Ok(status)) => info!(%status, "Balance cancelled"),
            Ok(Err(err)) => warn!(error = %err, "Balance cancel failed"),
            Err(_) => warn!("Balance cancel timed out"),
        }
    }
}

#[async_trait]
impl ActionHandler for Rebalancer {
    fn action(&self) -> Action {
        Action::RebalanceMetadata
    }

    async fn plan(&self) -> Result<Plan, ExecutionError> {
        self.resolve()?;
        if !self.target.exists() {
            return Err(ExecutionError::Precondition {
                action: self.action(),
                reason: format!("{} does not exist", self.target.display()),
            });
        }
        Ok(Plan::new(
            Vec::new(),
            format!(
                "{} balance start -musage={} {}",
                self.binary,
                self.musage,
                self.target.display()
            ),
        ))
    }

    async fn run(&self, _plan: Plan, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        ctx.checkpoint()?;
        let program = self
            .resolve()
            .map_err(|e| StepError::Failed(e.to_string()))?;
        let child = Command::new(&program)
            .args(["balance", "start"])
            .arg(format!("-musage={}", self.musage))
            .arg(&self.target)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::io(&program, &e))?;
        // Relocated chunks stay relocated
        ctx.commit_irreversible(0);

        match tokio::time::timeout(ctx.remaining(), child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(StepError::Failed(format!(
                "balance exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(err)) => Err(StepError::io(&program, &err)),
            Err(_) => {
                // Dropping the wait future killed the child
                self.cancel(&program).await;
                Err(StepError::Deadline)
            }
        }
    }
}
