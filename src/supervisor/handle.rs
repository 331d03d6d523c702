use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::listener::ListenerState;

/// Commands accepted by a running supervisor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Provider was disabled: stop every listener and exit
    Disable,
    /// Stored credentials changed: drop cached material and restart listeners
    CredentialsRotated,
    /// Clear suspensions and start the affected listeners again
    Reset,
    /// Report the state of every folder
    Status(oneshot::Sender<Vec<FolderReport>>),
    Shutdown,
}

/// Snapshot of one folder listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderReport {
    pub folder: String,
    pub state: ListenerState,
    /// Reason the listener was suspended, if it was
    pub suspended: Option<String>,
}

/// Something an operator has to look at.
#[derive(Debug, Clone)]
pub struct OperatorAlert {
    pub tenant: String,
    pub provider: String,
    /// Affected folder, `*` when the provider as a whole is stuck
    pub folder: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(tenant: &str, provider: &str, folder: &str, reason: impl Into<String>) -> Self {
        Self {
            tenant: tenant.to_string(),
            provider: provider.to_string(),
            folder: folder.to_string(),
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Handle for one provider's supervisor task.
pub struct SupervisorHandle {
    pub provider_id: String,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub(super) fn new(
        provider_id: String,
        cmd_tx: mpsc::Sender<SupervisorCommand>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            provider_id,
            cmd_tx,
            cancel,
            task,
        }
    }

    pub async fn send(&self, cmd: SupervisorCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|e| {
            tracing::warn!(provider = %self.provider_id, "Supervisor is gone, dropping {:?}", e.0);
            anyhow::anyhow!("supervisor for '{}' has exited", self.provider_id)
        })
    }

    pub async fn status(&self) -> Result<Vec<FolderReport>> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Status(tx)).await?;
        Ok(rx.await?)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask for a graceful stop and wait for it, aborting after `timeout`.
    pub async fn stop(self, cmd: SupervisorCommand, timeout: Duration) {
        let _ = self.cmd_tx.send(cmd).await;
        // Commands are not read during folder discovery.
        self.cancel.cancel();

        let abort = self.task.abort_handle();
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            tracing::warn!(provider = %self.provider_id, "Supervisor did not stop in time, aborting");
            abort.abort();
        }
    }

    pub async fn shutdown(self, timeout: Duration) {
        self.stop(SupervisorCommand::Shutdown, timeout).await;
    }
}
