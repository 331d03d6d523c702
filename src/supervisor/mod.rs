//! Connection supervisor: owns the folder listeners of one provider.
//!
//! The supervisor discovers the folders to watch, starts one listener per
//! folder with a staggered delay, and restarts listeners that exit
//! unexpectedly. A suspended listener stays down until a `Reset`.

mod handle;

use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ProviderConnection, TuningConfig};
use crate::constants::{LISTENER_RESTART_SECS, SHUTDOWN_TIMEOUT_SECS, STARTUP_STAGGER_MS};
use crate::error::{SyncError, SyncResult};
use crate::listener::{FolderListener, ListenerDeps, ListenerExit, ListenerSettings, ListenerState, sleep_or_cancel};
use crate::mail::MailSession;
use crate::schedule::{jittered, stagger};

pub use handle::{FolderReport, OperatorAlert, SupervisorCommand, SupervisorHandle};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub listener: ListenerSettings,
    /// Spread of listener start times after (re)start
    pub stagger_span: Duration,
    /// Base delay before restarting a listener that exited unexpectedly
    pub restart_delay: Duration,
    /// How long stopping listeners may take before they are aborted
    pub shutdown_timeout: Duration,
}

impl From<&TuningConfig> for SupervisorSettings {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            listener: ListenerSettings::from(tuning),
            stagger_span: Duration::from_millis(STARTUP_STAGGER_MS),
            restart_delay: Duration::from_secs(LISTENER_RESTART_SECS),
            shutdown_timeout: Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

/// Spawn the supervisor task for `provider`.
pub fn spawn_supervisor(
    deps: ListenerDeps,
    provider: Arc<ProviderConnection>,
    settings: SupervisorSettings,
    alerts: mpsc::Sender<OperatorAlert>,
) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let provider_id = provider.id.clone();

    let supervisor = ConnectionSupervisor {
        deps,
        provider,
        settings,
        alerts,
        cancel: cancel.clone(),
        listeners: BTreeMap::new(),
        tasks: JoinSet::new(),
        discovered: false,
    };
    let span = tracing::info_span!("supervisor", provider = %provider_id);
    let task = tokio::spawn(supervisor.run(cmd_rx).instrument(span));

    SupervisorHandle::new(provider_id, cmd_tx, cancel, task)
}

/// Running or suspended listener of one folder
struct Slot {
    cancel: CancellationToken,
    state: watch::Receiver<ListenerState>,
    suspended: Option<String>,
}

/// A listener task result: the folder, and the exit or the panic message.
type Joined = (String, Result<ListenerExit, String>);

struct ConnectionSupervisor {
    deps: ListenerDeps,
    provider: Arc<ProviderConnection>,
    settings: SupervisorSettings,
    alerts: mpsc::Sender<OperatorAlert>,
    cancel: CancellationToken,
    listeners: BTreeMap<String, Slot>,
    tasks: JoinSet<Joined>,
    /// Folder discovery succeeded and listeners were started
    discovered: bool,
}

impl ConnectionSupervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
        tracing::info!(provider = %self.provider.id, "Supervisor started");
        self.start_all().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SupervisorCommand::Status(reply)) => {
                        let _ = reply.send(self.report());
                    }
                    Some(SupervisorCommand::CredentialsRotated) => {
                        tracing::info!(provider = %self.provider.id, "Credentials rotated, restarting listeners");
                        self.deps.credentials.invalidate(&self.provider.id).await;
                        self.stop_all().await;
                        self.start_all().await;
                    }
                    Some(SupervisorCommand::Reset) => self.reset().await,
                    Some(SupervisorCommand::Disable) => {
                        tracing::info!(provider = %self.provider.id, "Provider disabled");
                        break;
                    }
                    Some(SupervisorCommand::Shutdown) | None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(joined) => self.on_exit(joined).await,
                    // Only aborted tasks end up here; stop_all accounts for them.
                    Err(e) => tracing::debug!(provider = %self.provider.id, "Listener task aborted: {}", e),
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        self.stop_all().await;
        tracing::info!(provider = %self.provider.id, "Supervisor stopped");
    }

    async fn start_all(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let folders = match self.discover().await {
            Ok(folders) => folders,
            Err(SyncError::Cancelled) => return,
            Err(e) => {
                tracing::error!(
                    provider = %self.provider.id,
                    state = %ListenerState::Suspended,
                    error = %e,
                    "Folder discovery failed, waiting for reset"
                );
                self.alert("*", format!("folder discovery failed: {}", e)).await;
                self.discovered = false;
                return;
            }
        };
        self.discovered = true;

        let total = folders.len();
        tracing::info!(provider = %self.provider.id, folders = ?folders, "Starting {} listener(s)", total);
        for (index, folder) in folders.into_iter().enumerate() {
            let delay = stagger(index, total, self.settings.stagger_span);
            self.spawn_listener(folder, delay);
        }
    }

    fn spawn_listener(&mut self, folder: String, delay: Duration) {
        let cancel = self.cancel.child_token();
        let listener = FolderListener::new(
            self.deps.clone(),
            Arc::clone(&self.provider),
            &folder,
            self.settings.listener.clone(),
            cancel.clone(),
        )
        .with_start_delay(delay);

        self.listeners.insert(
            folder.clone(),
            Slot {
                cancel,
                state: listener.subscribe(),
                suspended: None,
            },
        );

        let span = tracing::info_span!("listener", provider = %self.provider.id, folder = %folder);
        self.tasks.spawn(
            async move {
                let exit = AssertUnwindSafe(listener.run())
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(panic.as_ref()));
                (folder, exit)
            }
            .instrument(span),
        );
    }

    async fn on_exit(&mut self, (folder, exit): Joined) {
        let Some(slot) = self.listeners.get_mut(&folder) else {
            return;
        };

        match exit {
            Ok(ListenerExit::Suspended(reason)) => {
                slot.suspended = Some(reason.clone());
                self.alert(&folder, reason).await;
            }
            Ok(ListenerExit::Stopped) if slot.cancel.is_cancelled() => {
                self.listeners.remove(&folder);
            }
            Ok(ListenerExit::Stopped) => {
                self.restart(folder, "listener stopped unexpectedly");
            }
            Err(panic) => {
                tracing::error!(provider = %self.provider.id, folder = %folder, "Listener panicked: {}", panic);
                self.restart(folder, "listener panicked");
            }
        }
    }

    fn restart(&mut self, folder: String, why: &str) {
        let delay = jittered(self.settings.restart_delay);
        tracing::warn!(
            provider = %self.provider.id,
            folder = %folder,
            state = %ListenerState::Disconnected,
            "Restarting in {:?}: {}",
            delay,
            why
        );
        self.spawn_listener(folder, delay);
    }

    /// Restart suspended listeners, or retry discovery if it never succeeded.
    async fn reset(&mut self) {
        if !self.discovered {
            tracing::info!(provider = %self.provider.id, "Reset: retrying folder discovery");
            self.start_all().await;
            return;
        }

        let suspended: Vec<String> = self
            .listeners
            .iter()
            .filter(|(_, slot)| slot.suspended.is_some())
            .map(|(folder, _)| folder.clone())
            .collect();
        if suspended.is_empty() {
            return;
        }

        tracing::info!(provider = %self.provider.id, folders = ?suspended, "Reset: resuming suspended listeners");
        self.deps.credentials.invalidate(&self.provider.id).await;
        let total = suspended.len();
        for (index, folder) in suspended.into_iter().enumerate() {
            let delay = stagger(index, total, self.settings.stagger_span);
            self.spawn_listener(folder, delay);
        }
    }

    /// Cancel every listener and wait for them, aborting stragglers.
    async fn stop_all(&mut self) {
        for slot in self.listeners.values() {
            slot.cancel.cancel();
        }

        let tasks = &mut self.tasks;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((folder, Err(panic))) = joined {
                    tracing::error!(folder = %folder, "Listener panicked while stopping: {}", panic);
                }
            }
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(
                provider = %self.provider.id,
                remaining = self.tasks.len(),
                "Listeners did not stop in time, aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        self.listeners.clear();
    }

    fn report(&self) -> Vec<FolderReport> {
        self.listeners
            .iter()
            .map(|(folder, slot)| FolderReport {
                folder: folder.clone(),
                state: *slot.state.borrow(),
                suspended: slot.suspended.clone(),
            })
            .collect()
    }

    async fn alert(&self, folder: &str, reason: String) {
        let alert = OperatorAlert::new(&self.provider.tenant, &self.provider.id, folder, reason);
        if self.alerts.send(alert).await.is_err() {
            tracing::warn!(provider = %self.provider.id, folder, "Alert channel closed");
        }
    }

    /// Folder names to watch, retrying transient failures with backoff.
    async fn discover(&self) -> SyncResult<Vec<String>> {
        let filters = self.provider.folder_filters();
        if !filters.iter().any(|f| is_pattern(f)) {
            return Ok(dedup(filters));
        }

        let listener = &self.settings.listener;
        let mut failures = 0;
        loop {
            let result = tokio::select! {
                result = self.list_folders() => result,
                _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            };
            match result {
                Ok(names) => return expand_filters(&filters, &names),
                Err(e) if e.is_terminal() || matches!(e, SyncError::Cancelled) => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures > listener.max_consecutive_failures {
                        return Err(e);
                    }
                    let delay = listener.backoff.delay(failures, &mut rand::thread_rng());
                    tracing::warn!(
                        provider = %self.provider.id,
                        failures,
                        error = %e,
                        "Folder listing failed, retrying in {:?}",
                        delay
                    );
                    sleep_or_cancel(delay, &self.cancel).await?;
                }
            }
        }
    }

    async fn list_folders(&self) -> SyncResult<Vec<String>> {
        let mut session = self.open_session().await?;
        let timeout = self.settings.listener.io_timeout;
        let result = tokio::time::timeout(timeout, session.list_folders())
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::TransientNetwork(format!("LIST timed out after {:?}", timeout)))
            });
        let _ = tokio::time::timeout(timeout, session.logout()).await;
        result
    }

    async fn open_session(&self) -> SyncResult<Box<dyn MailSession>> {
        let timeout = self.settings.listener.connect_timeout;
        let credential = self.deps.credentials.resolve(&self.provider.id).await?;
        match self.deps.connector.connect(&self.provider, &credential, timeout).await {
            Err(SyncError::AuthExpired(_)) => {
                let refreshed = self
                    .deps
                    .credentials
                    .refresh(&self.provider.id, credential.version)
                    .await?;
                self.deps.connector.connect(&self.provider, &refreshed, timeout).await
            }
            other => other,
        }
    }
}

fn is_pattern(filter: &str) -> bool {
    filter.contains(['*', '?', '['])
}

/// Resolve folder filters against the server's folder list, keeping the
/// filter order. Literal filters are kept even when the server does not list
/// them; the listener reports the missing mailbox.
pub(crate) fn expand_filters(filters: &[String], available: &[String]) -> SyncResult<Vec<String>> {
    let mut folders = Vec::new();
    for filter in filters {
        if !is_pattern(filter) {
            folders.push(filter.clone());
            continue;
        }
        let pattern = glob::Pattern::new(filter)
            .map_err(|e| SyncError::Protocol(format!("invalid folder pattern '{}': {}", filter, e)))?;
        folders.extend(available.iter().filter(|name| pattern.matches(name)).cloned());
    }
    Ok(dedup(folders))
}

fn dedup(folders: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    folders.into_iter().filter(|f| seen.insert(f.clone())).collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
