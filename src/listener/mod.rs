//! Folder listener: one leased IMAP session watching one folder.
//!
//! The listener loop:
//! 1. Acquire the folder lease (denied: wait and retry, not a failure)
//! 2. Resolve credentials and authenticate, refreshing once on rejection
//! 3. Select the folder and restore or reseed the cursor
//! 4. Fetch and publish everything above the cursor, checkpointing after acks
//! 5. Wait for activity (IDLE or poll), renewing the lease meanwhile
//! 6. Repeat from 4 until an error, then back off and start over
//!
//! Consecutive failures past the configured ceiling, or credentials that are
//! definitely unusable, suspend the listener until an operator resets it.

mod state;
mod wait;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConnection, TuningConfig};
use crate::constants::LEASE_RELEASE_TIMEOUT_MS;
use crate::credentials::{Credential, CredentialResolver};
use crate::error::{SyncError, SyncResult};
use crate::mail::{FolderStatus, MailConnector, MailSession};
use crate::publish::{EventPublisher, IngestionEvent, MessageOrigin};
use crate::schedule::{BackoffPolicy, jittered};
use crate::store::{Acquire, FolderState, FolderStateStore, LeaseCoordinator, LeaseKey, Renewal};

pub use state::ListenerState;
pub use wait::sleep_or_cancel;
use wait::{Wake, WaitForActivity, strategy_for};

/// Collaborators shared by every listener of a process.
#[derive(Clone)]
pub struct ListenerDeps {
    pub connector: Arc<dyn MailConnector>,
    pub credentials: Arc<CredentialResolver>,
    pub folder_states: Arc<dyn FolderStateStore>,
    pub leases: Arc<dyn LeaseCoordinator>,
    pub publisher: Arc<EventPublisher>,
    /// Lease owner identity of this process
    pub instance_id: String,
}

/// Timing and limits of one listener, derived from `TuningConfig`.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub connect_timeout: Duration,
    /// Bound on one command of an established session
    pub io_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub lease_ttl: Duration,
    pub lease_renew: Duration,
    pub catch_up_window: usize,
    pub max_messages_per_sync: usize,
    pub max_skips_per_batch: usize,
    pub max_consecutive_failures: u32,
    pub keepalive: bool,
    pub backoff: BackoffPolicy,
}

impl From<&TuningConfig> for ListenerSettings {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            connect_timeout: tuning.connect_timeout(),
            io_timeout: tuning.io_timeout(),
            poll_interval: tuning.poll_interval(),
            heartbeat_interval: tuning.heartbeat_interval(),
            idle_timeout: tuning.idle_timeout(),
            lease_ttl: tuning.lease_ttl(),
            lease_renew: tuning.lease_renew(),
            catch_up_window: tuning.catch_up_window.max(1),
            max_messages_per_sync: tuning.max_messages_per_sync.max(1),
            max_skips_per_batch: tuning.max_skips_per_batch,
            max_consecutive_failures: tuning.max_consecutive_failures,
            keepalive: tuning.keepalive,
            backoff: tuning.backoff(),
        }
    }
}

/// How a listener ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerExit {
    Stopped,
    Suspended(String),
}

/// Position of the listener inside the current generation.
#[derive(Debug, Clone)]
struct Cursor {
    generation: String,
    position: u32,
}

pub struct FolderListener {
    deps: ListenerDeps,
    provider: Arc<ProviderConnection>,
    folder: String,
    key: LeaseKey,
    settings: ListenerSettings,
    cancel: CancellationToken,
    state: watch::Sender<ListenerState>,
    start_delay: Duration,
    failures: u32,
    holds_lease: bool,
    lease_renewed_at: Instant,
    heartbeat_at: Instant,
}

impl FolderListener {
    pub fn new(
        deps: ListenerDeps,
        provider: Arc<ProviderConnection>,
        folder: &str,
        settings: ListenerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let key = LeaseKey::new(&provider.tenant, &provider.id, folder);
        let (state, _) = watch::channel(ListenerState::Disconnected);
        let now = Instant::now();
        Self {
            deps,
            provider,
            folder: folder.to_string(),
            key,
            settings,
            cancel,
            state,
            start_delay: Duration::ZERO,
            failures: 0,
            holds_lease: false,
            lease_renewed_at: now,
            heartbeat_at: now,
        }
    }

    /// Delay the first connect, used for staggered startup.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn current(&self) -> ListenerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                provider = %self.provider.id,
                folder = %self.folder,
                state = %next,
                from = %previous,
                "Listener state changed"
            );
        }
    }

    pub async fn run(mut self) -> ListenerExit {
        if !self.start_delay.is_zero()
            && sleep_or_cancel(self.start_delay, &self.cancel).await.is_err()
        {
            return self.finish(ListenerExit::Stopped).await;
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(ListenerExit::Stopped).await;
            }
            self.set_state(ListenerState::Disconnected);

            let error = match self.acquire_lease().await {
                Ok(true) => match self.run_session().await {
                    Ok(never) => match never {},
                    Err(e) => e,
                },
                Ok(false) => {
                    if sleep_or_cancel(self.lease_retry_delay(), &self.cancel).await.is_err() {
                        return self.finish(ListenerExit::Stopped).await;
                    }
                    continue;
                }
                Err(e) => e,
            };

            match error {
                SyncError::Cancelled => return self.finish(ListenerExit::Stopped).await,
                e if e.is_terminal() => {
                    tracing::error!(
                        provider = %self.provider.id,
                        folder = %self.folder,
                        state = %ListenerState::Suspended,
                        error = %e,
                        "Credentials unusable, suspending listener"
                    );
                    return self.finish(ListenerExit::Suspended(e.to_string())).await;
                }
                e => {
                    self.failures += 1;
                    if self.failures > self.settings.max_consecutive_failures {
                        tracing::error!(
                            provider = %self.provider.id,
                            folder = %self.folder,
                            state = %ListenerState::Suspended,
                            failures = self.failures,
                            error = %e,
                            "Too many consecutive failures, suspending listener"
                        );
                        let reason = format!("{} consecutive failures, last: {}", self.failures, e);
                        return self.finish(ListenerExit::Suspended(reason)).await;
                    }

                    let delay = self.settings.backoff.delay(self.failures, &mut rand::thread_rng());
                    tracing::warn!(
                        provider = %self.provider.id,
                        folder = %self.folder,
                        state = %self.current(),
                        failures = self.failures,
                        error = %e,
                        "Listener failed, reconnecting in {:?}",
                        delay
                    );
                    self.set_state(ListenerState::Disconnected);
                    if sleep_or_cancel(delay, &self.cancel).await.is_err() {
                        return self.finish(ListenerExit::Stopped).await;
                    }
                }
            }
        }
    }

    /// Release the lease (bounded, best effort) and publish the final state.
    async fn finish(mut self, exit: ListenerExit) -> ListenerExit {
        if self.holds_lease {
            let release = self.deps.leases.release(&self.key, &self.deps.instance_id);
            match tokio::time::timeout(Duration::from_millis(LEASE_RELEASE_TIMEOUT_MS), release).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(lease = %self.key, error = %e, "Lease release failed"),
                Err(_) => tracing::warn!(lease = %self.key, "Lease release timed out"),
            }
            self.holds_lease = false;
        }

        let state = match exit {
            ListenerExit::Stopped => ListenerState::Stopped,
            ListenerExit::Suspended(_) => ListenerState::Suspended,
        };
        self.set_state(state);
        tracing::info!(
            provider = %self.provider.id,
            folder = %self.folder,
            state = %state,
            "Listener exited"
        );
        exit
    }

    fn lease_retry_delay(&self) -> Duration {
        jittered(self.settings.lease_renew)
    }

    async fn acquire_lease(&mut self) -> SyncResult<bool> {
        let owner = &self.deps.instance_id;
        match self
            .deps
            .leases
            .try_acquire(&self.key, owner, self.settings.lease_ttl)
            .await?
        {
            Acquire::Granted(lease) => {
                if !self.holds_lease {
                    tracing::info!(lease = %self.key, expires_at = %lease.expires_at, "Lease acquired");
                }
                self.holds_lease = true;
                self.lease_renewed_at = Instant::now();
                Ok(true)
            }
            Acquire::Denied(holder) => {
                self.holds_lease = false;
                tracing::debug!(
                    lease = %self.key,
                    holder = %holder.owner,
                    expires_at = %holder.expires_at,
                    "Lease held elsewhere"
                );
                Ok(false)
            }
        }
    }

    async fn renew_lease(&mut self) -> SyncResult<()> {
        match self
            .deps
            .leases
            .renew(&self.key, &self.deps.instance_id, self.settings.lease_ttl)
            .await?
        {
            Renewal::Renewed(_) => {
                self.lease_renewed_at = Instant::now();
                Ok(())
            }
            Renewal::Lost => {
                self.holds_lease = false;
                Err(SyncError::LeaseLost(self.key.to_string()))
            }
        }
    }

    async fn renew_lease_if_due(&mut self) -> SyncResult<()> {
        if self.lease_renewed_at.elapsed() >= self.settings.lease_renew {
            self.renew_lease().await?;
        }
        Ok(())
    }

    /// Run one command of the established session, bounded by `io_timeout`
    /// and abandoned on cancel. A silent peer surfaces as a network error.
    async fn io<T>(&self, command: &str, op: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        let timeout = self.settings.io_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, op) => result.unwrap_or_else(|_| {
                Err(SyncError::TransientNetwork(format!("{} timed out after {:?}", command, timeout)))
            }),
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }

    /// One connected session. Only returns on error.
    async fn run_session(&mut self) -> SyncResult<std::convert::Infallible> {
        self.set_state(ListenerState::Authenticating);
        let credential = self.deps.credentials.resolve(&self.provider.id).await?;
        let mut session = self.authenticate(credential).await?;

        let result = self.drive(session.as_mut()).await;

        // Logout after a cancel or failure must not hold up the exit.
        let _ = tokio::time::timeout(Duration::from_millis(LEASE_RELEASE_TIMEOUT_MS), session.logout()).await;
        result
    }

    async fn connect(&self, credential: &Credential) -> SyncResult<Box<dyn MailSession>> {
        tokio::select! {
            result = self.deps.connector.connect(&self.provider, credential, self.settings.connect_timeout) => result,
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }

    /// Connect, refreshing the credential once if the server rejects it.
    async fn authenticate(&self, credential: Credential) -> SyncResult<Box<dyn MailSession>> {
        let rejection = match self.connect(&credential).await {
            Err(SyncError::AuthExpired(msg)) => msg,
            other => return other,
        };

        tracing::warn!(
            provider = %self.provider.id,
            folder = %self.folder,
            state = %ListenerState::Authenticating,
            version = credential.version,
            "Server rejected credentials ({}), refreshing",
            rejection
        );
        let refreshed = self
            .deps
            .credentials
            .refresh(&self.provider.id, credential.version)
            .await?;

        // A password that did not change will be rejected again.
        if !refreshed.is_oauth() && refreshed.secret == credential.secret {
            return Err(SyncError::AuthExpired(rejection));
        }

        match self.connect(&refreshed).await {
            Err(SyncError::AuthExpired(msg)) if refreshed.is_oauth() => Err(SyncError::AuthRevoked(
                format!("token rejected after refresh: {}", msg),
            )),
            other => other,
        }
    }

    async fn drive(&mut self, session: &mut dyn MailSession) -> SyncResult<std::convert::Infallible> {
        self.set_state(ListenerState::Selecting);
        let status = self.io("EXAMINE", session.examine(&self.folder)).await?;

        self.set_state(ListenerState::Syncing);
        let mut cursor = self.restore_cursor(session, &status).await?;
        self.drain(session, &mut cursor).await?;

        if self.failures > 0 {
            tracing::info!(
                provider = %self.provider.id,
                folder = %self.folder,
                failures = self.failures,
                "Listener recovered"
            );
        }
        self.failures = 0;

        let mut waiter = strategy_for(session, self.settings.idle_timeout, self.settings.poll_interval);
        self.heartbeat_at = Instant::now() + jittered(self.settings.heartbeat_interval);
        tracing::info!(
            provider = %self.provider.id,
            folder = %self.folder,
            state = %waiter.state(),
            generation = %cursor.generation,
            position = cursor.position,
            "Listening for new mail"
        );

        loop {
            self.set_state(waiter.state());
            self.wait_for_activity(session, waiter.as_mut()).await?;
            self.drain(session, &mut cursor).await?;
        }
    }

    /// Resume from the stored cursor, or start a new epoch with a bounded
    /// catch-up window when the stored cursor cannot be trusted.
    async fn restore_cursor(&self, session: &mut dyn MailSession, status: &FolderStatus) -> SyncResult<Cursor> {
        let stored = self
            .deps
            .folder_states
            .load(&self.provider.id, &self.folder)
            .await?;

        match stored {
            Some(state) if state.resumable(&status.generation, status.uid_next) => {
                tracing::debug!(
                    provider = %self.provider.id,
                    folder = %self.folder,
                    generation = %state.generation,
                    position = state.last_position,
                    "Resuming from stored cursor"
                );
                Ok(Cursor {
                    generation: state.generation,
                    position: state.last_position,
                })
            }
            stale => {
                if let Some(state) = &stale {
                    tracing::warn!(
                        provider = %self.provider.id,
                        folder = %self.folder,
                        stored_generation = %state.generation,
                        stored_position = state.last_position,
                        generation = %status.generation,
                        uid_next = ?status.uid_next,
                        "Stored cursor does not match mailbox, rescanning recent messages"
                    );
                    self.deps
                        .folder_states
                        .reset(&self.provider.id, &self.folder)
                        .await?;
                }
                self.seed_cursor(session, status).await
            }
        }
    }

    /// Place the cursor just below the most recent `catch_up_window` messages.
    async fn seed_cursor(&self, session: &mut dyn MailSession, status: &FolderStatus) -> SyncResult<Cursor> {
        let uids = self.io("UID SEARCH", session.search_after(0)).await?;
        let skip = uids.len().saturating_sub(self.settings.catch_up_window);
        let position = match uids.get(skip) {
            Some(first) => first - 1,
            None => status.uid_next.map(|n| n.saturating_sub(1)).unwrap_or(0),
        };

        let cursor = Cursor {
            generation: status.generation.clone(),
            position,
        };
        self.deps
            .folder_states
            .save(&self.provider.id, &self.folder, &FolderState::new(&cursor.generation, position))
            .await?;

        tracing::info!(
            provider = %self.provider.id,
            folder = %self.folder,
            generation = %cursor.generation,
            position,
            catch_up = uids.len() - skip,
            "Starting new epoch"
        );
        Ok(cursor)
    }

    /// Fetch and publish everything above the cursor, batch by batch.
    async fn drain(&mut self, session: &mut dyn MailSession, cursor: &mut Cursor) -> SyncResult<()> {
        loop {
            self.renew_lease_if_due().await?;

            let pending = self
                .io("UID SEARCH", session.search_after(cursor.position))
                .await?;
            if pending.is_empty() {
                return Ok(());
            }

            let limit = self.settings.max_messages_per_sync;
            let batch = &pending[..pending.len().min(limit)];
            self.set_state(ListenerState::Fetching);
            self.process_batch(session, cursor, batch).await?;

            if pending.len() <= limit {
                return Ok(());
            }
        }
    }

    async fn process_batch(
        &mut self,
        session: &mut dyn MailSession,
        cursor: &mut Cursor,
        uids: &[u32],
    ) -> SyncResult<()> {
        let messages = self.io("UID FETCH", session.fetch(uids)).await?;
        let provider = Arc::clone(&self.provider);
        let folder = self.folder.clone();
        let generation = cursor.generation.clone();
        let origin = MessageOrigin {
            tenant: &provider.tenant,
            provider: &provider.id,
            folder: &folder,
            generation: &generation,
        };
        let include_raw = self.deps.publisher.include_raw();

        let mut highest = cursor.position;
        let mut skipped = 0;
        let mut published = 0;
        let mut failure = None;

        for message in messages.iter().filter(|m| m.uid > cursor.position) {
            if self.cancel.is_cancelled() {
                failure = Some(SyncError::Cancelled);
                break;
            }

            match IngestionEvent::from_fetched(&origin, message, include_raw) {
                Ok(event) => {
                    // A slow sink can outlast the lease; never publish without it.
                    if let Err(e) = self.renew_lease_if_due().await {
                        failure = Some(e);
                        break;
                    }
                    if let Err(e) = self.deps.publisher.publish(&event).await {
                        failure = Some(SyncError::PublishFailure(e));
                        break;
                    }
                    published += 1;
                }
                Err(reason) => {
                    skipped += 1;
                    tracing::warn!(
                        provider = %provider.id,
                        folder = %folder,
                        uid = message.uid,
                        "Skipping malformed message: {}",
                        reason
                    );
                    if skipped > self.settings.max_skips_per_batch {
                        failure = Some(SyncError::Protocol(format!(
                            "{} malformed messages in one batch",
                            skipped
                        )));
                        break;
                    }
                }
            }
            highest = message.uid;
        }

        // Requested UIDs the server did not return were expunged meanwhile.
        if failure.is_none()
            && let Some(last) = uids.last()
        {
            highest = highest.max(*last);
        }

        // Everything up to `highest` was acked, even when the lease is gone.
        self.checkpoint(cursor, highest).await?;
        tracing::debug!(
            provider = %provider.id,
            folder = %folder,
            published,
            skipped,
            position = cursor.position,
            "Batch processed"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Persist a new position. Never moves backwards.
    async fn checkpoint(&self, cursor: &mut Cursor, position: u32) -> SyncResult<()> {
        if position <= cursor.position {
            return Ok(());
        }
        self.deps
            .folder_states
            .save(
                &self.provider.id,
                &self.folder,
                &FolderState::new(&cursor.generation, position),
            )
            .await?;
        cursor.position = position;
        Ok(())
    }

    async fn wait_for_activity(
        &mut self,
        session: &mut dyn MailSession,
        waiter: &mut dyn WaitForActivity,
    ) -> SyncResult<()> {
        let slice_base = self.settings.lease_renew.min(self.settings.heartbeat_interval);
        loop {
            let slice = jittered(slice_base);
            match waiter.wait(session, slice, &self.cancel).await? {
                Wake::Activity => return Ok(()),
                Wake::Tick => {
                    self.renew_lease().await?;
                    if self.settings.keepalive && Instant::now() >= self.heartbeat_at {
                        self.io("NOOP", session.noop()).await?;
                        self.heartbeat_at = Instant::now() + jittered(self.settings.heartbeat_interval);
                    }
                }
            }
        }
    }
}
