//! Strategies for waiting on new mail between fetches.
//!
//! A wait runs in slices so the listener gets control back regularly to
//! renew its lease and send heartbeats.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ListenerState;
use crate::error::{SyncError, SyncResult};
use crate::mail::{Activity, MailSession};
use crate::schedule::jittered;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Something may have arrived; scan the folder.
    Activity,
    /// The slice ran out with nothing to report.
    Tick,
}

#[async_trait]
pub trait WaitForActivity: Send {
    fn state(&self) -> ListenerState;

    async fn wait(
        &mut self,
        session: &mut dyn MailSession,
        slice: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Wake>;
}

/// IMAP IDLE, re-issued every `refresh` (RFC 2177 asks for < 30 minutes).
///
/// Each refresh also reports activity, so a push lost between two IDLE
/// rounds is picked up by the next scan.
pub struct IdleWait {
    refresh: Duration,
    rescan_at: Instant,
}

impl IdleWait {
    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            rescan_at: Instant::now() + refresh,
        }
    }
}

#[async_trait]
impl WaitForActivity for IdleWait {
    fn state(&self) -> ListenerState {
        ListenerState::Idle
    }

    async fn wait(
        &mut self,
        session: &mut dyn MailSession,
        slice: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Wake> {
        let now = Instant::now();
        let remaining = self.rescan_at.saturating_duration_since(now);
        if remaining.is_zero() {
            self.rescan_at = now + self.refresh;
            return Ok(Wake::Activity);
        }

        match session.idle(slice.min(remaining), cancel).await? {
            Activity::Changed => Ok(Wake::Activity),
            Activity::TimedOut => Ok(Wake::Tick),
        }
    }
}

/// Fixed-interval polling with jitter, for servers without IDLE.
pub struct PollWait {
    interval: Duration,
    next_poll: Instant,
}

impl PollWait {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_poll: Instant::now() + jittered(interval),
        }
    }
}

#[async_trait]
impl WaitForActivity for PollWait {
    fn state(&self) -> ListenerState {
        ListenerState::Polling
    }

    async fn wait(
        &mut self,
        _session: &mut dyn MailSession,
        slice: Duration,
        cancel: &CancellationToken,
    ) -> SyncResult<Wake> {
        let remaining = self.next_poll.saturating_duration_since(Instant::now());
        if remaining > slice {
            sleep_or_cancel(slice, cancel).await?;
            return Ok(Wake::Tick);
        }

        sleep_or_cancel(remaining, cancel).await?;
        self.next_poll = Instant::now() + jittered(self.interval);
        Ok(Wake::Activity)
    }
}

/// Pick IDLE when the server advertises it, polling otherwise.
pub fn strategy_for(session: &dyn MailSession, idle_timeout: Duration, poll_interval: Duration) -> Box<dyn WaitForActivity> {
    if session.supports_idle() {
        Box::new(IdleWait::new(idle_timeout))
    } else {
        Box::new(PollWait::new(poll_interval))
    }
}

pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> SyncResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}
