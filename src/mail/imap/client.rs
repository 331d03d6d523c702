//! Read-only folder operations on an authenticated session. Folders are
//! opened with EXAMINE and fetched with `BODY.PEEK[]`.

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::UnsolicitedResponse;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::constants::IDLE_DONE_TIMEOUT_SECS;
use crate::error::{SyncError, SyncResult};
use crate::mail::{Activity, FetchedMessage, FolderStatus, MailSession};

use super::ImapSession;

/// Message data items for a full fetch. `BODY.PEEK[]` leaves `\Seen` alone.
const FETCH_ITEMS: &str = "(UID RFC822.SIZE BODY.PEEK[])";

pub(crate) struct ImapMailSession {
    /// Taken out while IDLE owns the connection
    session: Option<ImapSession>,
    supports_idle: bool,
}

impl ImapMailSession {
    pub fn new(session: ImapSession, supports_idle: bool) -> Self {
        Self {
            session: Some(session),
            supports_idle,
        }
    }

    fn session(&mut self) -> SyncResult<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::TransientNetwork("IMAP session lost".into()))
    }
}

/// Empty the queue of untagged responses. True when any announced new mail.
fn take_new_mail(session: &ImapSession) -> bool {
    let mut new_mail = false;
    while let Ok(response) = session.unsolicited_responses.try_recv() {
        if matches!(response, UnsolicitedResponse::Exists(_) | UnsolicitedResponse::Recent(_)) {
            new_mail = true;
        }
    }
    new_mail
}

/// Compact UID set: "1:3,7,9:10"
fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range_str(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_str(start, end));
    parts.join(",")
}

fn range_str(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn list_folders(&mut self) -> SyncResult<Vec<String>> {
        let session = self.session()?;
        let mut folders = Vec::new();
        let mut list_stream = session.list(Some(""), Some("*")).await?;

        while let Some(result) = list_stream.next().await {
            let name = result?;
            folders.push(name.name().to_string());
        }
        folders.sort();
        Ok(folders)
    }

    async fn examine(&mut self, folder: &str) -> SyncResult<FolderStatus> {
        let mailbox = self.session()?.examine(folder).await?;

        let generation = mailbox
            .uid_validity
            .ok_or_else(|| SyncError::Protocol(format!("no UIDVALIDITY for '{}'", folder)))?
            .to_string();

        Ok(FolderStatus {
            generation,
            uid_next: mailbox.uid_next,
            exists: mailbox.exists,
        })
    }

    async fn search_after(&mut self, after: u32) -> SyncResult<Vec<u32>> {
        let query = format!("UID {}:*", after.saturating_add(1));
        let found = self.session()?.uid_search(&query).await?;

        // "n:*" always matches the highest UID, even when it is below n.
        let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > after).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uids: &[u32]) -> SyncResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.session()?;
        let mut messages = session.uid_fetch(uid_set(uids), FETCH_ITEMS).await?;

        let mut fetched = Vec::with_capacity(uids.len());
        while let Some(result) = messages.next().await {
            let fetch = result?;
            // Untagged FETCH without a UID is a flag update for some other message.
            let Some(uid) = fetch.uid else {
                continue;
            };
            fetched.push(FetchedMessage {
                uid,
                raw: fetch.body().map(|b| b.to_vec()),
                size: fetch.size,
            });
        }
        drop(messages);

        fetched.sort_by_key(|m| m.uid);
        fetched.dedup_by_key(|m| m.uid);
        tracing::debug!(
            "Fetched {} messages (requested {})",
            fetched.len(),
            uids.len()
        );
        Ok(fetched)
    }

    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> SyncResult<Activity> {
        let session = self
            .session
            .take()
            .ok_or_else(|| SyncError::TransientNetwork("IMAP session lost".into()))?;

        // EXISTS seen during an earlier command is a push that already happened.
        if take_new_mail(&session) {
            self.session = Some(session);
            return Ok(Activity::Changed);
        }

        let handshake = Duration::from_secs(IDLE_DONE_TIMEOUT_SECS);
        let mut idle = session.idle();
        match tokio::time::timeout(handshake, idle.init()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if let Ok(Ok(session)) = tokio::time::timeout(handshake, idle.done()).await {
                    self.session = Some(session);
                }
                return Err(e.into());
            }
            Err(_) => {
                return Err(SyncError::TransientNetwork(format!(
                    "IDLE not confirmed within {:?}",
                    handshake
                )));
            }
        }

        let outcome = {
            let (idle_future, _stop_source) = idle.wait();
            let idle_with_timeout = tokio::time::timeout(timeout, idle_future);

            tokio::select! {
                result = idle_with_timeout => match result {
                    Ok(Ok(IdleResponse::NewData(_))) => Ok(Activity::Changed),
                    Ok(Ok(_)) => Ok(Activity::TimedOut),
                    Ok(Err(e)) => Err(SyncError::from(e)),
                    Err(_) => Ok(Activity::TimedOut),
                },
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
            }
        };

        // Get the session back; without DONE the connection is unusable.
        let session = match tokio::time::timeout(handshake, idle.done()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                if matches!(outcome, Err(SyncError::Cancelled)) {
                    return outcome;
                }
                return Err(e.into());
            }
            Err(_) => {
                if matches!(outcome, Err(SyncError::Cancelled)) {
                    return outcome;
                }
                return Err(SyncError::TransientNetwork(format!(
                    "DONE not confirmed within {:?}",
                    handshake
                )));
            }
        };

        // EXISTS can land between the end of the wait and the DONE reply.
        let outcome = match outcome {
            Ok(Activity::TimedOut) if take_new_mail(&session) => Ok(Activity::Changed),
            other => other,
        };
        self.session = Some(session);
        outcome
    }

    async fn noop(&mut self) -> SyncResult<()> {
        self.session()?.noop().await?;
        Ok(())
    }

    async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
    }
}
