//! Scripted in-memory mail server for listener and supervisor tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConnection;
use crate::credentials::{Credential, Secret};
use crate::error::{SyncError, SyncResult};

use super::{Activity, FetchedMessage, FolderStatus, MailConnector, MailSession};

pub struct FakeFolder {
    pub generation: String,
    pub uid_next: u32,
    /// `None` bodies simulate a server returning a message without data
    pub messages: BTreeMap<u32, Option<Vec<u8>>>,
}

#[derive(Default)]
pub struct FakeState {
    pub folders: HashMap<String, FakeFolder>,
    /// Passwords or access tokens the server accepts
    pub accepted: HashSet<String>,
    pub supports_idle: bool,
    pub connects: usize,
    pub auth_failures: usize,
    /// Network failures injected into the next connects
    pub fail_connects: usize,
    /// Fetch fails after this many more fetched messages
    pub fail_fetch_after: Option<usize>,
    pub fetched: Vec<u32>,
    pub noops: usize,
    /// Folders opened, in order. The fake only knows read-only opens.
    pub examined: Vec<String>,
    /// UID SEARCH never answers while set
    pub hang_search: bool,
    /// Folders with an untagged EXISTS not yet seen by their session
    pending_exists: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeServer {
    pub state: Arc<Mutex<FakeState>>,
    notify: Arc<Notify>,
}

pub fn message(uid: u32) -> Vec<u8> {
    format!(
        "From: sender{uid}@example.com\r\n\
         To: support@example.com\r\n\
         Subject: Message {uid}\r\n\
         Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
         Message-ID: <msg-{uid}@example.com>\r\n\
         \r\n\
         Body of message {uid}."
    )
    .into_bytes()
}

impl FakeState {
    fn append(&mut self, folder: &str, raw: Option<Vec<u8>>) -> u32 {
        let Some(f) = self.folders.get_mut(folder) else {
            panic!("no folder {folder}");
        };
        let uid = f.uid_next;
        f.uid_next += 1;
        f.messages.insert(uid, raw);
        self.pending_exists.insert(folder.to_string());
        uid
    }
}

impl FakeServer {
    pub fn new(secret: &str) -> Self {
        let server = Self::default();
        server.lock().accepted.insert(secret.to_string());
        server
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_idle(self, idle: bool) -> Self {
        self.lock().supports_idle = idle;
        self
    }

    /// Create or replace a folder holding `uids`, all well formed.
    pub fn folder(&self, name: &str, generation: &str, uids: impl IntoIterator<Item = u32>) {
        let messages: BTreeMap<u32, Option<Vec<u8>>> =
            uids.into_iter().map(|uid| (uid, Some(message(uid)))).collect();
        let uid_next = messages.keys().next_back().map(|u| u + 1).unwrap_or(1);
        self.lock().folders.insert(
            name.to_string(),
            FakeFolder {
                generation: generation.to_string(),
                uid_next,
                messages,
            },
        );
    }

    /// Append a message, waking sessions in IDLE.
    pub fn deliver(&self, folder: &str, raw: Option<Vec<u8>>) -> u32 {
        let uid = self.lock().append(folder, raw);
        self.notify.notify_waiters();
        uid
    }

    /// Append a well formed message whose EXISTS reaches the session as a
    /// queued response only, without waking IDLE.
    pub fn deliver_quietly(&self, folder: &str) -> u32 {
        let mut state = self.lock();
        let uid = match state.folders.get(folder) {
            Some(f) => f.uid_next,
            None => panic!("no folder {folder}"),
        };
        state.append(folder, Some(message(uid)))
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.lock().fetched.clone()
    }
}

#[async_trait]
impl MailConnector for FakeServer {
    async fn connect(
        &self,
        _provider: &ProviderConnection,
        credential: &Credential,
        _timeout: Duration,
    ) -> SyncResult<Box<dyn MailSession>> {
        let mut state = self.lock();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(SyncError::TransientNetwork("connection refused".into()));
        }
        let presented = match &credential.secret {
            Secret::Password(p) => p.clone(),
            Secret::Bearer { access_token, .. } => access_token.clone(),
        };
        if !state.accepted.contains(&presented) {
            state.auth_failures += 1;
            return Err(SyncError::AuthExpired("AUTHENTICATIONFAILED".into()));
        }
        Ok(Box::new(FakeSession {
            server: self.clone(),
            selected: None,
            supports_idle: state.supports_idle,
        }))
    }
}

pub struct FakeSession {
    server: FakeServer,
    selected: Option<String>,
    supports_idle: bool,
}

impl FakeSession {
    fn selected(&self) -> SyncResult<String> {
        self.selected
            .clone()
            .ok_or_else(|| SyncError::Protocol("no folder selected".into()))
    }
}

#[async_trait]
impl MailSession for FakeSession {
    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn list_folders(&mut self) -> SyncResult<Vec<String>> {
        let mut names: Vec<String> = self.server.lock().folders.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn examine(&mut self, folder: &str) -> SyncResult<FolderStatus> {
        let mut state = self.server.lock();
        state.examined.push(folder.to_string());
        let f = state
            .folders
            .get(folder)
            .ok_or_else(|| SyncError::Protocol(format!("no mailbox '{}'", folder)))?;
        let status = FolderStatus {
            generation: f.generation.clone(),
            uid_next: Some(f.uid_next),
            exists: f.messages.len() as u32,
        };
        drop(state);
        self.selected = Some(folder.to_string());
        Ok(status)
    }

    async fn search_after(&mut self, after: u32) -> SyncResult<Vec<u32>> {
        let folder = self.selected()?;
        if self.server.lock().hang_search {
            std::future::pending::<()>().await;
        }
        let state = self.server.lock();
        Ok(state.folders[&folder]
            .messages
            .keys()
            .copied()
            .filter(|uid| *uid > after)
            .collect())
    }

    async fn fetch(&mut self, uids: &[u32]) -> SyncResult<Vec<FetchedMessage>> {
        let folder = self.selected()?;
        let mut state = self.server.lock();
        let mut out = Vec::new();
        for uid in uids {
            if let Some(remaining) = state.fail_fetch_after.as_mut() {
                if *remaining == 0 {
                    state.fail_fetch_after = None;
                    return Err(SyncError::TransientNetwork("connection reset".into()));
                }
                *remaining -= 1;
            }
            let Some(raw) = state.folders[&folder].messages.get(uid).cloned() else {
                continue;
            };
            state.fetched.push(*uid);
            out.push(FetchedMessage {
                uid: *uid,
                size: raw.as_ref().map(|r| r.len() as u32),
                raw,
            });
        }
        Ok(out)
    }

    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> SyncResult<Activity> {
        let folder = self.selected.clone().unwrap_or_default();
        let notify = Arc::clone(&self.server.notify);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.server.lock().pending_exists.remove(&folder) {
            return Ok(Activity::Changed);
        }

        let outcome = tokio::select! {
            _ = &mut notified => Ok(Activity::Changed),
            _ = tokio::time::sleep(timeout) => Ok(Activity::TimedOut),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        };
        self.server.lock().pending_exists.remove(&folder);
        outcome
    }

    async fn noop(&mut self) -> SyncResult<()> {
        self.server.lock().noops += 1;
        Ok(())
    }

    async fn logout(&mut self) {}
}
