//! Mail server access used by the folder listeners.
//!
//! Listeners only talk to a `MailSession`, so the IMAP implementation can be
//! swapped for a scripted one in tests.

pub mod imap;
pub mod parser;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConnection;
use crate::credentials::Credential;
use crate::error::SyncResult;

pub use imap::ImapConnector;

/// Result of selecting a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderStatus {
    /// UIDVALIDITY as an opaque string
    pub generation: String,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

/// One message returned by a fetch.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Full RFC 822 bytes; `None` when the server returned no body
    pub raw: Option<Vec<u8>>,
    pub size: Option<u32>,
}

/// Why an IDLE wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// The server pushed an untagged response for the folder
    Changed,
    TimedOut,
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Open an authenticated session for `provider`.
    ///
    /// A credential rejected by the server is reported as
    /// `SyncError::AuthExpired` so the caller can refresh and retry.
    async fn connect(
        &self,
        provider: &ProviderConnection,
        credential: &Credential,
        timeout: Duration,
    ) -> SyncResult<Box<dyn MailSession>>;
}

#[async_trait]
pub trait MailSession: Send {
    fn supports_idle(&self) -> bool;

    async fn list_folders(&mut self) -> SyncResult<Vec<String>>;

    /// Open `folder` read-only. Flags and contents are never changed.
    async fn examine(&mut self, folder: &str) -> SyncResult<FolderStatus>;

    /// UIDs strictly greater than `after` in the selected folder, ascending.
    async fn search_after(&mut self, after: u32) -> SyncResult<Vec<u32>>;

    /// Fetch full messages without setting `\Seen`, ascending by UID.
    async fn fetch(&mut self, uids: &[u32]) -> SyncResult<Vec<FetchedMessage>>;

    /// IDLE until the server reports a change, `timeout` passes, or `cancel` fires.
    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> SyncResult<Activity>;

    async fn noop(&mut self) -> SyncResult<()>;

    async fn logout(&mut self);
}
