//! Error taxonomy shared by the listener, resolver and publisher.

use thiserror::Error;

/// Failure of a credential lookup or refresh.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No secret of the required kind is stored for the provider.
    #[error("no {kind} stored for provider '{provider}'")]
    Missing { provider: String, kind: String },
    /// The token endpoint rejected the refresh token. Terminal for this version.
    #[error("refresh token rejected: {0}")]
    Revoked(String),
    /// The token endpoint could not be reached or answered with a server error.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),
    /// Credential storage failed.
    #[error("credential storage: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Revoked(_) | AuthError::Missing { .. })
    }
}

/// Failure to hand an event to the downstream bus.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("event channel closed")]
    Closed,
    #[error("serialization: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures a folder listener can run into, classified by how it recovers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connect, read, write or timeout failure. Retried with backoff.
    #[error("network: {0}")]
    TransientNetwork(String),
    /// The server rejected our credentials. Triggers one refresh-and-retry.
    #[error("authentication rejected: {0}")]
    AuthExpired(String),
    /// Credentials are unusable. Terminal, the listener suspends.
    #[error("authentication revoked: {0}")]
    AuthRevoked(String),
    /// Unexpected server response. Retried at connection level.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Another instance owns the folder, or our lease expired.
    #[error("lease lost for {0}")]
    LeaseLost(String),
    /// The downstream bus did not acknowledge after bounded retries.
    #[error("publish failed: {0}")]
    PublishFailure(#[from] PublishError),
    /// Cursor or lease storage failed.
    #[error("storage: {0}")]
    Storage(String),
    /// The listener was asked to stop.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether this error should suspend the listener instead of backing off.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::AuthRevoked(_))
    }
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unavailable(msg) => SyncError::TransientNetwork(msg),
            AuthError::Storage(msg) => SyncError::Storage(msg),
            other => SyncError::AuthRevoked(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::TransientNetwork(err.to_string())
    }
}

impl From<async_imap::error::Error> for SyncError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match err {
            Error::Io(e) => SyncError::TransientNetwork(e.to_string()),
            Error::ConnectionLost => SyncError::TransientNetwork("connection lost".into()),
            Error::No(msg) | Error::Bad(msg) => SyncError::Protocol(msg),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
