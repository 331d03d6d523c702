//! Service-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable. Most of these are the
//! defaults behind an `INBOXD_*` environment variable or a config key.

/// Folder monitored when a provider lists no folder filters.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// IDLE connection timeout in seconds before refresh.
/// RFC 2177 asks clients to re-issue IDLE at least every 29 minutes.
pub const IDLE_TIMEOUT_SECS: u64 = 29 * 60;

/// Poll interval in seconds for servers without IDLE.
pub const POLL_INTERVAL_SECS: u64 = 60;

/// NOOP heartbeat interval in seconds while waiting for activity.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 120;

/// TCP connect + TLS handshake + login timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Upper bound in seconds on one IMAP command (SELECT, SEARCH, FETCH, NOOP).
pub const IO_TIMEOUT_SECS: u64 = 60;

/// Time allowed in seconds for the server to confirm IDLE or DONE.
pub const IDLE_DONE_TIMEOUT_SECS: u64 = 15;

/// Maximum number of messages fetched from the server in one batch.
pub const MAX_MESSAGES_PER_SYNC: usize = 50;

/// Size of the catch-up window on first connect or after a UIDVALIDITY change.
pub const CATCH_UP_WINDOW: usize = 50;

/// Lease time-to-live in seconds.
pub const LEASE_TTL_SECS: u64 = 90;

/// Lease renewal interval in seconds. Must stay well below `LEASE_TTL_SECS`.
pub const LEASE_RENEW_SECS: u64 = 30;

/// Upper bound in milliseconds on the best-effort lease release at shutdown.
pub const LEASE_RELEASE_TIMEOUT_MS: u64 = 2_000;

/// Initial reconnect delay in milliseconds.
pub const RECONNECT_BASE_MS: u64 = 2_000;

/// Maximum reconnect delay in seconds.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Consecutive failures tolerated before a listener is suspended.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Malformed messages tolerated in one fetch batch before the batch fails.
pub const MAX_SKIPS_PER_BATCH: usize = 25;

/// Maximum spread in milliseconds of the per-folder startup stagger.
pub const STARTUP_STAGGER_MS: u64 = 5_000;

/// Fractional jitter band applied to poll, heartbeat and renewal intervals.
pub const INTERVAL_JITTER: f64 = 0.2;

/// Publish attempts per message before the batch is failed.
pub const PUBLISH_ATTEMPTS: u32 = 4;

/// Access tokens closer than this to expiry are refreshed before use.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 120;

/// Lifetime assumed for access tokens whose response omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3_600;

/// Restart delay in seconds after a listener exits unexpectedly.
pub const LISTENER_RESTART_SECS: u64 = 10;

/// Time allowed in seconds for listeners to wind down at shutdown.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 15;

/// Service name used for keyring entries.
pub const KEYRING_SERVICE: &str = "inboxd";
