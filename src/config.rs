use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CATCH_UP_WINDOW, CONNECT_TIMEOUT_SECS, DEFAULT_FOLDER, HEARTBEAT_INTERVAL_SECS,
    IDLE_TIMEOUT_SECS, IO_TIMEOUT_SECS, LEASE_RENEW_SECS, LEASE_TTL_SECS, MAX_CONSECUTIVE_FAILURES,
    MAX_MESSAGES_PER_SYNC, MAX_RETRY_DELAY_SECS, MAX_SKIPS_PER_BATCH, POLL_INTERVAL_SECS,
    PUBLISH_ATTEMPTS, RECONNECT_BASE_MS,
};
use crate::schedule::BackoffPolicy;

const ENV_CONFIG: &str = "INBOXD_CONFIG";
const ENV_INSTANCE_ID: &str = "INBOXD_INSTANCE_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier written into leases. Generated per process when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// SQLite database holding folder cursors and leases
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConnection>,
}

/// How the IMAP connection is secured
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte (port 993)
    #[default]
    Tls,
    /// Plain connection upgraded with STARTTLS (port 143)
    StartTls,
    /// No encryption. Only for local test servers.
    Plain,
}

/// Authentication method for a provider connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// LOGIN with a stored password
    #[default]
    Password,
    /// XOAUTH2 with an access token minted from a stored refresh token
    OAuth2 {
        /// Token endpoint used for the refresh_token grant
        token_url: String,
        client_id: String,
        #[serde(default)]
        scopes: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsMode,
}

/// One configured mailbox source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConnection {
    /// Stable provider identifier, also the credential storage key
    pub id: String,
    pub tenant: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub imap: ImapConfig,
    pub username: String,
    #[serde(default)]
    pub auth: AuthMethod,
    /// Folder names or glob patterns (`*`, `?`, `[...]`) to monitor
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub tuning: TuningOverrides,
}

impl ProviderConnection {
    /// Configured folder filters, defaulting to the primary folder.
    pub fn folder_filters(&self) -> Vec<String> {
        if self.folders.is_empty() {
            vec![DEFAULT_FOLDER.to_string()]
        } else {
            self.folders.clone()
        }
    }
}

/// Per-provider tuning that overrides the global values
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TuningOverrides {
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_messages_per_sync: Option<usize>,
    #[serde(default)]
    pub keepalive: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuningConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bound on a single IMAP command once connected
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_max_messages_per_sync")]
    pub max_messages_per_sync: usize,
    /// Most recent messages fetched on first connect or after a generation reset
    #[serde(default = "default_catch_up_window")]
    pub catch_up_window: usize,
    /// Send NOOP heartbeats while waiting
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lease_renew_secs")]
    pub lease_renew_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Malformed messages skipped per batch before the batch fails
    #[serde(default = "default_max_skips_per_batch")]
    pub max_skips_per_batch: usize,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            max_messages_per_sync: default_max_messages_per_sync(),
            catch_up_window: default_catch_up_window(),
            keepalive: true,
            poll_interval_secs: default_poll_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            lease_renew_secs: default_lease_renew_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_skips_per_batch: default_max_skips_per_batch(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            publish_attempts: default_publish_attempts(),
        }
    }
}

impl TuningConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lease_renew(&self) -> Duration {
        Duration::from_secs(self.lease_renew_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_secs(self.max_reconnect_delay_secs),
            0.5,
        )
    }

    /// Overlay `INBOXD_*` variables. Unparsable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
                }
            }
        }

        set(&lookup, "INBOXD_CONNECT_TIMEOUT_SECS", &mut self.connect_timeout_secs);
        set(&lookup, "INBOXD_IO_TIMEOUT_SECS", &mut self.io_timeout_secs);
        set(&lookup, "INBOXD_MAX_MESSAGES_PER_SYNC", &mut self.max_messages_per_sync);
        set(&lookup, "INBOXD_CATCH_UP_WINDOW", &mut self.catch_up_window);
        set(&lookup, "INBOXD_KEEPALIVE", &mut self.keepalive);
        set(&lookup, "INBOXD_POLL_INTERVAL_SECS", &mut self.poll_interval_secs);
        set(&lookup, "INBOXD_HEARTBEAT_INTERVAL_SECS", &mut self.heartbeat_interval_secs);
        set(&lookup, "INBOXD_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs);
        set(&lookup, "INBOXD_LEASE_TTL_SECS", &mut self.lease_ttl_secs);
        set(&lookup, "INBOXD_LEASE_RENEW_SECS", &mut self.lease_renew_secs);
        set(&lookup, "INBOXD_MAX_CONSECUTIVE_FAILURES", &mut self.max_consecutive_failures);
        set(&lookup, "INBOXD_MAX_SKIPS_PER_BATCH", &mut self.max_skips_per_batch);
        set(&lookup, "INBOXD_PUBLISH_ATTEMPTS", &mut self.publish_attempts);
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_renew_secs >= self.lease_ttl_secs {
            anyhow::bail!(
                "lease_renew_secs ({}) must be shorter than lease_ttl_secs ({})",
                self.lease_renew_secs,
                self.lease_ttl_secs
            );
        }
        if self.catch_up_window == 0 || self.max_messages_per_sync == 0 {
            anyhow::bail!("catch_up_window and max_messages_per_sync must be positive");
        }
        if self.io_timeout_secs == 0 {
            anyhow::bail!("io_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Global tuning with a provider's overrides applied.
    pub fn for_provider(&self, overrides: &TuningOverrides) -> TuningConfig {
        let mut tuning = self.clone();
        if let Some(secs) = overrides.connect_timeout_secs {
            tuning.connect_timeout_secs = secs;
        }
        if let Some(max) = overrides.max_messages_per_sync {
            tuning.max_messages_per_sync = max;
        }
        if let Some(keepalive) = overrides.keepalive {
            tuning.keepalive = keepalive;
        }
        tuning
    }
}

/// Where ingestion events are delivered
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// JSON lines on stdout
    #[default]
    Stdout,
    /// JSON POST per event
    Http {
        url: String,
        /// Value for the Authorization header
        #[serde(default)]
        authorization: Option<String>,
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherConfig {
    #[serde(default)]
    pub sink: SinkConfig,
    /// Embed the base64 raw message in each event
    #[serde(default)]
    pub include_raw: bool,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    CONNECT_TIMEOUT_SECS
}

fn default_io_timeout_secs() -> u64 {
    IO_TIMEOUT_SECS
}

fn default_max_messages_per_sync() -> usize {
    MAX_MESSAGES_PER_SYNC
}

fn default_catch_up_window() -> usize {
    CATCH_UP_WINDOW
}

fn default_poll_interval_secs() -> u64 {
    POLL_INTERVAL_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}

fn default_idle_timeout_secs() -> u64 {
    IDLE_TIMEOUT_SECS
}

fn default_lease_ttl_secs() -> u64 {
    LEASE_TTL_SECS
}

fn default_lease_renew_secs() -> u64 {
    LEASE_RENEW_SECS
}

fn default_max_consecutive_failures() -> u32 {
    MAX_CONSECUTIVE_FAILURES
}

fn default_max_skips_per_batch() -> usize {
    MAX_SKIPS_PER_BATCH
}

fn default_reconnect_base_ms() -> u64 {
    RECONNECT_BASE_MS
}

fn default_max_reconnect_delay_secs() -> u64 {
    MAX_RETRY_DELAY_SECS
}

fn default_publish_attempts() -> u32 {
    PUBLISH_ATTEMPTS
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("inboxd");
        Ok(dir)
    }

    /// `$INBOXD_CONFIG`, or `config.toml` in the config directory.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("inboxd");
        Ok(dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("state.db")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[providers]]\n\
                 id = \"support\"\n\
                 tenant = \"acme\"\n\
                 username = \"support@acme.example\"\n\n\
                 [providers.imap]\n\
                 server = \"imap.acme.example\"",
                path.display()
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.tuning.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                anyhow::bail!("Duplicate provider id '{}'", provider.id);
            }
            if provider.imap.server.trim().is_empty() {
                anyhow::bail!("Provider '{}' has no IMAP server", provider.id);
            }
            if provider.id.contains('/') || provider.tenant.contains('/') {
                anyhow::bail!("Provider '{}': ids must not contain '/'", provider.id);
            }
            self.tuning
                .for_provider(&provider.tuning)
                .validate()
                .with_context(|| format!("Provider '{}' tuning", provider.id))?;
        }
        self.tuning.validate()
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConnection> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConnection> {
        self.providers.iter().filter(|p| p.enabled)
    }

    /// Lease owner identity for this process.
    ///
    /// Explicit config wins, then `INBOXD_INSTANCE_ID`, then host name plus
    /// pid and a random suffix so two processes never share an identity.
    pub fn instance_id(&self) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        if let Ok(id) = std::env::var(ENV_INSTANCE_ID) {
            return id;
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "inboxd".to_string());
        let mut suffix = [0u8; 4];
        getrandom::fill(&mut suffix).ok();
        let suffix: String = suffix.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}-{}", host, std::process::id(), suffix)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let db = self.database_path()?;
        if let Some(parent) = db.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        Ok(())
    }
}
