//! Canonical ingestion events and their delivery downstream.
//!
//! Delivery is at-least-once: every event carries a dedup key that is stable
//! across redeliveries, and the consumer is expected to drop repeats.

#[cfg(test)]
mod channel;
mod http;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::{PublisherConfig, SinkConfig};
use crate::error::PublishError;
use crate::mail::FetchedMessage;
use crate::mail::parser::{HeaderSummary, parse_summary};
use crate::retry::{RetryConfig, with_retry};

#[cfg(test)]
pub use channel::ChannelSink;
pub use http::HttpSink;

/// Where a listener found a message.
#[derive(Debug, Clone)]
pub struct MessageOrigin<'a> {
    pub tenant: &'a str,
    pub provider: &'a str,
    pub folder: &'a str,
    pub generation: &'a str,
}

/// Raw message reference carried on the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    /// Full RFC 822 bytes, base64 encoded
    Inline { size: usize, base64: String },
    /// Size only; consumers fetch the message themselves
    Omitted { size: usize },
}

/// "Message received" event. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionEvent {
    tenant_id: String,
    provider_id: String,
    folder: String,
    uid: u32,
    generation: String,
    message_id: Option<String>,
    dedup_key: String,
    received_at: DateTime<Utc>,
    headers: HeaderSummary,
    payload: Payload,
}

/// Why a fetched message could not become an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    NoBody,
    Unparseable,
}

impl std::fmt::Display for Malformed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Malformed::NoBody => f.write_str("server returned no message body"),
            Malformed::Unparseable => f.write_str("message headers could not be parsed"),
        }
    }
}

/// Stable idempotency key for a message.
///
/// Uses the Message-ID when present so the same message seen in two
/// generations (or after a rescan) keys the same. Without one, falls back
/// to generation and UID, which is unique within the folder.
pub fn dedup_key(provider: &str, folder: &str, message_id: Option<&str>, generation: &str, uid: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(folder.as_bytes());
    hasher.update([0u8]);
    match message_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            hasher.update(b"mid:");
            hasher.update(id.as_bytes());
        }
        None => {
            hasher.update(format!("uid:{}:{}", generation, uid).as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

impl IngestionEvent {
    pub fn from_fetched(
        origin: &MessageOrigin<'_>,
        message: &FetchedMessage,
        include_raw: bool,
    ) -> Result<Self, Malformed> {
        let raw = message.raw.as_deref().ok_or(Malformed::NoBody)?;
        let headers = parse_summary(raw).ok_or(Malformed::Unparseable)?;

        let size = message.size.map(|s| s as usize).unwrap_or(raw.len());
        let payload = if include_raw {
            Payload::Inline {
                size,
                base64: base64::engine::general_purpose::STANDARD.encode(raw),
            }
        } else {
            Payload::Omitted { size }
        };

        let message_id = headers.message_id.clone();
        Ok(Self {
            tenant_id: origin.tenant.to_string(),
            provider_id: origin.provider.to_string(),
            folder: origin.folder.to_string(),
            uid: message.uid,
            generation: origin.generation.to_string(),
            dedup_key: dedup_key(
                origin.provider,
                origin.folder,
                message_id.as_deref(),
                origin.generation,
                message.uid,
            ),
            message_id,
            received_at: Utc::now(),
            headers,
            payload,
        })
    }

    pub fn dedup_key(&self) -> &str {
        &self.dedup_key
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    #[cfg(test)]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    #[cfg(test)]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    #[cfg(test)]
    pub fn headers(&self) -> &HeaderSummary {
        &self.headers
    }

    #[cfg(test)]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Downstream bus. `deliver` returns only after the bus acknowledged.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &IngestionEvent) -> Result<(), PublishError>;
}

/// JSON lines on stdout
pub struct StdoutSink;

#[async_trait]
impl EventSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn deliver(&self, event: &IngestionEvent) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(&line)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Publishes events through a sink with bounded retries.
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    retry: RetryConfig,
    include_raw: bool,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, attempts: u32, include_raw: bool) -> Self {
        Self {
            sink,
            retry: RetryConfig::attempts(attempts),
            include_raw,
        }
    }

    pub fn from_config(config: &PublisherConfig, attempts: u32) -> anyhow::Result<Self> {
        let sink: Arc<dyn EventSink> = match &config.sink {
            SinkConfig::Stdout => Arc::new(StdoutSink),
            SinkConfig::Http {
                url,
                authorization,
                timeout_secs,
            } => Arc::new(HttpSink::new(
                url,
                authorization.clone(),
                Duration::from_secs(*timeout_secs),
            )?),
        };
        tracing::info!(sink = sink.name(), include_raw = config.include_raw, "Event publisher ready");
        Ok(Self::new(sink, attempts, config.include_raw))
    }

    #[cfg(test)]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn include_raw(&self) -> bool {
        self.include_raw
    }

    /// Deliver one event, retrying transient failures a bounded number of times.
    pub async fn publish(&self, event: &IngestionEvent) -> Result<(), PublishError> {
        with_retry(&self.retry, "Publish", || self.sink.deliver(event)).await?;
        tracing::debug!(
            provider = %event.provider_id,
            folder = %event.folder,
            uid = event.uid,
            dedup_key = %event.dedup_key,
            "Event acknowledged"
        );
        Ok(())
    }
}
