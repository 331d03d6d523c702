use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use super::{EventSink, IngestionEvent};
use crate::error::PublishError;

/// POSTs each event as JSON, keyed by an `Idempotency-Key` header.
///
/// A 409 means the receiver already has the event, which counts as an ack.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    authorization: Option<String>,
}

impl HttpSink {
    pub fn new(url: &str, authorization: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            authorization,
        })
    }
}

fn is_ack(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::CONFLICT
}

#[async_trait]
impl EventSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, event: &IngestionEvent) -> Result<(), PublishError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.dedup_key())
            .json(event);
        if let Some(auth) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if is_ack(status) {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_statuses() {
        assert!(is_ack(StatusCode::OK));
        assert!(is_ack(StatusCode::ACCEPTED));
        assert!(is_ack(StatusCode::CONFLICT));
        assert!(!is_ack(StatusCode::BAD_REQUEST));
        assert!(!is_ack(StatusCode::SERVICE_UNAVAILABLE));
    }
}
