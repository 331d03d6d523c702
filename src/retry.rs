//! Bounded retry with exponential backoff for publish and token operations.

use std::future::Future;
use std::time::Duration;

use crate::schedule::jittered;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Config allowing `attempts` total tries, including the first.
    pub fn attempts(attempts: u32) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            ..Self::default()
        }
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// The operation is retried up to `config.max_retries` times, with exponentially
/// increasing, jittered delays between attempts (capped at `config.max_delay`).
/// `what` names the operation in log lines.
///
/// Returns the result of the first successful attempt, or the last error if all
/// retries are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempts += 1;
                if attempts > config.max_retries {
                    return Err(e);
                }

                let wait = jittered(delay).min(config.max_delay);
                tracing::warn!(
                    attempt = attempts,
                    of = config.max_retries + 1,
                    error = %e,
                    "{} failed, retrying in {:?}",
                    what,
                    wait
                );

                tokio::time::sleep(wait).await;

                // Exponential backoff with cap
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
}
