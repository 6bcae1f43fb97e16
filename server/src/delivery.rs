//! Outbound chat delivery.
//!
//! [`WebhookDelivery`] posts `{"text": ...}` to the incoming-webhook URL a
//! space registered. Transient failures are retried:
//!
//! - 429 honours `Retry-After`, falling back to the backoff delay
//! - 5xx and connection errors use exponential backoff with ±25% jitter
//! - any other non-success status is a permanent rejection

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::store::SpaceStore;
use crate::types::SubscriberId;

/// Initial retry delay.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Maximum delivery attempts per message.
const MAX_ATTEMPTS: u32 = 5;

/// HTTP request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends formatted messages to subscribers.
#[async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn deliver(&self, subscriber: &SubscriberId, message: &str) -> Result<(), DeliveryError>;
}

/// Retry settings for [`WebhookDelivery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_delay: INITIAL_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    text: &'a str,
}

/// Delivers messages to the webhook URL stored for each space.
pub struct WebhookDelivery {
    client: Client,
    store: Arc<dyn SpaceStore>,
    retry: RetryPolicy,
}

impl WebhookDelivery {
    /// Creates a delivery adapter with the default retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Lookup`] if the HTTP client cannot be built.
    pub fn new(store: Arc<dyn SpaceStore>) -> Result<Self, DeliveryError> {
        Self::with_retry(store, RetryPolicy::default())
    }

    /// Creates a delivery adapter with a custom retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Lookup`] if the HTTP client cannot be built.
    pub fn with_retry(store: Arc<dyn SpaceStore>, retry: RetryPolicy) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeliveryError::Lookup(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            store,
            retry,
        })
    }

    async fn target_url(&self, subscriber: &SubscriberId) -> Result<String, DeliveryError> {
        self.store
            .load(subscriber)
            .await
            .map_err(|e| DeliveryError::Lookup(e.to_string()))?
            .and_then(|config| config.webhook_url)
            .ok_or_else(|| DeliveryError::NoTarget(subscriber.clone()))
    }

    async fn post_with_retry(&self, url: &str, message: &str) -> Result<(), DeliveryError> {
        let body = ChatMessage { text: message };
        let mut delay = self.retry.initial_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(attempt = attempts, "Posting chat message");

            let last_error = match self.client.post(url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(());
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        if let Some(retry_after) = parse_retry_after(&response) {
                            delay = retry_after.min(self.retry.max_delay);
                        }
                        format!("rate limited with status {status}")
                    } else if status.is_server_error() {
                        let message = response.text().await.unwrap_or_default();
                        format!("status {status}: {message}")
                    } else {
                        let message = response.text().await.unwrap_or_default();
                        return Err(DeliveryError::Rejected {
                            status: status.as_u16(),
                            message,
                        });
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => format!("connection error: {e}"),
                Err(e) => format!("request failed: {e}"),
            };

            if attempts >= self.retry.max_attempts {
                return Err(DeliveryError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            }

            let wait = add_jitter(delay);
            warn!(
                attempt = attempts,
                error = %last_error,
                delay_ms = wait.as_millis() as u64,
                "Chat delivery failed, will retry"
            );
            sleep(wait).await;
            delay = (delay * 2).min(self.retry.max_delay);
        }
    }
}

#[async_trait]
impl ChatDelivery for WebhookDelivery {
    async fn deliver(&self, subscriber: &SubscriberId, message: &str) -> Result<(), DeliveryError> {
        let url = self.target_url(subscriber).await?;
        self.post_with_retry(&url, message).await?;
        debug!(subscriber = %subscriber, "Message delivered");
        Ok(())
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    if duration.is_zero() {
        return duration;
    }
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
}
