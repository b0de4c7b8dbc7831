//! Retrying, timed delivery of one message.
//!
//! Each attempt is bounded by `attempt_timeout`; an attempt that times out is
//! abandoned and its late reply discarded. Between attempts the transport
//! waits `attempt * base_delay` (linear, so three attempts stay within a
//! predictable bound). Replies with `success: false` are final unless marked
//! retryable, in which case they count as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use authsync_core::{Payload, SyncAction, SyncConfig, SyncMessage, SyncResponse};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;

/// Timeout and retry settings for one [`SyncTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout(),
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }

    /// Pause after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Longest a `send` can take: every attempt times out.
    pub fn worst_case_latency(&self) -> Duration {
        let waits: Duration = (1..self.max_attempts).map(|a| self.delay_after(a)).sum();
        self.attempt_timeout * self.max_attempts + waits
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub response: SyncResponse,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The central process understood the message and declined it.
    #[error("{action} rejected: {reason}")]
    Rejected { action: SyncAction, reason: String },
    /// Every attempt timed out or failed at the channel level.
    #[error("{action} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        action: SyncAction,
        attempts: u32,
        last_error: String,
    },
}

impl TransportError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Retrying sender used by page agents and surfaces.
#[derive(Clone)]
pub struct SyncTransport {
    channel: Arc<dyn MessageChannel>,
    policy: RetryPolicy,
    /// Label for log lines ("page", "popup", ...).
    context: String,
}

impl SyncTransport {
    pub fn new(channel: Arc<dyn MessageChannel>, policy: RetryPolicy) -> Self {
        Self {
            channel,
            policy,
            context: "sync".into(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `(action, payload)` and wait for an acknowledgement.
    pub async fn send(
        &self,
        action: SyncAction,
        payload: Option<Payload>,
    ) -> Result<Ack, TransportError> {
        let message = SyncMessage::new(uuid::Uuid::new_v4().to_string(), action, payload);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            debug!(
                "[{}] sending {} {} (attempt {}/{})",
                self.context, action, message.id, attempt, self.policy.max_attempts
            );

            let outcome =
                tokio::time::timeout(self.policy.attempt_timeout, self.channel.deliver(message.clone()))
                    .await;

            match outcome {
                Ok(Ok(response)) if response.success => {
                    if attempt > 1 {
                        info!(
                            "[{}] {} delivered after {} attempts",
                            self.context, action, attempt
                        );
                    }
                    return Ok(Ack { response, attempts: attempt });
                }
                Ok(Ok(response)) if response.retryable => {
                    last_error = response
                        .error
                        .unwrap_or_else(|| "receiver fault".to_string());
                }
                Ok(Ok(response)) => {
                    let reason = response
                        .error
                        .unwrap_or_else(|| "no reason given".to_string());
                    warn!("[{}] {} rejected: {}", self.context, action, reason);
                    return Err(TransportError::Rejected { action, reason });
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!("no reply within {:?}", self.policy.attempt_timeout);
                }
            }

            warn!(
                "[{}] {} attempt {}/{} failed: {}",
                self.context, action, attempt, self.policy.max_attempts, last_error
            );
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        Err(TransportError::Exhausted {
            action,
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}
