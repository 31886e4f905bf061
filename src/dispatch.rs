//! Request delivery with classified retry and capped exponential backoff.
//!
//! Every outcome of a delivery attempt falls into one of three buckets:
//! retryable (408, 429, 5xx, any transport failure), terminal (404, other
//! 4xx, malformed receipt), or success. A success on a retried attempt is an
//! ordinary success. Exhausting the retry budget surfaces the last observed
//! error, never a generic failure, unless no attempt produced one at all.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::platform::types::{InstanceId, MessageReceipt, OutboundMessage};
use crate::platform::{NetworkFailure, PlatformClient, PlatformError};

/// Backoff schedule for peer call delivery.
///
/// The base schedule starts at `initial_delay` and multiplies by
/// `backoff_multiplier` after each retry, capped at `max_delay`. Rate-limit
/// responses double the current delay instead, under their own higher cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts beyond the first.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied after each retry (typically 1.5).
    pub backoff_multiplier: f64,
    /// Cap for the base schedule.
    pub max_delay: Duration,
    /// Cap for the rate-limit doubling schedule.
    pub rate_limit_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            rate_limit_max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Total delivery attempts, including the first.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Advance the base schedule by one step.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Advance the rate-limit schedule by one step.
    pub fn next_rate_limit_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.rate_limit_max_delay)
    }

    /// Upper bound on how long one delivery can take under this policy:
    /// every attempt spending its full per-attempt timeout, with the longest
    /// possible sleep between attempts.
    pub fn max_elapsed(&self, attempt_timeout: Duration) -> Duration {
        attempt_timeout * self.total_attempts() + self.rate_limit_max_delay * self.max_retries
    }
}

/// Why a peer call delivery ultimately failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// The platform does not know the target instance. Never retried.
    #[error("target instance {0} not found")]
    NotFound(InstanceId),

    /// The platform reported a relay timeout (408) on every attempt.
    #[error("peer call timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// Rate limited (429) on the final attempt.
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Server-side failure (5xx) on the final attempt.
    #[error("server error {status} after {attempts} attempts")]
    ServerError { status: u16, attempts: u32 },

    /// Any other 4xx: the platform rejected the call outright. Never retried.
    #[error("peer call rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Transport-level failure on the final attempt.
    #[error("network failure after {attempts} attempts: {failure}")]
    Network {
        failure: NetworkFailure,
        attempts: u32,
    },

    /// The platform accepted the message but returned an unreadable receipt.
    #[error("malformed delivery receipt: {0}")]
    MalformedReceipt(String),

    /// No attempt produced a classifiable error. Should not happen in practice.
    #[error("all delivery attempts failed")]
    Exhausted,
}

/// Deliver one relayed message, retrying per `policy`.
pub async fn send_with_retry(
    client: &PlatformClient,
    message: &OutboundMessage,
    api_key: &str,
    policy: &RetryPolicy,
) -> Result<MessageReceipt, CallError> {
    let total = policy.total_attempts();
    let mut delay = policy.initial_delay;
    let mut last_error: Option<CallError> = None;

    for attempt in 1..=total {
        let mut rate_limited = false;
        if attempt > 1 {
            debug!(
                attempt,
                total,
                target = %message.to_instance_id,
                "retrying peer call delivery"
            );
        }

        match client.send_message(message, api_key).await {
            Ok(receipt) => {
                if attempt > 1 {
                    info!(attempt, target = %message.to_instance_id, "delivery succeeded on retry");
                }
                return Ok(receipt);
            }
            Err(PlatformError::Http { status, body }) => match status {
                404 => return Err(CallError::NotFound(message.to_instance_id.clone())),
                408 => {
                    last_error = Some(CallError::Timeout { attempts: attempt });
                }
                429 => {
                    last_error = Some(CallError::RateLimited { attempts: attempt });
                    rate_limited = true;
                }
                status if status >= 500 => {
                    last_error = Some(CallError::ServerError {
                        status,
                        attempts: attempt,
                    });
                }
                status => {
                    return Err(CallError::Rejected {
                        status,
                        message: extract_error_message(&body, status),
                    })
                }
            },
            Err(PlatformError::Network(failure)) => {
                warn!(%failure, attempt, "delivery failed at transport level");
                last_error = Some(CallError::Network {
                    failure,
                    attempts: attempt,
                });
            }
            Err(PlatformError::Malformed(e)) => {
                return Err(CallError::MalformedReceipt(e.to_string()))
            }
        }

        if attempt < total {
            if rate_limited {
                // Rate limits walk their own schedule: doubled before the
                // sleep, under the higher cap, untouched by the base step.
                delay = policy.next_rate_limit_delay(delay);
                tokio::time::sleep(delay).await;
            } else {
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }

    Err(last_error.unwrap_or(CallError::Exhausted))
}

/// Pull a structured error message out of a 4xx body, if there is one.
fn extract_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {}", status))
}
