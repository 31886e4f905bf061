//! Response correlation over the polling transport.
//!
//! There is no push channel: a caller that sent a request polls its own inbox
//! until a message arrives whose kind matches the call's reply kinds *and*
//! whose payload carries the caller's request id. Matching on the kind prefix
//! alone is not enough — two outstanding calls of the same kind would race —
//! so the id check is mandatory and prefix-matched messages with a different
//! id are left in place for their own waiters.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{self, CallKinds};
use crate::platform::types::{InstanceId, MessageId};
use crate::platform::PlatformClient;

/// Caller-generated correlation id, unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh id. The kind hint keeps relayed payloads greppable.
    pub fn fresh(kind_hint: &str) -> Self {
        Self(format!("{}-{}", kind_hint, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal outcome of a pending request. Exactly one per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fulfilled,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    kinds: CallKinds,
    target: InstanceId,
    timeout_at: tokio::time::Instant,
}

/// Counters over completed requests plus the current in-flight count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub in_flight: usize,
    pub fulfilled: u64,
    pub timed_out: u64,
    pub failed: u64,
}

/// Table of outstanding calls. Request ids are generated here, so uniqueness
/// holds by construction; completion transitions each request to exactly one
/// terminal outcome.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

#[derive(Debug, Default)]
struct PendingInner {
    in_flight: HashMap<RequestId, PendingEntry>,
    fulfilled: u64,
    timed_out: u64,
    failed: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding call and hand back its fresh id.
    pub async fn begin(
        &self,
        target: &InstanceId,
        kinds: &CallKinds,
        timeout: Duration,
    ) -> RequestId {
        let mut inner = self.inner.lock().await;
        loop {
            let id = RequestId::fresh(&kinds.request);
            if inner.in_flight.contains_key(&id) {
                continue;
            }
            inner.in_flight.insert(
                id.clone(),
                PendingEntry {
                    kinds: kinds.clone(),
                    target: target.clone(),
                    timeout_at: tokio::time::Instant::now() + timeout,
                },
            );
            return id;
        }
    }

    /// Reset an entry's expiry window, measured from now. Used once delivery
    /// has finished and the caller's real wait begins; returns `false` if the
    /// entry is already gone.
    pub async fn rearm(&self, id: &RequestId, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.get_mut(id) {
            Some(entry) => {
                entry.timeout_at = tokio::time::Instant::now() + timeout;
                true
            }
            None => false,
        }
    }

    /// Record the terminal outcome for a request. Returns `false` if the
    /// request was unknown or already completed; the first completion wins.
    pub async fn complete(&self, id: &RequestId, outcome: Outcome) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.in_flight.remove(id) else {
            return false;
        };
        match outcome {
            Outcome::Fulfilled => inner.fulfilled += 1,
            Outcome::TimedOut => inner.timed_out += 1,
            Outcome::Failed => inner.failed += 1,
        }
        debug!(request_id = %id, target = %entry.target, ?outcome, "pending request completed");
        true
    }

    /// Reply kinds some in-flight call is currently waiting for. The inbox
    /// service loop must leave these messages for their waiters.
    pub async fn expected_reply_kinds(&self) -> HashSet<String> {
        let inner = self.inner.lock().await;
        inner
            .in_flight
            .values()
            .flat_map(|e| {
                [e.kinds.response.clone(), e.kinds.error.clone()]
            })
            .collect()
    }

    /// Mark in-flight requests whose window has closed as timed out. Covers
    /// callers that were cancelled mid-wait and never completed their entry.
    pub async fn sweep_expired(&self) -> usize {
        let now = tokio::time::Instant::now();
        let mut inner = self.inner.lock().await;
        let expired: Vec<RequestId> = inner
            .in_flight
            .iter()
            .filter(|(_, e)| now >= e.timeout_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.in_flight.remove(id);
            inner.timed_out += 1;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired pending requests");
        }
        expired.len()
    }

    pub async fn stats(&self) -> PendingStats {
        let inner = self.inner.lock().await;
        PendingStats {
            in_flight: inner.in_flight.len(),
            fulfilled: inner.fulfilled,
            timed_out: inner.timed_out,
            failed: inner.failed,
        }
    }
}

/// De-duplication set of handled inbox message ids.
///
/// A message id goes in here the moment a consumer commits to handling the
/// message, before any side effect that could fail, so a transient failure
/// afterwards can never cause the message to be handled twice.
#[derive(Debug, Default)]
pub struct ProcessedSet {
    inner: Mutex<HashSet<MessageId>>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().await.contains(id)
    }

    /// Returns `true` if the id was newly inserted.
    pub async fn insert(&self, id: MessageId) -> bool {
        self.inner.lock().await.insert(id)
    }
}

/// Why a correlated wait ended without a usable response.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// No matching response arrived within the window.
    #[error("timed out after {0:?} awaiting correlated response")]
    Timeout(Duration),

    /// A reply-kind message arrived but its payload failed to parse.
    /// Malformed input is not transient; surfaced immediately.
    #[error("correlated response payload malformed: {0}")]
    MalformedPayload(String),

    /// The peer answered with its error kind.
    #[error("peer declined the request: {message}")]
    PeerDeclined { message: String },
}

/// Block until a response correlated to `request_id` arrives, or the window
/// closes. Polls the caller's inbox at `poll_interval`; transient fetch
/// failures are logged and polling continues. Returns `Timeout` no earlier
/// than `timeout` and no later than `timeout` plus one poll interval.
pub async fn await_correlated(
    client: &PlatformClient,
    processed: &ProcessedSet,
    instance_id: &InstanceId,
    api_key: &str,
    request_id: &RequestId,
    kinds: &CallKinds,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Value, CorrelationError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client.fetch_messages(instance_id, api_key).await {
            Ok(messages) => {
                for message in messages {
                    if processed.contains(&message.id).await {
                        continue;
                    }
                    let Some((kind, raw)) = envelope::split(&message.content) else {
                        continue;
                    };
                    let is_error = kind == kinds.error;
                    if kind != kinds.response && !is_error {
                        continue;
                    }

                    let payload: Value = match serde_json::from_str(raw) {
                        Ok(v) => v,
                        Err(e) => {
                            // Unattributable: consume it so it is not
                            // re-parsed every cycle, and fail fast.
                            processed.insert(message.id.clone()).await;
                            warn!(
                                message_id = %message.id,
                                kind,
                                error = %e,
                                "reply payload failed to parse"
                            );
                            return Err(CorrelationError::MalformedPayload(e.to_string()));
                        }
                    };

                    match envelope::request_id(&payload) {
                        Some(rid) if rid == request_id.as_str() => {}
                        // Another waiter's reply; leave it unprocessed.
                        _ => continue,
                    }

                    processed.insert(message.id.clone()).await;

                    if is_error {
                        let reason = payload
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("peer reported an error")
                            .to_string();
                        return Err(CorrelationError::PeerDeclined { message: reason });
                    }

                    debug!(
                        request_id = %request_id,
                        from = ?message.from_instance_id,
                        "correlated response received"
                    );
                    return Ok(payload);
                }
            }
            Err(e) => {
                warn!(error = %e, "inbox fetch failed, will poll again");
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(CorrelationError::Timeout(timeout));
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
