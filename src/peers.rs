//! Peer records and the process-local discovery cache.
//!
//! The cache is refreshed by full replacement: whatever the platform returns
//! becomes the new cache, so a peer that vanishes from the platform's list
//! vanishes here on the next refresh. On top of that, reads exclude records
//! whose `last_seen` is older than two refresh intervals, so entries cannot
//! go stale indefinitely when refreshes start failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::platform::types::InstanceId;
use crate::platform::{NetworkFailure, PlatformClient, PlatformError};

/// Platform-reported peer liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Running,
    Available,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One discovered peer instance.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerRecord {
    #[serde(rename = "id")]
    pub instance_id: InstanceId,
    #[serde(rename = "instance_name", default)]
    pub display_name: String,
    #[serde(default)]
    pub status: PeerStatus,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    /// Stamped locally when the record is fetched, not sent by the platform.
    #[serde(skip, default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Filter for discovery lookups.
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    pub capability: Option<String>,
    pub exclude_self: bool,
}

/// Process-local peer cache, shared between the discovery loop and callers.
#[derive(Debug)]
pub struct PeerCache {
    peers: RwLock<HashMap<InstanceId, PeerRecord>>,
    refresh_interval: Duration,
}

impl PeerCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            refresh_interval,
        }
    }

    /// Replace the whole cache with a fresh discovery result.
    pub async fn replace(&self, records: Vec<PeerRecord>) {
        let mut peers = self.peers.write().await;
        for record in &records {
            if !peers.contains_key(&record.instance_id) {
                info!(
                    peer = %record.display_name,
                    instance_id = %record.instance_id,
                    "discovered new peer"
                );
            }
        }
        *peers = records
            .into_iter()
            .map(|r| (r.instance_id.clone(), r))
            .collect();
    }

    /// All non-stale peers, ordered by display name for stable iteration.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut result: Vec<PeerRecord> = peers
            .values()
            .filter(|r| !self.is_stale(r))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        result
    }

    /// Non-stale peers advertising a capability tag.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<PeerRecord> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|r| r.has_capability(capability))
            .collect()
    }

    /// Stale means not refreshed within two discovery cycles.
    fn is_stale(&self, record: &PeerRecord) -> bool {
        Utc::now()
            .signed_duration_since(record.last_seen)
            .to_std()
            .map(|age| age > self.refresh_interval * 2)
            .unwrap_or(false)
    }
}

/// Retry schedule for on-demand discovery. Unlike peer call delivery, each
/// failure class has its own fixed delay, and server errors escalate linearly
/// with the attempt number.
#[derive(Debug, Clone)]
pub struct DiscoveryRetry {
    /// Retry attempts beyond the first.
    pub max_retries: u32,
    /// Base delay after a 5xx; multiplied by the attempt number.
    pub server_error_delay: Duration,
    /// Delay after a request timeout.
    pub timeout_delay: Duration,
    /// Delay after a connection failure.
    pub connect_delay: Duration,
}

impl Default for DiscoveryRetry {
    fn default() -> Self {
        Self {
            max_retries: 2,
            server_error_delay: Duration::from_secs(1),
            timeout_delay: Duration::from_millis(500),
            connect_delay: Duration::from_secs(1),
        }
    }
}

/// Discover peers with bounded retries.
///
/// Failure modes collapse to an empty list: callers treat "no peers" as a
/// normal state, not an error. A 404 means the deployment has no discovery
/// endpoint and short-circuits remaining retries.
pub async fn discover_with_retry(
    client: &PlatformClient,
    filter: &PeerFilter,
    self_id: Option<&InstanceId>,
    api_key: Option<&str>,
    policy: &DiscoveryRetry,
) -> Vec<PeerRecord> {
    let exclude = if filter.exclude_self { self_id } else { None };

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            debug!(attempt, max = policy.max_retries, "retrying peer discovery");
        }

        let delay = match client
            .discover(filter.capability.as_deref(), exclude, api_key)
            .await
        {
            Ok(peers) => {
                if attempt > 0 {
                    info!(attempt, "peer discovery succeeded on retry");
                }
                return peers;
            }
            Err(PlatformError::Http { status: 404, .. }) => {
                warn!("peer discovery endpoint not available");
                return Vec::new();
            }
            Err(PlatformError::Http { status, .. }) if status >= 500 => {
                debug!(status, "discovery server error, will retry");
                policy.server_error_delay * (attempt + 1)
            }
            Err(PlatformError::Http { status, .. }) => {
                warn!(status, "peer discovery failed");
                return Vec::new();
            }
            Err(PlatformError::Network(NetworkFailure::Timeout)) => {
                debug!(attempt, "discovery timed out, will retry");
                policy.timeout_delay
            }
            Err(PlatformError::Network(failure)) => {
                debug!(%failure, attempt, "discovery transport failure, will retry");
                policy.connect_delay
            }
            Err(PlatformError::Malformed(e)) => {
                warn!(error = %e, "discovery response unreadable");
                return Vec::new();
            }
        };

        if attempt < policy.max_retries {
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        attempts = policy.max_retries + 1,
        "peer discovery failed after all attempts"
    );
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn record(id: &str, name: &str, caps: &[&str]) -> PeerRecord {
        PeerRecord {
            instance_id: InstanceId::from(id),
            display_name: name.to_string(),
            status: PeerStatus::Running,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn unknown_status_strings_map_to_unknown() {
        let peer: PeerRecord = serde_json::from_value(json!({
            "id": 3,
            "instance_name": "validator-1",
            "status": "hibernating",
            "capabilities": ["validation"]
        }))
        .unwrap();
        assert_eq!(peer.status, PeerStatus::Unknown);

        let peer: PeerRecord =
            serde_json::from_value(json!({"id": 4, "status": "running"})).unwrap();
        assert_eq!(peer.status, PeerStatus::Running);
    }

    #[tokio::test]
    async fn refresh_fully_replaces_cache() {
        let cache = PeerCache::new(Duration::from_secs(60));
        cache
            .replace(vec![record("1", "a", &[]), record("2", "b", &[])])
            .await;
        assert_eq!(cache.snapshot().await.len(), 2);

        // Peer 2 disappeared from the platform's list.
        cache.replace(vec![record("1", "a", &[])]).await;
        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].instance_id.as_str(), "1");
    }

    #[tokio::test]
    async fn stale_records_excluded_from_reads() {
        let cache = PeerCache::new(Duration::from_secs(60));
        let mut old = record("1", "ancient", &["validation"]);
        old.last_seen = Utc::now() - chrono::Duration::seconds(300);
        cache.replace(vec![old, record("2", "fresh", &["validation"])]).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].display_name, "fresh");
        assert_eq!(cache.find_by_capability("validation").await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_by_display_name() {
        let cache = PeerCache::new(Duration::from_secs(60));
        cache
            .replace(vec![
                record("9", "zeta", &[]),
                record("3", "alpha", &[]),
                record("5", "midway", &[]),
            ])
            .await;
        let names: Vec<String> = cache
            .snapshot()
            .await
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, vec!["alpha", "midway", "zeta"]);
    }

    async fn discovery_platform(fail_first: u32, fail_status: u16) -> (String, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let seen = counter.clone();
        let router = Router::new().route(
            "/api/agents/discover",
            get(move || {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    if n < fail_first {
                        Err(axum::http::StatusCode::from_u16(fail_status).unwrap())
                    } else {
                        Ok(Json(json!({
                            "agents": [{"id": 8, "instance_name": "validator-1", "status": "running"}]
                        })))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), counter)
    }

    fn fast_retry() -> DiscoveryRetry {
        DiscoveryRetry {
            max_retries: 2,
            server_error_delay: Duration::from_millis(5),
            timeout_delay: Duration::from_millis(5),
            connect_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn discovery_retries_server_errors() {
        let (base, counter) = discovery_platform(1, 502).await;
        let client = PlatformClient::new(&Config::new(&base)).unwrap();

        let peers = discover_with_retry(
            &client,
            &PeerFilter::default(),
            None,
            None,
            &fast_retry(),
        )
        .await;

        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "validator-1");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn discovery_404_short_circuits() {
        let (base, counter) = discovery_platform(u32::MAX, 404).await;
        let client = PlatformClient::new(&Config::new(&base)).unwrap();

        let peers = discover_with_retry(
            &client,
            &PeerFilter::default(),
            None,
            None,
            &fast_retry(),
        )
        .await;

        assert!(peers.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_exhaustion_yields_empty_list() {
        let client = PlatformClient::new(&Config::new("http://127.0.0.1:9")).unwrap();
        let peers = discover_with_retry(
            &client,
            &PeerFilter::default(),
            None,
            None,
            &fast_retry(),
        )
        .await;
        assert!(peers.is_empty());
    }
}
