//! The agent session: one registered instance and everything it owns.
//!
//! All mutable state — identity, credential, peer cache, pending-request
//! table, processed-message set — lives on [`AgentSession`] and is shared by
//! reference into the periodic tasks. Nothing here is a process-wide global.

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::correlate::{
    await_correlated, CorrelationError, Outcome, PendingRequests, PendingStats, ProcessedSet,
};
use crate::dispatch::{send_with_retry, CallError, RetryPolicy};
use crate::envelope::{self, CallKinds, REQUEST_ID_FIELD};
use crate::handlers::{MethodHandler, MethodRegistry};
use crate::peers::{discover_with_retry, DiscoveryRetry, PeerCache, PeerFilter, PeerRecord};
use crate::platform::types::{
    InboxMessage, InstanceId, OutboundMessage, PingRequest, RegisterRequest,
};
use crate::platform::{NetworkFailure, PlatformClient, PlatformError};

/// Identity bound at registration. Immutable for the session's lifetime.
#[derive(Clone)]
pub struct AgentIdentity {
    /// Local name this process registered under.
    pub local_name: String,
    /// Platform-issued instance id.
    pub instance_id: InstanceId,
    /// Instance-scoped credential issued at registration.
    pub api_key: String,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("local_name", &self.local_name)
            .field("instance_id", &self.instance_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Why registration failed. Not retried at this layer; the caller decides
/// whether to retry registration as a whole.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("platform has no agents available to attach to")]
    NoAgentsAvailable,

    #[error("registration failed with HTTP {0}")]
    HttpFailure(u16),

    #[error("network failure during registration: {0}")]
    NetworkFailure(NetworkFailure),

    #[error("malformed registration response: {0}")]
    Malformed(String),

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Why a full peer call (delivery plus correlated wait) failed. The variants
/// stay distinguishable so callers can fall back correctly: falling back to
/// independent work is right for "not found" or "unreachable", wrong for
/// "the peer explicitly declined".
#[derive(Debug, Error)]
pub enum PeerCallError {
    #[error("request payload must be a JSON object")]
    PayloadNotObject,

    #[error(transparent)]
    Delivery(#[from] CallError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// A registered agent instance.
pub struct AgentSession {
    config: Config,
    client: PlatformClient,
    identity: AgentIdentity,
    registry: MethodRegistry,
    peers: PeerCache,
    processed: ProcessedSet,
    pending: PendingRequests,
    retry: RetryPolicy,
    discovery_retry: DiscoveryRetry,
}

impl AgentSession {
    /// Register with the platform and build the session.
    ///
    /// The platform requires a pre-existing agent descriptor to attach the
    /// instance to; the first available one is used. The registry's declared
    /// methods are submitted as part of the instance metadata.
    pub async fn connect(
        config: Config,
        registry: MethodRegistry,
    ) -> Result<Arc<Self>, RegistrationError> {
        let client = PlatformClient::new(&config).map_err(RegistrationError::Client)?;
        let identity = register(&client, &config, &registry).await?;
        info!(
            instance_id = %identity.instance_id,
            name = %identity.local_name,
            methods = registry.len(),
            "registered with platform"
        );

        let retry = RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        };
        let peers = PeerCache::new(config.discovery_interval);

        Ok(Arc::new(Self {
            client,
            identity,
            registry,
            peers,
            processed: ProcessedSet::new(),
            pending: PendingRequests::new(),
            retry,
            discovery_retry: DiscoveryRetry::default(),
            config,
        }))
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters over this session's peer calls.
    pub async fn stats(&self) -> PendingStats {
        self.pending.stats().await
    }

    /// Cached peers (non-stale), ordered by display name.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot().await
    }

    /// Cached peers advertising a capability.
    pub async fn find_peers(&self, capability: &str) -> Vec<PeerRecord> {
        self.peers.find_by_capability(capability).await
    }

    /// One discovery refresh cycle: fetch with retry, then fully replace the
    /// cache. Failures leave the cache as-is; staleness filtering covers the
    /// rest. Driven by the discovery task.
    pub async fn refresh_peers(&self) {
        let filter = PeerFilter {
            capability: None,
            exclude_self: true,
        };
        let records = self.discover_now(&filter).await;
        self.peers.replace(records).await;
    }

    /// On-demand discovery with retry, bypassing the cache. Exhaustion yields
    /// an empty list: "no peers right now" is a normal state.
    pub async fn discover_now(&self, filter: &PeerFilter) -> Vec<PeerRecord> {
        discover_with_retry(
            &self.client,
            filter,
            Some(&self.identity.instance_id),
            Some(&self.identity.api_key),
            &self.discovery_retry,
        )
        .await
    }

    /// Best-effort liveness ping. Failures are logged and swallowed: the
    /// agent must keep running even when the platform is unreachable.
    pub async fn heartbeat(&self, status: &str, metadata: Option<Value>) {
        let request = PingRequest {
            instance_id: self.identity.instance_id.clone(),
            status: status.to_string(),
            metadata,
        };
        if let Err(e) = self.client.ping(&request, &self.identity.api_key).await {
            warn!(error = %e, "heartbeat failed; will try again next cycle");
        }
    }

    /// Call a method on a peer and wait for its correlated response.
    ///
    /// The payload must be a JSON object; the generated request id is
    /// embedded into it before delivery and checked against every candidate
    /// reply. Delivery retries per the session's retry policy; the wait runs
    /// for `response_timeout` at the configured poll cadence.
    pub async fn call_peer(
        &self,
        target: &InstanceId,
        kinds: &CallKinds,
        mut payload: Value,
    ) -> Result<Value, PeerCallError> {
        let Some(fields) = payload.as_object_mut() else {
            return Err(PeerCallError::PayloadNotObject);
        };

        // The reservation must cover delivery as well as the wait: the
        // waiter's clock only starts once delivery finishes, and if the
        // expiry sweep dropped the entry first, the inbox service loop would
        // consume the reply as unroutable. Re-armed to the real window below.
        let reservation = self.config.response_timeout
            + self.config.poll_interval
            + self.retry.max_elapsed(self.config.call_timeout);
        let request_id = self.pending.begin(target, kinds, reservation).await;
        fields.insert(
            REQUEST_ID_FIELD.to_string(),
            Value::String(request_id.as_str().to_string()),
        );

        let message = OutboundMessage {
            to_instance_id: target.clone(),
            message_type: "request".to_string(),
            content: envelope::encode(&kinds.request, &payload),
            priority: 3,
            metadata: Some(json!({
                "sender": self.identity.local_name,
                "sender_instance_id": self.identity.instance_id,
                "collaboration_kind": kinds.request,
            })),
        };

        debug!(target = %target, kind = %kinds.request, request_id = %request_id, "dispatching peer call");

        if let Err(e) =
            send_with_retry(&self.client, &message, &self.identity.api_key, &self.retry).await
        {
            self.pending.complete(&request_id, Outcome::Failed).await;
            return Err(e.into());
        }

        // Delivery landed; the wait window starts now. One extra poll
        // interval keeps the reservation alive through the final fetch.
        self.pending
            .rearm(
                &request_id,
                self.config.response_timeout + self.config.poll_interval,
            )
            .await;

        let result = await_correlated(
            &self.client,
            &self.processed,
            &self.identity.instance_id,
            &self.identity.api_key,
            &request_id,
            kinds,
            self.config.response_timeout,
            self.config.poll_interval,
        )
        .await;

        let outcome = match &result {
            Ok(_) => Outcome::Fulfilled,
            Err(CorrelationError::Timeout(_)) => Outcome::TimedOut,
            Err(_) => Outcome::Failed,
        };
        self.pending.complete(&request_id, outcome).await;

        result.map_err(Into::into)
    }

    /// One pass of the inbox service loop: fetch, route registered request
    /// kinds to their handlers, reply, and drop unroutable messages. Reply
    /// kinds some outstanding call is waiting for are left untouched.
    pub async fn service_inbox_once(&self) {
        self.pending.sweep_expired().await;

        let messages = match self
            .client
            .fetch_messages(&self.identity.instance_id, &self.identity.api_key)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "inbox fetch failed; will poll again");
                return;
            }
        };

        let reserved = self.pending.expected_reply_kinds().await;

        for message in messages {
            if self.processed.contains(&message.id).await {
                continue;
            }

            let Some((kind, raw)) = envelope::split(&message.content) else {
                self.processed.insert(message.id.clone()).await;
                debug!(message_id = %message.id, "dropping message without kind prefix");
                continue;
            };

            if let Some(handler) = self.registry.get(kind) {
                // Commit to the message before any side effect so a failed
                // reply cannot cause the handler to run twice.
                if !self.processed.insert(message.id.clone()).await {
                    continue;
                }
                self.handle_request(handler.clone(), &message, raw).await;
            } else if reserved.contains(kind) {
                // Belongs to a waiter in call_peer.
                continue;
            } else {
                self.processed.insert(message.id.clone()).await;
                warn!(kind, message_id = %message.id, "no handler for incoming kind, dropping");
            }
        }
    }

    /// Run one handler invocation and send the reply envelope.
    async fn handle_request(
        &self,
        handler: Arc<dyn MethodHandler>,
        message: &InboxMessage,
        raw_payload: &str,
    ) {
        let Some(reply_to) = message.from_instance_id.clone() else {
            warn!(
                kind = handler.name(),
                message_id = %message.id,
                "request has no sender, cannot reply"
            );
            return;
        };

        let (request_id, result) = match serde_json::from_str::<Value>(raw_payload) {
            Ok(payload) => {
                let rid = envelope::request_id(&payload).map(str::to_string);
                info!(kind = handler.name(), from = %reply_to, "handling peer request");
                (rid, handler.handle(payload).await)
            }
            Err(e) => (
                None,
                Err(anyhow::anyhow!("request payload malformed: {}", e)),
            ),
        };

        let (reply_kind, mut reply_payload) = match result {
            Ok(value) if value.is_object() => (handler.response_kind(), value),
            Ok(value) => (handler.response_kind(), json!({ "result": value })),
            Err(e) => {
                warn!(kind = handler.name(), error = %e, "handler failed");
                (handler.error_kind(), json!({ "error": e.to_string() }))
            }
        };
        if let Some(rid) = request_id {
            reply_payload[REQUEST_ID_FIELD] = Value::String(rid);
        }

        let reply = OutboundMessage {
            to_instance_id: reply_to,
            message_type: "response".to_string(),
            content: envelope::encode(reply_kind, &reply_payload),
            priority: 3,
            metadata: Some(json!({ "sender": self.identity.local_name })),
        };

        // The request is already marked processed; if the reply is lost the
        // caller's timeout covers it.
        if let Err(e) =
            send_with_retry(&self.client, &reply, &self.identity.api_key, &self.retry).await
        {
            warn!(error = %e, "failed to deliver reply");
        }
    }
}

/// The registration handshake: find an attachable agent descriptor, submit
/// instance metadata, read back the instance id and scoped credential.
async fn register(
    client: &PlatformClient,
    config: &Config,
    registry: &MethodRegistry,
) -> Result<AgentIdentity, RegistrationError> {
    let global_key = config.platform_api_key.as_deref();

    let agents = client
        .list_agents(global_key)
        .await
        .map_err(registration_error)?;
    let Some(descriptor) = agents.first() else {
        return Err(RegistrationError::NoAgentsAvailable);
    };
    debug!(agent_id = %descriptor.id, "attaching to platform agent");

    let request = RegisterRequest {
        agent_id: descriptor.id.clone(),
        instance_name: format!("{}-{}", config.agent_name, chrono::Utc::now().timestamp()),
        endpoint_url: config.endpoint_url.clone(),
        status: "running".to_string(),
        capabilities: config.capabilities.clone(),
        methods: registry.declared_methods(),
    };

    let response = client
        .register(&request, global_key)
        .await
        .map_err(registration_error)?;

    Ok(AgentIdentity {
        local_name: config.agent_name.clone(),
        instance_id: response.instance.id,
        api_key: response.security.api_key,
    })
}

fn registration_error(err: PlatformError) -> RegistrationError {
    match err {
        PlatformError::Http { status, .. } => RegistrationError::HttpFailure(status),
        PlatformError::Network(failure) => RegistrationError::NetworkFailure(failure),
        PlatformError::Malformed(e) => RegistrationError::Malformed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Shared state for the simulated platform.
    #[derive(Default)]
    struct Platform {
        /// Messages waiting in the registered instance's inbox.
        inbox: Mutex<Vec<Value>>,
        /// Bodies posted to the relay endpoint.
        sent: Mutex<Vec<Value>>,
        /// When set, validate_ideas requests get an automatic
        /// validation_response enqueued into the inbox.
        auto_respond: bool,
        /// Simulated relay latency before the message is accepted.
        relay_delay: Duration,
    }

    async fn relay(State(state): State<Arc<Platform>>, Json(body): Json<Value>) -> Json<Value> {
        if !state.relay_delay.is_zero() {
            tokio::time::sleep(state.relay_delay).await;
        }
        state.sent.lock().await.push(body.clone());
        if state.auto_respond {
            if let Some(rest) = body["content"]
                .as_str()
                .and_then(|c| c.strip_prefix("validate_ideas:"))
            {
                let payload: Value = serde_json::from_str(rest).unwrap();
                let reply_content = format!(
                    "validation_response:{}",
                    json!({"request_id": payload["request_id"], "verdict": "PROCEED"})
                );
                state.inbox.lock().await.push(json!({
                    "id": 100,
                    "from_instance_id": body["to_instance_id"],
                    "content": reply_content,
                }));
            }
        }
        Json(json!({"messageId": 42}))
    }

    async fn messages(State(state): State<Arc<Platform>>) -> Json<Value> {
        let inbox = state.inbox.lock().await.clone();
        Json(json!({ "messages": inbox }))
    }

    /// Start the simulated platform. Returns its base URL, shared state, and
    /// the server task handle (abort it to simulate the platform going away).
    async fn start_platform(
        state: Arc<Platform>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let router = Router::new()
            .route(
                "/api/agents",
                get(|| async { Json(json!({"agents": [{"id": 1, "name": "stub-agent"}]})) }),
            )
            .route(
                "/api/webhook/register",
                post(|| async {
                    Json(json!({
                        "instance": {"id": 5, "instance_name": "peerlink-agent-1"},
                        "security": {"api_key": "k-123"},
                    }))
                }),
            )
            .route("/api/webhook/ping", post(|| async { Json(json!({"ok": true})) }))
            .route("/api/agents/message", post(relay))
            .route("/api/agents/:id/messages", get(messages))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    fn fast_config(base: &str) -> Config {
        let mut config = Config::new(base);
        config.response_timeout = Duration::from_secs(2);
        config.poll_interval = Duration::from_millis(50);
        config.max_retries = 1;
        config
    }

    struct Validator;

    #[async_trait]
    impl MethodHandler for Validator {
        fn name(&self) -> &str {
            "validate_ideas"
        }
        fn description(&self) -> &str {
            "Validate ideas"
        }
        fn response_kind(&self) -> &str {
            "validation_response"
        }
        fn error_kind(&self) -> &str {
            "validation_error"
        }
        async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
            let count = payload
                .get("ideas")
                .and_then(Value::as_array)
                .map(Vec::len)
                .ok_or_else(|| anyhow::anyhow!("ideas list empty"))?;
            Ok(json!({"verdict": "PROCEED", "idea_count": count}))
        }
    }

    #[tokio::test]
    async fn connect_binds_identity_and_credential() {
        let state = Arc::new(Platform::default());
        let (base, _server) = start_platform(state).await;

        let session = AgentSession::connect(fast_config(&base), MethodRegistry::new())
            .await
            .unwrap();

        let identity = session.identity();
        assert_eq!(identity.instance_id.as_str(), "5");
        assert_eq!(identity.api_key, "k-123");
        assert_eq!(identity.local_name, "peerlink-agent");
    }

    #[tokio::test]
    async fn connect_fails_when_no_agents_attachable() {
        let router = Router::new().route(
            "/api/agents",
            get(|| async { Json(json!({"agents": []})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let err = AgentSession::connect(
            fast_config(&format!("http://{}", addr)),
            MethodRegistry::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RegistrationError::NoAgentsAvailable));
    }

    #[tokio::test]
    async fn call_peer_round_trips_through_relay() {
        let state = Arc::new(Platform {
            auto_respond: true,
            ..Platform::default()
        });
        let (base, _server) = start_platform(state.clone()).await;

        let session = AgentSession::connect(fast_config(&base), MethodRegistry::new())
            .await
            .unwrap();

        let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
        let payload = session
            .call_peer(
                &InstanceId::from("9"),
                &kinds,
                json!({"ideas": ["solar charger"], "problem": "off-grid power"}),
            )
            .await
            .unwrap();

        assert_eq!(payload["verdict"], "PROCEED");

        // The relayed request embedded the request id it was correlated by.
        let sent = state.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let content = sent[0]["content"].as_str().unwrap();
        let raw = content.strip_prefix("validate_ideas:").unwrap();
        let request: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(
            request["request_id"],
            payload["request_id"],
            "response correlated to a different request id"
        );

        let stats = session.stats().await;
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn slow_delivery_does_not_forfeit_reply_to_inbox_service() {
        // The relay holds the request longer than the whole response window,
        // so the waiter's clock starts only after its nominal expiry. The
        // concurrently running inbox service must still leave the reply for
        // the waiter instead of dropping it as unroutable.
        let state = Arc::new(Platform {
            auto_respond: true,
            relay_delay: Duration::from_millis(150),
            ..Platform::default()
        });
        let (base, _server) = start_platform(state.clone()).await;

        let mut config = fast_config(&base);
        config.response_timeout = Duration::from_millis(100);
        config.poll_interval = Duration::from_millis(20);
        let session = AgentSession::connect(config, MethodRegistry::new())
            .await
            .unwrap();

        let service = {
            let session = session.clone();
            tokio::spawn(async move {
                loop {
                    session.service_inbox_once().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
        };

        let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
        let payload = session
            .call_peer(
                &InstanceId::from("9"),
                &kinds,
                json!({"ideas": ["solar charger"]}),
            )
            .await
            .unwrap();
        service.abort();

        assert_eq!(payload["verdict"], "PROCEED");
        let stats = session.stats().await;
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(stats.timed_out, 0);
    }

    #[tokio::test]
    async fn call_peer_rejects_non_object_payload() {
        let state = Arc::new(Platform::default());
        let (base, _server) = start_platform(state).await;
        let session = AgentSession::connect(fast_config(&base), MethodRegistry::new())
            .await
            .unwrap();

        let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
        let err = session
            .call_peer(&InstanceId::from("9"), &kinds, json!(["not", "an", "object"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerCallError::PayloadNotObject));
    }

    #[tokio::test]
    async fn call_peer_times_out_without_response() {
        let state = Arc::new(Platform::default()); // auto_respond off
        let (base, _server) = start_platform(state).await;

        let mut config = fast_config(&base);
        config.response_timeout = Duration::from_millis(300);
        let session = AgentSession::connect(config, MethodRegistry::new())
            .await
            .unwrap();

        let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
        let err = session
            .call_peer(&InstanceId::from("9"), &kinds, json!({"ideas": []}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PeerCallError::Correlation(CorrelationError::Timeout(_))
        ));
        assert_eq!(session.stats().await.timed_out, 1);
    }

    #[tokio::test]
    async fn inbox_service_routes_requests_and_replies_once() {
        let state = Arc::new(Platform::default());
        state.inbox.lock().await.push(json!({
            "id": 7,
            "from_instance_id": 2,
            "content": format!(
                "validate_ideas:{}",
                json!({"request_id": "caller-1", "ideas": ["a", "b", "c"]})
            ),
        }));
        let (base, _server) = start_platform(state.clone()).await;

        let mut registry = MethodRegistry::new();
        registry.register(Arc::new(Validator)).unwrap();
        let session = AgentSession::connect(fast_config(&base), registry)
            .await
            .unwrap();

        session.service_inbox_once().await;

        {
            let sent = state.sent.lock().await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0]["to_instance_id"], json!("2"));
            let content = sent[0]["content"].as_str().unwrap();
            let raw = content.strip_prefix("validation_response:").unwrap();
            let reply: Value = serde_json::from_str(raw).unwrap();
            assert_eq!(reply["idea_count"], 3);
            assert_eq!(reply["request_id"], "caller-1");
        }

        // Second pass: same inbox content, nothing reprocessed.
        session.service_inbox_once().await;
        assert_eq!(state.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn inbox_service_replies_with_error_kind_on_handler_failure() {
        let state = Arc::new(Platform::default());
        state.inbox.lock().await.push(json!({
            "id": 8,
            "from_instance_id": 2,
            "content": format!("validate_ideas:{}", json!({"request_id": "caller-2"})),
        }));
        let (base, _server) = start_platform(state.clone()).await;

        let mut registry = MethodRegistry::new();
        registry.register(Arc::new(Validator)).unwrap();
        let session = AgentSession::connect(fast_config(&base), registry)
            .await
            .unwrap();

        session.service_inbox_once().await;

        let sent = state.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let content = sent[0]["content"].as_str().unwrap();
        let raw = content.strip_prefix("validation_error:").unwrap();
        let reply: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(reply["request_id"], "caller-2");
        assert!(reply["error"].as_str().unwrap().contains("ideas list empty"));
    }

    #[tokio::test]
    async fn inbox_service_leaves_awaited_reply_kinds_alone() {
        let state = Arc::new(Platform::default());
        let (base, _server) = start_platform(state.clone()).await;

        let session = AgentSession::connect(fast_config(&base), MethodRegistry::new())
            .await
            .unwrap();

        // An outstanding call is waiting for validation_response.
        let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
        let request_id = session
            .pending
            .begin(&InstanceId::from("9"), &kinds, Duration::from_secs(30))
            .await;
        state.inbox.lock().await.push(json!({
            "id": 11,
            "from_instance_id": 9,
            "content": format!(
                "validation_response:{}",
                json!({"request_id": request_id.as_str(), "verdict": "PROCEED"})
            ),
        }));

        session.service_inbox_once().await;

        // Not consumed by the service loop; the waiter can still claim it.
        assert!(!session.processed.contains(&"11".into()).await);
    }
}
