//! Typed HTTP client for the collaboration platform.
//!
//! One thin method per platform endpoint; no retry logic here. Transport
//! failures are classified into [`NetworkFailure`] tags so callers can decide
//! what is retryable, and non-2xx statuses are surfaced with their body for
//! the same reason.

pub mod types;

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::peers::PeerRecord;
use types::{
    AgentDescriptor, AgentsResponse, InboxMessage, InstanceId, MessageReceipt, MessagesResponse,
    OutboundMessage, PingRequest, RegisterRequest, RegisterResponse,
};

/// Transport-level failure, before any HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed")]
    ConnectionRefused,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outcome of a single platform call. Retry policy lives in the callers.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("network failure: {0}")]
    Network(NetworkFailure),

    #[error("platform returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("malformed platform response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// HTTP client for one platform deployment.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    /// Timeout for short calls (ping, discovery, inbox fetch, registration).
    http_timeout: Duration,
    /// Timeout for relayed peer calls, which may block on the target agent.
    call_timeout: Duration,
}

impl PlatformClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("peerlink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.platform_url.clone(),
            http_timeout: config.http_timeout,
            call_timeout: config.call_timeout,
        })
    }

    /// List platform-side agent descriptors available for attachment.
    pub async fn list_agents(
        &self,
        api_key: Option<&str>,
    ) -> Result<Vec<AgentDescriptor>, PlatformError> {
        let url = format!("{}/api/agents", self.base_url);
        let req = self.http.get(&url).timeout(self.http_timeout);
        let body = self.execute(with_key(req, api_key)).await?;
        let parsed: AgentsResponse = serde_json::from_str(&body)?;
        Ok(parsed.agents)
    }

    /// Register an instance against an existing platform agent descriptor.
    pub async fn register(
        &self,
        request: &RegisterRequest,
        api_key: Option<&str>,
    ) -> Result<RegisterResponse, PlatformError> {
        let url = format!("{}/api/webhook/register", self.base_url);
        let req = self.http.post(&url).timeout(self.http_timeout).json(request);
        let body = self.execute(with_key(req, api_key)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Send a liveness ping. The response body is ignored.
    pub async fn ping(&self, request: &PingRequest, api_key: &str) -> Result<(), PlatformError> {
        let url = format!("{}/api/webhook/ping", self.base_url);
        let req = self.http.post(&url).timeout(self.http_timeout).json(request);
        self.execute(with_key(req, Some(api_key))).await?;
        Ok(())
    }

    /// One discovery fetch. Retries are handled by `peers::discover_with_retry`.
    pub async fn discover(
        &self,
        capability: Option<&str>,
        exclude: Option<&InstanceId>,
        api_key: Option<&str>,
    ) -> Result<Vec<PeerRecord>, PlatformError> {
        #[derive(serde::Deserialize)]
        struct DiscoverResponse {
            #[serde(default)]
            agents: Vec<PeerRecord>,
        }

        let url = format!("{}/api/agents/discover", self.base_url);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(capability) = capability {
            query.push(("capability", capability.to_string()));
        }
        if let Some(exclude) = exclude {
            query.push(("exclude", exclude.to_string()));
        }

        let req = self
            .http
            .get(&url)
            .query(&query)
            .timeout(self.http_timeout);
        let body = self.execute(with_key(req, api_key)).await?;
        let parsed: DiscoverResponse = serde_json::from_str(&body)?;
        debug!(peers = parsed.agents.len(), "discovery fetch complete");
        Ok(parsed.agents)
    }

    /// Relay one message to a peer instance. Uses the longer call timeout:
    /// some platforms hold the request until the target acknowledges.
    pub async fn send_message(
        &self,
        message: &OutboundMessage,
        api_key: &str,
    ) -> Result<MessageReceipt, PlatformError> {
        let url = format!("{}/api/agents/message", self.base_url);
        let req = self.http.post(&url).timeout(self.call_timeout).json(message);
        let body = self.execute(with_key(req, Some(api_key))).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetch the full inbox for an instance. De-duplication is the caller's job.
    pub async fn fetch_messages(
        &self,
        instance_id: &InstanceId,
        api_key: &str,
    ) -> Result<Vec<InboxMessage>, PlatformError> {
        let url = format!("{}/api/agents/{}/messages", self.base_url, instance_id);
        let req = self.http.get(&url).timeout(self.http_timeout);
        let body = self.execute(with_key(req, Some(api_key))).await?;
        let parsed: MessagesResponse = serde_json::from_str(&body)?;
        Ok(parsed.messages)
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<String, PlatformError> {
        let response = req.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(PlatformError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn with_key(req: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => req.header("X-API-Key", key),
        None => req,
    }
}

fn classify_transport(err: reqwest::Error) -> PlatformError {
    let failure = if err.is_timeout() {
        NetworkFailure::Timeout
    } else if err.is_connect() {
        NetworkFailure::ConnectionRefused
    } else {
        NetworkFailure::Transport(err.to_string())
    };
    PlatformError::Network(failure)
}
