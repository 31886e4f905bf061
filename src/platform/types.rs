//! Wire types for the platform REST boundary.
//!
//! The platform is loose about identifier types: some deployments issue
//! numeric instance ids, others UUID strings. `InstanceId` and `MessageId`
//! are opaque newtypes that deserialize from either and always serialize as
//! strings.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Platform-issued instance identifier. Opaque; never interpreted locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        OpaqueId::deserialize(deserializer).map(|id| Self(id.into_string()))
    }
}

/// Platform-assigned message identifier, used only for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        OpaqueId::deserialize(deserializer).map(|id| Self(id.into_string()))
    }
}

/// Raw id as it appears on the wire: JSON number or string.
#[derive(Deserialize)]
#[serde(untagged)]
enum OpaqueId {
    Num(i64),
    Str(String),
}

impl OpaqueId {
    fn into_string(self) -> String {
        match self {
            OpaqueId::Num(n) => n.to_string(),
            OpaqueId::Str(s) => s,
        }
    }
}

/// A platform-side agent descriptor an instance can attach to.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDescriptor {
    pub id: InstanceId,
    #[serde(default)]
    pub name: Option<String>,
}

/// `GET /api/agents` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsResponse {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// `POST /api/webhook/register` request body.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub agent_id: InstanceId,
    pub instance_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Declared callable methods: name -> human description.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub methods: HashMap<String, String>,
}

/// `POST /api/webhook/register` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub instance: InstanceInfo,
    pub security: SecurityInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    #[serde(default)]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityInfo {
    pub api_key: String,
}

/// `POST /api/webhook/ping` request body.
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub instance_id: InstanceId,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `POST /api/agents/message` request body.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub to_instance_id: InstanceId,
    pub message_type: String,
    pub content: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `POST /api/agents/message` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReceipt {
    #[serde(rename = "messageId", default)]
    pub message_id: Option<MessageId>,
}

/// A message fetched from this instance's inbox.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    /// Older platform builds send `from` instead of `from_instance_id`.
    #[serde(alias = "from", default)]
    pub from_instance_id: Option<InstanceId>,
    #[serde(default)]
    pub content: String,
    #[serde(alias = "created_at", default)]
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET /api/agents/{id}/messages` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub messages: Vec<InboxMessage>,
}
