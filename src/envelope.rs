//! The `"<kind>:<jsonPayload>"` content convention.
//!
//! Every relayed message body is a kind tag, a single colon, and a serialized
//! JSON payload. The kind identifies the logical message type; the payload
//! schema is kind-specific but must carry the originating `request_id` so
//! responses can be correlated back to their request.

use serde_json::Value;

/// Field inside every payload that carries the correlation id.
pub const REQUEST_ID_FIELD: &str = "request_id";

/// The kind tags used by one logical peer call: the request we send and the
/// two reply kinds the callee may answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallKinds {
    pub request: String,
    pub response: String,
    pub error: String,
}

impl CallKinds {
    pub fn new(
        request: impl Into<String>,
        response: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
            error: error.into(),
        }
    }
}

/// Encode a payload under a kind tag.
pub fn encode(kind: &str, payload: &Value) -> String {
    format!("{}:{}", kind, payload)
}

/// Split message content into `(kind, raw_payload)`.
///
/// Only the first colon delimits; payloads routinely contain colons of their
/// own. Returns `None` for content that does not follow the convention.
pub fn split(content: &str) -> Option<(&str, &str)> {
    let (kind, rest) = content.split_once(':')?;
    if kind.is_empty() {
        return None;
    }
    Some((kind, rest))
}

/// Extract the correlation id from a parsed payload, if present.
pub fn request_id(payload: &Value) -> Option<&str> {
    payload.get(REQUEST_ID_FIELD).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_split_round_trips() {
        let payload = json!({"request_id": "r-1", "ideas": ["a", "b"]});
        let content = encode("validate_ideas", &payload);

        let (kind, raw) = split(&content).unwrap();
        assert_eq!(kind, "validate_ideas");
        let parsed: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn split_uses_only_first_colon() {
        let (kind, raw) = split(r#"note:{"text":"a:b:c"}"#).unwrap();
        assert_eq!(kind, "note");
        assert_eq!(raw, r#"{"text":"a:b:c"}"#);
    }

    #[test]
    fn split_rejects_unconventional_content() {
        assert!(split("no delimiter here").is_none());
        assert!(split(":missing kind").is_none());
        assert!(split("").is_none());
    }

    #[test]
    fn request_id_reads_payload_field() {
        assert_eq!(request_id(&json!({"request_id": "r-9"})), Some("r-9"));
        assert_eq!(request_id(&json!({"request_id": 9})), None);
        assert_eq!(request_id(&json!({})), None);
    }
}
