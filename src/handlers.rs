//! Callable methods this agent exposes to its peers.
//!
//! Incoming requests are routed through a registry keyed by request kind,
//! validated when handlers are added, and declared to the platform at
//! registration — there is no open-ended string switch anywhere.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::envelope::CallKinds;

/// A method peers can invoke on this instance via the relay.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Request kind tag, e.g. `validate_ideas`.
    fn name(&self) -> &str;

    /// Human-readable description declared to the platform.
    fn description(&self) -> &str;

    /// Reply kind for successful results, e.g. `validation_response`.
    fn response_kind(&self) -> &str;

    /// Reply kind for failures, e.g. `validation_error`.
    fn error_kind(&self) -> &str;

    /// Handle one request payload and produce the response payload.
    /// The correlation id is reattached by the service loop, not here.
    async fn handle(&self, payload: Value) -> anyhow::Result<Value>;

    /// The kind triple this handler serves.
    fn call_kinds(&self) -> CallKinds {
        CallKinds::new(self.name(), self.response_kind(), self.error_kind())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method kind {0:?} is already registered")]
    Duplicate(String),

    /// Kind tags share message content with a colon delimiter, so they can
    /// never contain one themselves.
    #[error("invalid method kind {0:?}")]
    InvalidKind(String),
}

/// Registry of the methods this agent serves.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, rejecting duplicate or malformed kind tags.
    pub fn register(&mut self, handler: Arc<dyn MethodHandler>) -> Result<(), RegistryError> {
        for kind in [handler.name(), handler.response_kind(), handler.error_kind()] {
            if kind.is_empty() || kind.contains(':') {
                return Err(RegistryError::InvalidKind(kind.to_string()));
            }
        }
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn MethodHandler>> {
        self.handlers.get(kind)
    }

    /// Declared method map sent with the registration request.
    pub fn declared_methods(&self) -> HashMap<String, String> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.clone(), handler.description().to_string()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
