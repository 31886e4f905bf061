//! # Peerlink
//!
//! An agent-to-agent collaboration layer over a message-relay platform.
//!
//! The platform offers only primitive operations: register an instance, ping,
//! list peers, relay a message, poll an inbox. This library builds an async
//! RPC abstraction on top of that polling transport:
//! - Registration binds the process to a platform agent and yields an
//!   instance id plus a scoped credential
//! - A periodic heartbeat keeps the instance listed as alive, best-effort
//! - A discovery loop maintains a process-local peer cache
//! - Peer calls are delivered with classified retry and exponential backoff
//! - Responses are correlated back to callers by embedded request ids, since
//!   the transport has no reply channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink::{config::Config, handlers::MethodRegistry, session::AgentSession};
//! use peerlink::envelope::CallKinds;
//! use serde_json::json;
//!
//! let session = AgentSession::connect(Config::from_env()?, MethodRegistry::new()).await?;
//! let kinds = CallKinds::new("validate_ideas", "validation_response", "validation_error");
//! let verdict = session
//!     .call_peer(&peer_id, &kinds, json!({"ideas": ["solar charger"]}))
//!     .await?;
//! ```

pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod envelope;
pub mod handlers;
pub mod peers;
pub mod platform;
pub mod session;
pub mod tasks;

pub use config::Config;
pub use session::{AgentSession, PeerCallError, RegistrationError};
