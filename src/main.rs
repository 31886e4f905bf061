//! Peerlink agent entry point.
//!
//! Registers with the platform, runs the background loops, and exposes a
//! single built-in `echo` method so a fresh deployment can be smoke-tested
//! end to end.

use async_trait::async_trait;
use peerlink::handlers::{MethodHandler, MethodRegistry};
use peerlink::session::AgentSession;
use peerlink::{tasks, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Built-in smoke-test method: returns the request payload unchanged.
struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the request payload unchanged"
    }

    fn response_kind(&self) -> &str {
        "echo_response"
    }

    fn error_kind(&self) -> &str {
        "echo_error"
    }

    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        Ok(json!({ "echoed": payload }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(platform = %config.platform_url, agent = %config.agent_name, "loaded configuration");

    let mut registry = MethodRegistry::new();
    registry.register(Arc::new(Echo))?;

    // Register with the platform
    let session = AgentSession::connect(config, registry).await?;

    // Run the heartbeat, discovery, and inbox loops until shutdown
    let cancel = CancellationToken::new();
    let handles = tasks::spawn_all(&session, &cancel);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    let stats = session.stats().await;
    info!(
        fulfilled = stats.fulfilled,
        timed_out = stats.timed_out,
        failed = stats.failed,
        "session finished"
    );

    Ok(())
}
