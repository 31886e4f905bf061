//! Periodic background tasks: heartbeat, peer discovery, inbox service.
//!
//! Each loop ticks immediately on start, then sleeps its interval (plus
//! optional jitter) between ticks. Cancellation is observed during the sleep,
//! so a loop stops within one interval of the token being cancelled, and a
//! tick failure never terminates the loop.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::AgentSession;

/// Drive `tick` at a fixed cadence until `cancel` fires.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    jitter: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(task = name, ?interval, "periodic task started");
    loop {
        tick().await;

        let delay = interval + sample_jitter(jitter);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task = name, "periodic task stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn sample_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Spawn the session's three background loops. The returned handles complete
/// after `cancel` fires.
pub fn spawn_all(session: &Arc<AgentSession>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        spawn_heartbeat(session.clone(), cancel.clone()),
        spawn_discovery(session.clone(), cancel.clone()),
        spawn_inbox_service(session.clone(), cancel.clone()),
    ]
}

/// Best-effort liveness pings. Failures are logged inside the tick and never
/// stop the loop.
pub fn spawn_heartbeat(session: Arc<AgentSession>, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = session.config().heartbeat_interval;
    let jitter = session.config().loop_jitter;
    tokio::spawn(run_periodic("heartbeat", interval, jitter, cancel, move || {
        let session = session.clone();
        async move { session.heartbeat("running", None).await }
    }))
}

/// Peer discovery refresh: full cache replacement per cycle.
pub fn spawn_discovery(session: Arc<AgentSession>, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = session.config().discovery_interval;
    let jitter = session.config().loop_jitter;
    tokio::spawn(run_periodic("discovery", interval, jitter, cancel, move || {
        let session = session.clone();
        async move { session.refresh_peers().await }
    }))
}

/// Inbox polling: route requests to handlers, leave awaited replies alone.
pub fn spawn_inbox_service(
    session: Arc<AgentSession>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = session.config().poll_interval;
    let jitter = session.config().loop_jitter;
    tokio::spawn(run_periodic("inbox", interval, jitter, cancel, move || {
        let session = session.clone();
        async move { session.service_inbox_once().await }
    }))
}
