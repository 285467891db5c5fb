//! Keep-alive for queued requests.

use std::sync::Arc;

use tracing::trace;

use super::registry::ServiceRegistry;

/// On each tick, sends one empty fragment to every request still waiting in a
/// pending queue. Requests already processing get nothing; their handler is
/// expected to produce output on its own.
#[derive(Clone)]
pub struct HeartbeatTicker {
    registry: Arc<ServiceRegistry>,
}

impl HeartbeatTicker {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Runs one heartbeat round. Returns the number of heartbeats delivered.
    pub fn tick(&self) -> usize {
        let delivered = self
            .registry
            .runtimes()
            .iter()
            .map(|runtime| runtime.heartbeat_pending())
            .sum();
        if delivered > 0 {
            trace!(delivered, "heartbeat round");
        }
        delivered
    }
}
