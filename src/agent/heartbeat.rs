use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bus::{topics, InboundEvent, MessageBus};

/// Periodically publishes a heartbeat for one node
pub struct HeartbeatSender {
    node: String,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(node: impl Into<String>, interval: Duration) -> Self {
        Self {
            node: node.into(),
            interval,
        }
    }

    /// Send a heartbeat every interval, starting immediately, until
    /// `shutdown` is cancelled.
    pub async fn run(&self, bus: Arc<dyn MessageBus>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let event = match InboundEvent::heartbeat(self.node.clone(), Utc::now()).to_bytes() {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::error!(node = %self.node, error = %e, "Failed to encode heartbeat");
                            continue;
                        }
                    };
                    if let Err(e) = bus.publish(topics::HEARTBEAT, event).await {
                        tracing::warn!(node = %self.node, error = %e, "Failed to send heartbeat");
                    }
                }
            }
        }
    }
}
