//! Node liveness tracking.
//!
//! Agents send periodic heartbeats over the bus. The monitor records the
//! last time each node was heard from and keeps an append-only history of
//! up/down transitions. A periodic sweep marks nodes down once they have been
//! silent for longer than the stale threshold.
//!
//! # Ordering
//!
//! Heartbeats may arrive late or twice. `last_seen` never moves backward, and
//! a heartbeat that is not newer than `last_seen` never revives a down node,
//! so replays cannot flap a node's status.
//!
//! Nodes that have never sent a heartbeat have no record and are not up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventPayload, InboundEvent};
use crate::config::{to_chrono, LivenessConfig};
use crate::error::Result;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Up,
    Down,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Up => write!(f, "up"),
            NodeStatus::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "up" => Ok(NodeStatus::Up),
            "down" => Ok(NodeStatus::Down),
            other => Err(format!("unknown node status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: NodeStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl NodeRecord {
    fn first_heartbeat(name: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            status: NodeStatus::Up,
            last_seen: at,
            history: vec![StatusChange {
                status: NodeStatus::Up,
                at,
            }],
        }
    }

    fn set_status(&mut self, status: NodeStatus, at: DateTime<Utc>) {
        self.status = status;
        self.history.push(StatusChange { status, at });
    }

    /// Returns true if the node came back up.
    fn observe_heartbeat(&mut self, at: DateTime<Utc>) -> bool {
        if at <= self.last_seen {
            return false;
        }
        self.last_seen = at;
        if self.status == NodeStatus::Down {
            self.set_status(NodeStatus::Up, at);
            return true;
        }
        false
    }

    fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.last_seen > stale_after
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
}

/// Tracks which nodes are alive.
pub struct LivenessMonitor {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    store: Option<Arc<dyn StateStore>>,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Build a monitor that writes node changes through to `store`, starting
    /// from the nodes already saved there.
    pub async fn restore(store: Arc<dyn StateStore>) -> Result<Self> {
        let nodes: HashMap<String, NodeRecord> = store
            .load_nodes()
            .await?
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();
        tracing::info!(nodes = nodes.len(), "Restored node statuses");
        Ok(Self {
            nodes: RwLock::new(nodes),
            store: Some(store),
        })
    }

    async fn persist(&self, record: &NodeRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_node(record).await {
                tracing::error!(node = %record.name, error = %e, "Failed to save node status");
            }
        }
    }

    /// Record a heartbeat from `node` sent at `at`. Unknown nodes are
    /// registered as up. Returns true if the node changed status.
    ///
    /// The store write happens under the table lock so saved records reach
    /// the store in the same order they were produced.
    pub async fn record_heartbeat(&self, node: &str, at: DateTime<Utc>) -> bool {
        let mut nodes = self.nodes.write().await;
        let changed = match nodes.get_mut(node) {
            Some(record) => {
                if at <= record.last_seen {
                    tracing::trace!(node, at = %at, "Ignoring stale heartbeat");
                    return false;
                }
                let revived = record.observe_heartbeat(at);
                self.persist(record).await;
                revived
            }
            None => {
                let record = NodeRecord::first_heartbeat(node, at);
                self.persist(&record).await;
                nodes.insert(node.to_string(), record);
                true
            }
        };
        drop(nodes);

        if changed {
            tracing::info!(node, "Node is up");
        }
        changed
    }

    /// Mark down every up node not heard from within `stale_after` of `now`.
    /// Returns the names of nodes that went down.
    pub async fn sweep(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let stale_after = to_chrono(stale_after);
        let mut nodes = self.nodes.write().await;
        let mut downed = Vec::new();
        for record in nodes.values_mut() {
            if record.status != NodeStatus::Up || !record.is_stale(now, stale_after) {
                continue;
            }
            record.set_status(NodeStatus::Down, now);
            tracing::info!(node = %record.name, last_seen = %record.last_seen, "Node is down");
            self.persist(record).await;
            downed.push(record.name.clone());
        }
        downed.sort();
        downed
    }

    pub async fn is_up(&self, node: &str) -> bool {
        self.nodes
            .read()
            .await
            .get(node)
            .is_some_and(|record| record.status == NodeStatus::Up)
    }

    /// Current status, last-seen time and full history of one node.
    pub async fn status(&self, node: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(node).cloned()
    }

    /// Number of `targets` that are up, read under one lock so concurrent
    /// heartbeats cannot produce a half-updated count.
    pub async fn count_up(&self, targets: &[String]) -> usize {
        let nodes = self.nodes.read().await;
        targets
            .iter()
            .filter(|name| {
                nodes
                    .get(name.as_str())
                    .is_some_and(|record| record.status == NodeStatus::Up)
            })
            .count()
    }

    /// All known nodes matching `filter`, sorted by name.
    pub async fn list(&self, filter: &NodeFilter) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<NodeRecord> = nodes
            .values()
            .filter(|record| filter.status.map_or(true, |s| record.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn known_nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply a raw heartbeat event from the bus. Malformed events are logged
    /// and dropped.
    pub async fn handle_heartbeat_event(&self, raw: &[u8]) {
        match InboundEvent::from_bytes(raw) {
            Ok(InboundEvent {
                node,
                timestamp,
                payload: EventPayload::Heartbeat,
                ..
            }) if !node.is_empty() => {
                self.record_heartbeat(&node, timestamp).await;
            }
            Ok(event) => {
                tracing::warn!(node = %event.node, "Discarding non-heartbeat event on heartbeat topic");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed heartbeat");
            }
        }
    }
}

/// Periodically mark stale nodes down until `shutdown` is cancelled.
pub async fn run_sweeper(
    monitor: Arc<LivenessMonitor>,
    config: LivenessConfig,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.sweep_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Liveness sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                let downed = monitor.sweep(Utc::now(), config.stale_after).await;
                if !downed.is_empty() {
                    tracing::info!(count = downed.len(), "Sweep marked nodes down");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn stale_heartbeat_does_not_revive() {
        let mut record = NodeRecord::first_heartbeat("web1", t(100));
        record.set_status(NodeStatus::Down, t(800));

        assert!(!record.observe_heartbeat(t(50)));
        assert!(!record.observe_heartbeat(t(100)));
        assert_eq!(record.status, NodeStatus::Down);
        assert_eq!(record.last_seen, t(100));

        assert!(record.observe_heartbeat(t(900)));
        assert_eq!(record.status, NodeStatus::Up);
        assert_eq!(record.history.len(), 3);
    }

    #[test]
    fn staleness_is_strictly_older_than_threshold() {
        let record = NodeRecord::first_heartbeat("web1", t(0));
        let threshold = chrono::Duration::seconds(600);
        assert!(!record.is_stale(t(600), threshold));
        assert!(record.is_stale(t(601), threshold));
    }

    #[tokio::test]
    async fn node_status_parses() {
        assert_eq!("up".parse::<NodeStatus>().unwrap(), NodeStatus::Up);
        assert_eq!("down".parse::<NodeStatus>().unwrap(), NodeStatus::Down);
        assert!("sideways".parse::<NodeStatus>().is_err());
    }

    #[tokio::test]
    async fn malformed_heartbeat_is_dropped() {
        let monitor = LivenessMonitor::new();
        monitor.handle_heartbeat_event(b"{not json").await;
        monitor
            .handle_heartbeat_event(br#"{"node":"","timestamp":"2024-01-01T00:00:00Z","payload":{"type":"heartbeat"}}"#)
            .await;
        assert!(monitor.known_nodes().await.is_empty());

        let event = InboundEvent::heartbeat("web1", t(0)).to_bytes().unwrap();
        monitor.handle_heartbeat_event(&event).await;
        assert!(monitor.is_up("web1").await);
    }
}
