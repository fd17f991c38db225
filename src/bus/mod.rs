//! Cluster message bus boundary.
//!
//! The server talks to agents on managed nodes through a gossip style
//! transport that offers three primitives:
//!
//! - **publish**: fire-and-forget event on a topic
//! - **query**: payload addressed to a set of nodes, answered by one
//!   acknowledgement (or nack) per target
//! - **subscribe**: stream of raw inbound events on a topic
//!
//! Payloads are opaque bytes at this layer. [`message`] defines the JSON
//! documents that travel over it, and [`LocalBus`] is an in-process
//! implementation used by the bundled agents and the tests.

pub mod local;
pub mod message;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

pub use local::{IncomingQuery, LocalBus};
pub use message::{CommandPayload, EventPayload, InboundEvent, NodeCommand, OutputStream, RunReport};

pub mod topics {
    /// Agent liveness signals
    pub const HEARTBEAT: &str = "node-heartbeat";
    /// Final per-node run reports
    pub const RUN_REPORT: &str = "shovey-report";
    /// Streamed command output
    pub const OUTPUT: &str = "shovey-output";
    /// Signed job start queries
    pub const JOB: &str = "shovey-job";
    /// Signed cancellation queries
    pub const CANCEL: &str = "shovey-cancel";

    pub const INBOUND: [&str; 3] = [HEARTBEAT, RUN_REPORT, OUTPUT];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAck {
    Ack,
    /// Node rejected the query or could not be reached
    Nack(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub node: String,
    pub ack: QueryAck,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Send `payload` to exactly `targets`. The returned channel yields one
    /// response per target and closes once every target has answered.
    async fn query(
        &self,
        topic: &str,
        payload: Vec<u8>,
        targets: &[String],
    ) -> Result<mpsc::Receiver<QueryResponse>>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>>;
}
