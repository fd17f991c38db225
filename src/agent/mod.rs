//! Managed-node agent.
//!
//! The agent is the other end of the bus. It runs on (or for) one node and:
//! - **Heartbeats**: publishes a liveness signal on a fixed interval
//! - **Verification**: opens every incoming command envelope with the
//!   server's public key and nacks anything that does not verify or has
//!   expired
//! - **Allow-list**: nacks start commands that are not in its allow-list
//! - **Execution**: acks accepted jobs, runs them through [`CommandExecutor`],
//!   streams output chunks with per-run sequence numbers and finally
//!   publishes a run report
//! - **Cancellation**: kills a running job when a signed cancel arrives
//!
//! The server bundles this agent for local nodes and tests. Remote agents
//! speak the same messages over a real transport.

pub mod executor;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{
    topics, CommandPayload, InboundEvent, IncomingQuery, LocalBus, MessageBus, NodeCommand,
    OutputStream,
};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::signing::{EnvelopeVerifier, SignedEnvelope};

pub use executor::{CommandExecutor, ExecutionResult, ExecutionStatus};
pub use heartbeat::HeartbeatSender;

const OUTPUT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct Agent {
    config: Arc<AgentConfig>,
    bus: LocalBus,
    verifier: EnvelopeVerifier,
    executor: CommandExecutor,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, bus: LocalBus, verifier: EnvelopeVerifier) -> Self {
        let executor = CommandExecutor::new(config.shell.clone());
        Self {
            config: Arc::new(config),
            bus,
            verifier,
            executor,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Join the bus and serve queries until `shutdown` is cancelled. Jobs
    /// still running at shutdown are cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut mailbox = self.bus.join(&self.config.name).await;
        tracing::info!(node = %self.config.name, "Agent started");

        let heartbeat = HeartbeatSender::new(self.config.name.clone(), self.config.heartbeat_interval);
        let bus: Arc<dyn MessageBus> = Arc::new(self.bus.clone());
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_task = tokio::spawn(async move {
            heartbeat.run(bus, heartbeat_shutdown).await;
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                query = mailbox.recv() => match query {
                    Some(query) => self.handle_query(query).await,
                    None => break,
                },
            }
        }

        self.bus.leave(&self.config.name).await;
        for (_, token) in self.running.lock().await.drain() {
            token.cancel();
        }
        let _ = heartbeat_task.await;
        tracing::info!(node = %self.config.name, "Agent stopped");
    }

    /// Answer one query from the server.
    pub async fn handle_query(&self, query: IncomingQuery) {
        let payload = match self.open(&query.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(node = %self.config.name, topic = %query.topic, error = %e, "Rejecting command");
                query.nack(e.to_string());
                return;
            }
        };

        let topic = query.topic.clone();
        match (topic.as_str(), payload.command) {
            (
                topics::JOB,
                NodeCommand::Start {
                    job_id,
                    command,
                    run_timeout_ms,
                },
            ) => {
                if !self.config.allows(&command) {
                    tracing::warn!(node = %self.config.name, job_id = %job_id, command = %command, "Command not in allow-list");
                    query.nack(format!("command '{}' is not allowed", command));
                    return;
                }

                let cancel = CancellationToken::new();
                {
                    let mut running = self.running.lock().await;
                    if running.contains_key(&job_id) {
                        query.nack("job is already running");
                        return;
                    }
                    running.insert(job_id, cancel.clone());
                }
                query.ack();

                let agent = self.clone();
                tokio::spawn(async move {
                    agent
                        .execute_job(job_id, command, Duration::from_millis(run_timeout_ms), cancel)
                        .await;
                });
            }
            (topics::CANCEL, NodeCommand::Cancel { job_id }) => {
                if let Some(token) = self.running.lock().await.get(&job_id) {
                    tracing::info!(node = %self.config.name, job_id = %job_id, "Cancelling job");
                    token.cancel();
                }
                query.ack();
            }
            (topic, command) => {
                tracing::warn!(node = %self.config.name, topic, command = ?command, "Command sent on the wrong topic");
                query.nack(format!("unexpected command on topic '{}'", topic));
            }
        }
    }

    fn open(&self, raw: &[u8]) -> Result<CommandPayload> {
        let envelope = SignedEnvelope::from_bytes(raw)?;
        self.verifier.open(&envelope, Utc::now())
    }

    async fn execute_job(
        &self,
        job_id: Uuid,
        command: String,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(OUTPUT_BUFFER);

        let node = self.config.name.clone();
        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            let mut sequence = 0u64;
            while let Some((stream, data)) = rx.recv().await {
                sequence += 1;
                let event = InboundEvent::output(node.clone(), job_id, sequence, stream, data);
                publish(&bus, topics::OUTPUT, &event).await;
            }
        });

        let result = self
            .executor
            .execute(job_id, &command, timeout, cancel, tx)
            .await;

        // Output goes out before the report
        let _ = forwarder.await;
        self.running.lock().await.remove(&job_id);

        let event = InboundEvent::report(self.config.name.clone(), job_id, result.into_report());
        publish(&self.bus, topics::RUN_REPORT, &event).await;
    }
}

async fn publish(bus: &LocalBus, topic: &str, event: &InboundEvent) {
    let payload = match event.to_bytes() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(node = %event.node, error = %e, "Failed to encode event");
            return;
        }
    };
    if let Err(e) = bus.publish(topic, payload).await {
        tracing::warn!(node = %event.node, topic, error = %e, "Failed to publish event");
    }
}
