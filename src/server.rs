use std::sync::Arc;

use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::api::{self, ApiState};
use crate::bus::{topics, LocalBus, MessageBus};
use crate::config::{AgentConfig, ServerConfig};
use crate::dispatch::{run_timeout_checker, Dispatcher, KnownNodeResolver};
use crate::error::{Result, ShoveyError};
use crate::liveness::{run_sweeper, LivenessMonitor};
use crate::signing::{EcdsaSigner, EnvelopeVerifier};
use crate::store::MemoryStore;

/// The dispatch server with everything it owns.
pub struct Server {
    pub config: ServerConfig,
    pub store: Arc<MemoryStore>,
    pub monitor: Arc<LivenessMonitor>,
    pub bus: LocalBus,
    pub signer: Arc<EcdsaSigner>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Build the server, restoring nodes and jobs from the state file when
    /// one is configured.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(match &config.state_file {
            Some(path) => MemoryStore::load_from_file(path).await?,
            None => MemoryStore::new(),
        });
        let monitor = Arc::new(LivenessMonitor::restore(store.clone()).await?);

        let signer = Arc::new(match &config.signing_key_path {
            Some(path) => EcdsaSigner::load(path)?,
            None => {
                tracing::warn!("No signing key configured, using a temporary key");
                EcdsaSigner::generate()
            }
        });
        tracing::info!(public_key = %signer.public_key_base64(), "Signing key loaded");

        let bus = LocalBus::new(config.bus.clone());
        let dispatcher = Dispatcher::new(
            config.dispatch.clone(),
            monitor.clone(),
            Arc::new(bus.clone()),
            signer.clone(),
            Arc::new(KnownNodeResolver::new(monitor.clone())),
        )
        .with_store(store.clone());
        dispatcher.restore().await?;

        Ok(Self {
            config,
            store,
            monitor,
            bus,
            signer,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Starts the inbound event consumers, the liveness sweeper, the timeout
    /// checker, any local agents and the REST API. On shutdown the state file
    /// is written if one is configured.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = Vec::new();

        // Subscribe before any agent can publish
        for topic in topics::INBOUND {
            let events = BroadcastStream::new(self.bus.subscribe(topic));
            tasks.push(tokio::spawn(consume_events(
                topic,
                events,
                self.monitor.clone(),
                self.dispatcher.clone(),
                shutdown.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_sweeper(
            self.monitor.clone(),
            self.config.liveness.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_timeout_checker(
            self.dispatcher.clone(),
            shutdown.clone(),
        )));

        let verifier = EnvelopeVerifier::new(self.signer.verifying_key());
        for name in &self.config.local_agents {
            let agent = Agent::new(AgentConfig::new(name.clone()), self.bus.clone(), verifier.clone());
            tasks.push(tokio::spawn(agent.run(shutdown.clone())));
        }

        let state = ApiState {
            dispatcher: self.dispatcher.clone(),
            monitor: self.monitor.clone(),
        };
        let served = api::serve(self.config.listen_addr, state, shutdown.clone()).await;
        if served.is_err() {
            // Stop background tasks when the listener fails
            shutdown.cancel();
        }

        for task in tasks {
            let _ = task.await;
        }

        if let Some(path) = &self.config.state_file {
            self.store.save_to_file(path).await?;
            tracing::info!(path = %path.display(), "State saved");
        }

        served.map_err(ShoveyError::Io)
    }
}

/// Apply events from one inbound topic until `shutdown` is cancelled.
async fn consume_events(
    topic: &'static str,
    mut events: BroadcastStream<Vec<u8>>,
    monitor: Arc<LivenessMonitor>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(raw)) if topic == topics::HEARTBEAT => {
                    monitor.handle_heartbeat_event(&raw).await;
                }
                Some(Ok(raw)) => {
                    dispatcher.handle_inbound(&raw).await;
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    tracing::warn!(topic, missed, "Event consumer lagged, events dropped");
                }
                None => break,
            },
        }
    }
    tracing::debug!(topic, "Event consumer stopping");
}
