use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Node liveness tracking.
///
/// Agents send a heartbeat every thirty seconds. Once per `sweep_interval`
/// every node that is up but has not been heard from within `stale_after`
/// is marked down.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often the sweeper looks for stale nodes
    pub sweep_interval: Duration,
    /// How long a node may stay silent before it is considered down
    pub stale_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Used when a submission does not carry its own run timeout
    pub default_run_timeout: Duration,
    /// How often overdue runs are timed out
    pub timeout_check_interval: Duration,
    /// Upper bound on the number of jobs kept in the job table
    pub max_jobs: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_run_timeout: Duration::from_secs(300),
            timeout_check_interval: Duration::from_secs(1),
            max_jobs: 10_000,
        }
    }
}

/// In-process message bus settings.
#[derive(Debug, Clone)]
pub struct LocalBusConfig {
    /// Capacity of each inbound topic's broadcast buffer
    pub event_capacity: usize,
    /// How long a query waits for a node to acknowledge before counting it as a nack
    pub query_timeout: Duration,
}

impl Default for LocalBusConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for a managed-node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node name, must match the name the server targets
    pub name: String,
    pub heartbeat_interval: Duration,
    /// Commands the agent is willing to run. `None` allows everything.
    pub allowed_commands: Option<HashSet<String>>,
    /// Shell used to run commands (`<shell> -c <command>`)
    pub shell: String,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval: Duration::from_secs(30),
            allowed_commands: None,
            shell: "sh".to_string(),
        }
    }

    pub fn with_allowed_command(mut self, command: impl Into<String>) -> Self {
        self.allowed_commands
            .get_or_insert_with(HashSet::new)
            .insert(command.into());
        self
    }

    pub fn allows(&self, command: &str) -> bool {
        self.allowed_commands
            .as_ref()
            .map_or(true, |allowed| allowed.contains(command))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub liveness: LivenessConfig,
    pub dispatch: DispatchConfig,
    pub bus: LocalBusConfig,
    /// Path to the base64 encoded signing key
    pub signing_key_path: Option<PathBuf>,
    /// JSON snapshot of nodes, jobs and runs, loaded at startup and saved on shutdown
    pub state_file: Option<PathBuf>,
    /// Names of agents to run in-process against the local bus
    pub local_agents: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:4545"
                .parse()
                .expect("default listen address is valid"),
            liveness: LivenessConfig::default(),
            dispatch: DispatchConfig::default(),
            bus: LocalBusConfig::default(),
            signing_key_path: None,
            state_file: None,
            local_agents: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_local_agent(mut self, name: impl Into<String>) -> Self {
        self.local_agents.push(name.into());
        self
    }
}

/// Convert a std duration for arithmetic on wall-clock timestamps.
/// Values chrono cannot represent saturate to a century.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
