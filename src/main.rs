use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shovey::config::ServerConfig;
use shovey::server::Server;
use shovey::shutdown::install_shutdown_handler;
use shovey::signing::EcdsaSigner;

#[derive(Parser, Debug)]
#[command(name = "shovey")]
#[command(version)]
#[command(about = "Quorum-gated command dispatch to managed nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatch server
    Server(ServerArgs),

    /// Generate a new signing key
    Keygen {
        /// Where to write the base64 encoded private key
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the REST API to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port for the REST API
    #[arg(long, default_value = "4545")]
    port: u16,

    /// Path to the base64 encoded signing key (a temporary key is used if omitted)
    #[arg(long)]
    sign_priv_key: Option<PathBuf>,

    /// Seconds without a heartbeat before a node is marked down
    #[arg(long, default_value = "600")]
    stale_after_secs: u64,

    /// Seconds between liveness sweeps
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Run timeout for jobs that do not set their own
    #[arg(long, default_value = "300")]
    default_run_timeout_secs: u64,

    /// Maximum number of jobs kept in the job table
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// JSON file to restore state from at startup and save it to at shutdown
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Agents to run in-process (comma-separated node names)
    /// Example: "web1,web2,db1"
    #[arg(long, default_value = "")]
    local_agents: String,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new(SocketAddr::new(self.bind, self.port));
        config.liveness.stale_after = Duration::from_secs(self.stale_after_secs);
        config.liveness.sweep_interval = Duration::from_secs(self.sweep_interval_secs.max(1));
        config.dispatch.default_run_timeout = Duration::from_secs(self.default_run_timeout_secs);
        config.dispatch.max_jobs = self.max_jobs;
        config.signing_key_path = self.sign_priv_key;
        config.state_file = self.state_file;
        config.local_agents = parse_names(&self.local_agents);
        config
    }
}

fn parse_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Keygen { out } => run_keygen(out),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = args.into_config();
    tracing::info!(
        addr = %config.listen_addr,
        local_agents = ?config.local_agents,
        "Starting shovey server"
    );

    let shutdown = install_shutdown_handler()?;
    let server = Server::new(config).await?;
    server.run(shutdown).await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn run_keygen(out: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let signer = EcdsaSigner::generate();
    signer.save(&out)?;
    println!("Private key written to {}", out.display());
    println!("Public key: {}", signer.public_key_base64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_list() {
        assert_eq!(parse_names("web1, web2,,db1 "), vec!["web1", "web2", "db1"]);
        assert!(parse_names("").is_empty());
    }

    #[test]
    fn server_args_build_config() {
        let args = Args::parse_from([
            "shovey",
            "server",
            "--port",
            "8080",
            "--stale-after-secs",
            "30",
            "--local-agents",
            "a,b",
        ]);
        let Commands::Server(server_args) = args.command else {
            panic!("expected server subcommand");
        };
        let config = server_args.into_config();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.liveness.stale_after, Duration::from_secs(30));
        assert_eq!(config.local_agents, vec!["a", "b"]);
        assert!(config.signing_key_path.is_none());
    }
}
