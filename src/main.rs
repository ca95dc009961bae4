use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cronmesh::agent::Agent;
use cronmesh::config::{Config, Profile, TlsConfig};
use cronmesh::extcron::parse_go_duration;
use cronmesh::grpc::GrpcClient;
use cronmesh::plugins;
use cronmesh::shutdown::install_shutdown_handler;
use cronmesh::{CODENAME, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, VERSION};

#[derive(Parser, Debug)]
#[command(name = "cronmesh")]
#[command(about = "A distributed cron-style job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a cronmesh agent.
    Agent(AgentArgs),

    /// Instruct an agent to gracefully leave the cluster.
    Leave {
        /// RPC address of the agent; supports `{{ GetPrivateIP }}`.
        #[arg(long, default_value = "{{ GetPrivateIP }}:6868")]
        rpc_addr: String,
    },

    /// Operate on the consensus peer set.
    Raft {
        #[command(subcommand)]
        command: RaftCommand,
    },

    /// Print version information.
    Version,

    /// Serve an embedded executor plugin (invoked by the agent itself).
    #[command(name = "embedded-plugin", hide = true)]
    EmbeddedPlugin { name: String },
}

#[derive(Subcommand, Debug)]
enum RaftCommand {
    /// Print the current voter list.
    ListPeers {
        #[arg(long, default_value = "{{ GetPrivateIP }}:6868")]
        rpc_addr: String,
    },
    /// Forcibly remove a stale voter.
    RemovePeer {
        #[arg(long)]
        peer_id: String,
        #[arg(long, default_value = "{{ GetPrivateIP }}:6868")]
        rpc_addr: String,
    },
}

#[derive(Args, Debug)]
struct AgentArgs {
    // Node
    /// Unique name of this node in the cluster.
    #[arg(long)]
    node_name: Option<String>,
    /// Repeatable key=value tag advertised over gossip.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    tags: Vec<String>,
    #[arg(long, default_value = "dc1")]
    datacenter: String,
    #[arg(long, default_value = "global")]
    region: String,
    /// Participate in consensus and be eligible for leadership.
    #[arg(long)]
    server: bool,
    /// Gossip timing profile: lan, wan or local.
    #[arg(long, default_value = "lan")]
    profile: String,
    #[arg(long, default_value = "cronmesh.data")]
    data_dir: PathBuf,
    /// Plugin search directory.
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    // Network
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,
    #[arg(long)]
    advertise_addr: Option<IpAddr>,
    #[arg(long, default_value_t = 6868)]
    rpc_port: u16,
    #[arg(long)]
    advertise_rpc_port: Option<u16>,
    #[arg(long, default_value_t = 8946)]
    gossip_port: u16,
    /// How long failed members linger before being reaped, e.g. "24h".
    #[arg(long, default_value = "24h")]
    serf_reconnect_timeout: String,

    // Cluster
    /// Base64-encoded 16-byte gossip encryption key.
    #[arg(long)]
    encrypt: Option<String>,
    /// Initial cluster addresses to join.
    #[arg(long = "join")]
    join: Vec<String>,
    /// Addresses to retry joining until one succeeds.
    #[arg(long = "retry-join")]
    retry_join: Vec<String>,
    /// Maximum join attempts; 0 retries forever.
    #[arg(long, default_value_t = 0)]
    retry_max: u64,
    #[arg(long, default_value = "30s")]
    retry_interval: String,
    /// Expected number of servers before bootstrapping; 1 bootstraps
    /// immediately.
    #[arg(long, default_value_t = 0)]
    bootstrap_expect: u64,
    /// All in-memory state, for development.
    #[arg(long)]
    dev: bool,

    // Storage
    /// Scales consensus timing, 1 (fast) to 10 (relaxed).
    #[arg(long, default_value_t = 1)]
    raft_multiplier: u64,

    // Notification
    #[arg(long)]
    pre_webhook_endpoint: Option<String>,
    #[arg(long)]
    pre_webhook_payload: Option<String>,
    #[arg(long)]
    webhook_endpoint: Option<String>,
    #[arg(long)]
    webhook_payload: Option<String>,
    #[arg(long = "webhook-header")]
    webhook_headers: Vec<String>,
    #[arg(long)]
    cronitor_endpoint: Option<String>,
    #[arg(long)]
    mail_host: Option<String>,
    #[arg(long)]
    mail_port: Option<u16>,
    #[arg(long)]
    mail_from: Option<String>,

    // TLS
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

impl AgentArgs {
    fn into_config(self) -> Result<Config, String> {
        let mut tags = HashMap::new();
        for tag in &self.tags {
            let (key, value) = tag
                .split_once('=')
                .ok_or_else(|| format!("invalid tag {tag:?}, expected key=value"))?;
            tags.insert(key.to_string(), value.to_string());
        }

        let tls = TlsConfig {
            enabled: self.tls_ca_cert.is_some(),
            ca_cert_path: self.tls_ca_cert,
            cert_path: self.tls_cert,
            key_path: self.tls_key,
        };

        let defaults = Config::default();
        Ok(Config {
            node_name: self.node_name.unwrap_or(defaults.node_name),
            datacenter: self.datacenter,
            region: self.region,
            server: self.server,
            profile: self.profile.parse::<Profile>()?,
            data_dir: self.data_dir,
            tags,
            bind_addr: self.bind_addr,
            advertise_addr: self.advertise_addr,
            rpc_port: self.rpc_port,
            advertise_rpc_port: self.advertise_rpc_port,
            gossip_port: self.gossip_port,
            serf_reconnect_timeout: parse_duration_flag(&self.serf_reconnect_timeout)?,
            encrypt: self.encrypt,
            join: self.join,
            retry_join: self.retry_join,
            retry_max: self.retry_max,
            retry_interval: parse_duration_flag(&self.retry_interval)?,
            bootstrap_expect: self.bootstrap_expect,
            bootstrap: self.bootstrap_expect == 1,
            dev_mode: self.dev,
            raft_multiplier: self.raft_multiplier,
            pre_webhook_endpoint: self.pre_webhook_endpoint,
            pre_webhook_payload: self.pre_webhook_payload,
            webhook_endpoint: self.webhook_endpoint,
            webhook_payload: self.webhook_payload,
            webhook_headers: self.webhook_headers,
            cronitor_endpoint: self.cronitor_endpoint,
            mail_host: self.mail_host,
            mail_port: self.mail_port,
            mail_from: self.mail_from,
            plugin_dir: self.plugin_dir,
            tls,
            ..defaults
        })
    }
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
    parse_go_duration(s).map_err(|e| e.to_string())
}

/// Expand the `{{ GetPrivateIP }}` template in an RPC address.
fn expand_rpc_addr(addr: &str) -> String {
    if !addr.contains("{{ GetPrivateIP }}") {
        return addr.to_string();
    }
    let ip = private_ip().unwrap_or_else(|| "127.0.0.1".to_string());
    addr.replace("{{ GetPrivateIP }}", &ip)
}

// The UDP connect trick: no packet is sent, but the OS picks the outbound
// interface address.
fn private_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Command::EmbeddedPlugin { name } = &cli.command {
        // Plugins must not log to stdout; the handshake owns it.
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_writer(std::io::stderr)
            .init();
        std::process::exit(run_embedded_plugin(name).await);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let code = match cli.command {
        Command::Agent(args) => run_agent(args).await,
        Command::Leave { rpc_addr } => run_leave(&expand_rpc_addr(&rpc_addr)).await,
        Command::Raft { command } => match command {
            RaftCommand::ListPeers { rpc_addr } => {
                run_list_peers(&expand_rpc_addr(&rpc_addr)).await
            }
            RaftCommand::RemovePeer { peer_id, rpc_addr } => {
                run_remove_peer(&expand_rpc_addr(&rpc_addr), &peer_id).await
            }
        },
        Command::Version => {
            println!("cronmesh {VERSION} ({CODENAME})");
            println!("Protocol version: {PROTOCOL_VERSION_MIN}..{PROTOCOL_VERSION_MAX}");
            0
        }
        Command::EmbeddedPlugin { .. } => unreachable!("handled above"),
    };
    std::process::exit(code);
}

async fn run_agent(args: AgentArgs) -> i32 {
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cronmesh: {e}");
            return 1;
        }
    };

    let agent = match Agent::start(config).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "agent: failed to start");
            return 1;
        }
    };

    let shutdown = install_shutdown_handler();
    shutdown.cancelled().await;

    if let Err(e) = agent.stop().await {
        tracing::error!(error = %e, "agent: error during shutdown");
        return 1;
    }
    0
}

async fn run_leave(rpc_addr: &str) -> i32 {
    let client = GrpcClient::default();
    match client.leave(rpc_addr).await {
        Ok(()) => {
            println!("agent at {rpc_addr} is leaving the cluster");
            0
        }
        Err(e) => {
            eprintln!("cronmesh: leave failed: {e}");
            1
        }
    }
}

async fn run_list_peers(rpc_addr: &str) -> i32 {
    let client = GrpcClient::default();
    match client.raft_get_configuration(rpc_addr).await {
        Ok(config) => {
            println!("{:<20} {:<20} {:<24} {:<10} {}", "Node", "ID", "Address", "State", "Voter");
            for server in config.servers {
                let state = if server.leader { "leader" } else { "follower" };
                println!(
                    "{:<20} {:<20} {:<24} {:<10} {}",
                    server.node, server.id, server.address, state, server.voter
                );
            }
            0
        }
        Err(e) => {
            eprintln!("cronmesh: list-peers failed: {e}");
            1
        }
    }
}

async fn run_remove_peer(rpc_addr: &str, peer_id: &str) -> i32 {
    let client = GrpcClient::default();
    match client.raft_remove_peer_by_id(rpc_addr, peer_id).await {
        Ok(()) => {
            println!("removed peer {peer_id}");
            0
        }
        Err(e) => {
            eprintln!("cronmesh: remove-peer failed: {e}");
            1
        }
    }
}

async fn run_embedded_plugin(name: &str) -> i32 {
    let executor: Arc<dyn plugins::Executor> = match name {
        "shell" => Arc::new(plugins::shell::ShellExecutor),
        other => {
            eprintln!("cronmesh: unknown embedded plugin {other:?}");
            return 1;
        }
    };

    match plugins::serve::serve_executor(executor).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("cronmesh: plugin serve failed: {e}");
            1
        }
    }
}
