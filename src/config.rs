//! Agent configuration.
//!
//! Options partition into node, network, cluster, storage and notification
//! groups, mirroring the `agent` command's flag groups.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};

pub const DEFAULT_RPC_PORT: u16 = 6868;
pub const DEFAULT_GOSSIP_PORT: u16 = 8946;

/// The reserved role tag every agent advertises.
pub const ROLE_TAG: &str = "cronmesh";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: encrypt key must be 16 bytes base64 encoded")]
    InvalidEncryptKey,

    #[error("config: raft-multiplier cannot be {0}, must be between 1 and 10")]
    InvalidRaftMultiplier(u64),

    #[error("config: invalid address {0:?}: {1}")]
    InvalidAddress(String, String),
}

/// Gossip timing profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Lan,
    Wan,
    Local,
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan" => Ok(Profile::Lan),
            "wan" => Ok(Profile::Wan),
            "local" => Ok(Profile::Local),
            other => Err(format!("unknown profile {other:?}, use lan, wan or local")),
        }
    }
}

impl Profile {
    pub fn probe_interval(self) -> Duration {
        match self {
            Profile::Lan => Duration::from_secs(1),
            Profile::Wan => Duration::from_secs(3),
            Profile::Local => Duration::from_millis(100),
        }
    }

    pub fn failure_timeout(self) -> Duration {
        match self {
            Profile::Lan => Duration::from_secs(5),
            Profile::Wan => Duration::from_secs(15),
            Profile::Local => Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Node
    /// Unique member id in the cluster.
    pub node_name: String,
    pub datacenter: String,
    pub region: String,
    /// Whether this agent participates in consensus.
    pub server: bool,
    pub profile: Profile,
    pub data_dir: PathBuf,
    pub tags: HashMap<String, String>,

    // Network
    pub bind_addr: IpAddr,
    pub advertise_addr: Option<IpAddr>,
    pub rpc_port: u16,
    pub advertise_rpc_port: Option<u16>,
    pub gossip_port: u16,
    /// How long failed members linger before being reaped.
    pub serf_reconnect_timeout: Duration,

    // Cluster
    /// Base64-encoded 16-byte gossip encryption key.
    pub encrypt: Option<String>,
    pub join: Vec<String>,
    pub retry_join: Vec<String>,
    /// 0 retries forever.
    pub retry_max: u64,
    pub retry_interval: Duration,
    pub bootstrap_expect: u64,
    pub bootstrap: bool,
    /// All in-memory state, for development.
    pub dev_mode: bool,

    // Storage
    pub raft_multiplier: u64,

    // Leadership
    pub reconcile_interval: Duration,

    // Shutdown
    pub drain_timeout: Duration,

    // Notification
    pub pre_webhook_endpoint: Option<String>,
    pub pre_webhook_payload: Option<String>,
    pub webhook_endpoint: Option<String>,
    pub webhook_payload: Option<String>,
    pub webhook_headers: Vec<String>,
    pub cronitor_endpoint: Option<String>,
    pub mail_host: Option<String>,
    pub mail_port: Option<u16>,
    pub mail_from: Option<String>,

    // Plugins
    pub plugin_dir: Option<PathBuf>,

    // TLS
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: hostname(),
            datacenter: "dc1".to_string(),
            region: "global".to_string(),
            server: false,
            profile: Profile::Lan,
            data_dir: PathBuf::from("cronmesh.data"),
            tags: HashMap::new(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_addr: None,
            rpc_port: DEFAULT_RPC_PORT,
            advertise_rpc_port: None,
            gossip_port: DEFAULT_GOSSIP_PORT,
            serf_reconnect_timeout: Duration::from_secs(3600 * 24),
            encrypt: None,
            join: Vec::new(),
            retry_join: Vec::new(),
            retry_max: 0,
            retry_interval: Duration::from_secs(30),
            bootstrap_expect: 0,
            bootstrap: false,
            dev_mode: false,
            raft_multiplier: 1,
            reconcile_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(3 * 3600),
            pre_webhook_endpoint: None,
            pre_webhook_payload: None,
            webhook_endpoint: None,
            webhook_payload: None,
            webhook_headers: Vec::new(),
            cronitor_endpoint: None,
            mail_host: None,
            mail_port: None,
            mail_from: None,
            plugin_dir: None,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Check cross-field constraints before the agent starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.encrypt {
            let decoded = BASE64_STANDARD
                .decode(key.as_bytes())
                .map_err(|_| ConfigError::InvalidEncryptKey)?;
            if decoded.len() != 16 {
                return Err(ConfigError::InvalidEncryptKey);
            }
        }
        if !(1..=10).contains(&self.raft_multiplier) {
            return Err(ConfigError::InvalidRaftMultiplier(self.raft_multiplier));
        }
        Ok(())
    }

    /// `bootstrap-expect = 1` is a synonym for bootstrap mode.
    pub fn effective_bootstrap(&self) -> bool {
        self.bootstrap || self.bootstrap_expect == 1 || self.dev_mode
    }

    /// The IP peers should use to reach this agent.
    pub fn effective_advertise_addr(&self) -> IpAddr {
        match self.advertise_addr {
            Some(addr) => addr,
            None if self.bind_addr.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => self.bind_addr,
        }
    }

    /// The advertised gRPC endpoint, carried in the `rpc_addr` tag.
    pub fn advertise_rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.effective_advertise_addr(),
            self.advertise_rpc_port.unwrap_or(self.rpc_port),
        )
    }

    pub fn bind_rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.rpc_port)
    }

    pub fn bind_gossip_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.gossip_port)
    }

    pub fn advertise_gossip_addr(&self) -> SocketAddr {
        SocketAddr::new(self.effective_advertise_addr(), self.gossip_port)
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Raft timing scaled by the configured multiplier.
    pub fn raft_timing(&self) -> (u64, u64, u64) {
        let m = self.raft_multiplier;
        (150 * m, 300 * m, 50 * m)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "cronmesh-node".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_encrypt_key() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.encrypt = Some(BASE64_STANDARD.encode([0u8; 16]));
        assert!(config.validate().is_ok());

        config.encrypt = Some(BASE64_STANDARD.encode([0u8; 8]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEncryptKey)
        ));

        config.encrypt = Some("***".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_raft_multiplier() {
        let mut config = Config::default();
        config.raft_multiplier = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRaftMultiplier(0))
        ));
        config.raft_multiplier = 11;
        assert!(config.validate().is_err());
        config.raft_multiplier = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_expect_one_implies_bootstrap() {
        let mut config = Config::default();
        assert!(!config.effective_bootstrap());
        config.bootstrap_expect = 1;
        assert!(config.effective_bootstrap());
        config.bootstrap_expect = 3;
        assert!(!config.effective_bootstrap());
        config.dev_mode = true;
        assert!(config.effective_bootstrap());
    }

    #[test]
    fn test_advertise_addresses() {
        let mut config = Config::default();
        config.rpc_port = 7000;
        assert_eq!(config.advertise_rpc_addr().port(), 7000);
        // An unspecified bind address falls back to loopback.
        assert!(config.advertise_rpc_addr().ip().is_loopback());

        config.advertise_addr = Some("10.0.0.9".parse().unwrap());
        config.advertise_rpc_port = Some(7100);
        assert_eq!(
            config.advertise_rpc_addr(),
            "10.0.0.9:7100".parse().unwrap()
        );
    }

    #[test]
    fn test_raft_timing_scales_with_multiplier() {
        let mut config = Config::default();
        assert_eq!(config.raft_timing(), (150, 300, 50));
        config.raft_multiplier = 5;
        assert_eq!(config.raft_timing(), (750, 1500, 250));
    }
}
