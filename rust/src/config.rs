use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::broker::codec::MAX_PACKET_SIZE;
use crate::error::BrokerError;

pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1883);
pub const DEFAULT_CLUSTER_PORT: u16 = 6783;
/// Forwarded publishes must fit in one mesh frame.
const MAX_CLIENT_PACKET_SIZE: usize = 8 * 1_048_576;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "meshmq", about = "Clustered MQTT pub/sub broker")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Client listener address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Cluster listener IP
    #[arg(long)]
    pub cluster_bind: Option<IpAddr>,

    /// Cluster listener port
    #[arg(long)]
    pub cluster_port: Option<u16>,

    /// Seed peers to dial (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    pub seeds: Option<Vec<String>>,

    /// Explicit peer id instead of one derived from the host name
    #[arg(long)]
    pub node_id: Option<u64>,

    /// Seconds without a client packet before the connection is closed
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log filter when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Broker configuration as read from TOML. Every field is optional in the
/// file; missing ones take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cluster_bind")]
    pub cluster_bind: IpAddr,
    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub node_id: Option<u64>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN
}

fn default_cluster_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_cluster_port() -> u16 {
    DEFAULT_CLUSTER_PORT
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_outbound_queue_capacity() -> usize {
    1024
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cluster_bind: default_cluster_bind(),
            cluster_port: default_cluster_port(),
            seeds: Vec::new(),
            node_id: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_packet_size: default_max_packet_size(),
            log_level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// File values first, then CLI flags on top. The result is validated.
    pub fn load(cli: &Cli) -> Result<Self, BrokerError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, BrokerError> {
        toml::from_str(text).map_err(|e| BrokerError::Config(e.to_string()))
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(bind) = cli.cluster_bind {
            self.cluster_bind = bind;
        }
        if let Some(port) = cli.cluster_port {
            self.cluster_port = port;
        }
        if let Some(seeds) = &cli.seeds {
            self.seeds = seeds.clone();
        }
        if cli.node_id.is_some() {
            self.node_id = cli.node_id;
        }
        if let Some(secs) = cli.idle_timeout_secs {
            self.idle_timeout_secs = secs;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        ClusterSettings::try_from(self)?;
        ConnectionSettings::try_from(self)?;
        Ok(())
    }
}

/// Everything the mesh needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    pub bind: SocketAddr,
    pub seeds: Vec<String>,
    pub node_id: Option<u64>,
}

impl TryFrom<&BrokerConfig> for ClusterSettings {
    type Error = BrokerError;

    fn try_from(config: &BrokerConfig) -> Result<Self, BrokerError> {
        for seed in &config.seeds {
            let port = seed
                .rsplit_once(':')
                .filter(|(host, _)| !host.is_empty())
                .and_then(|(_, port)| port.parse::<u16>().ok());
            if !matches!(port, Some(p) if p != 0) {
                return Err(BrokerError::Config(format!(
                    "seed {seed:?} is not a host:port address"
                )));
            }
        }
        Ok(Self {
            bind: SocketAddr::new(config.cluster_bind, config.cluster_port),
            seeds: config.seeds.clone(),
            node_id: config.node_id,
        })
    }
}

/// Per-connection limits shared by every client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
    pub max_packet_size: usize,
}

impl TryFrom<&BrokerConfig> for ConnectionSettings {
    type Error = BrokerError;

    fn try_from(config: &BrokerConfig) -> Result<Self, BrokerError> {
        if config.idle_timeout_secs == 0 {
            return Err(BrokerError::Config("idle_timeout_secs must be > 0".into()));
        }
        if config.outbound_queue_capacity == 0 {
            return Err(BrokerError::Config(
                "outbound_queue_capacity must be > 0".into(),
            ));
        }
        if !(64..=MAX_CLIENT_PACKET_SIZE).contains(&config.max_packet_size) {
            return Err(BrokerError::Config(format!(
                "max_packet_size must be within 64..={MAX_CLIENT_PACKET_SIZE}"
            )));
        }
        Ok(Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            queue_capacity: config.outbound_queue_capacity,
            max_packet_size: config.max_packet_size,
        })
    }
}
