//! Configuration file management.
//!
//! The daemon reads a TOML file with `[network]`, `[dht]` and `[logging]`
//! tables. Every field has a default, so a missing file or table is fine.
//!
//! Lookup order for the file:
//! 1. `$ARXEN_CONFIG`
//! 2. `$ARXEN_DATA_DIR/config.toml`
//! 3. `~/.arxen/config.toml`

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use arxen_dht::bootstrap::BootstrapConfig;
use arxen_dht::node::NodeConfig;
use arxen_dht::DhtConfig;
use arxen_transport::udp::{UdpConfig, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};
use arxen_types::NodeId;
use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub dht: DhtSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the UDP socket to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// UDP port. 0 = OS-assigned ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address advertised to peers. Empty = bound address.
    #[serde(default)]
    pub advertise_addr: String,
    /// Bootstrap seed nodes as `ip:port`.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Inbound and outbound datagram queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// DHT tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtSettings {
    /// Hex node id. Empty = random at every start.
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
    /// Store found values at the closest peer that lacked them.
    #[serde(default = "default_true")]
    pub cache_found_values: bool,
    /// Ping attempts per seed during bootstrap.
    #[serde(default = "default_bootstrap_retries")]
    pub bootstrap_retries: u32,
    /// Seeds that must answer for bootstrap to succeed.
    #[serde(default = "default_min_responsive_seeds")]
    pub min_responsive_seeds: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"info,arxen_dht=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between routing/dispatcher status lines. 0 = never.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

// Default value functions

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_PORT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_k() -> usize {
    arxen_dht::K
}

fn default_alpha() -> usize {
    arxen_dht::ALPHA
}

fn default_rpc_timeout_ms() -> u64 {
    arxen_dht::RPC_TIMEOUT_MS
}

fn default_max_rounds() -> usize {
    arxen_dht::MAX_LOOKUP_ROUNDS
}

fn default_lookup_timeout_secs() -> u64 {
    arxen_dht::LOOKUP_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_bootstrap_retries() -> u32 {
    3
}

fn default_min_responsive_seeds() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval_secs() -> u64 {
    300
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            advertise_addr: String::new(),
            bootstrap_nodes: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            k: default_k(),
            alpha: default_alpha(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            max_rounds: default_max_rounds(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            cache_found_values: true,
            bootstrap_retries: default_bootstrap_retries(),
            min_responsive_seeds: default_min_responsive_seeds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: DaemonConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("ARXEN_CONFIG") {
            return PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("ARXEN_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".arxen"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/arxen"))
            .join("config.toml")
    }

    /// Node settings derived from the `[network]` and `[dht]` tables.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let ip: IpAddr = self
            .network
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind_address {:?}", self.network.bind_address))?;

        let advertise_addr = match self.network.advertise_addr.as_str() {
            "" => None,
            addr => Some(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid advertise_addr {addr:?}"))?,
            ),
        };

        let node_id = match self.dht.node_id.as_str() {
            "" => None,
            hex => Some(
                hex.parse::<NodeId>()
                    .map_err(|e| anyhow::anyhow!("invalid node_id: {e}"))?,
            ),
        };

        Ok(NodeConfig {
            udp: UdpConfig {
                bind_addr: SocketAddr::new(ip, self.network.listen_port),
                queue_capacity: self.network.queue_capacity,
            },
            dht: DhtConfig {
                k: self.dht.k,
                alpha: self.dht.alpha,
                rpc_timeout: Duration::from_millis(self.dht.rpc_timeout_ms),
                max_rounds: self.dht.max_rounds,
                lookup_timeout: Duration::from_secs(self.dht.lookup_timeout_secs),
                cache_found_values: self.dht.cache_found_values,
            },
            node_id,
            advertise_addr,
        })
    }

    /// Bootstrap settings, or `None` when no seeds are configured.
    pub fn bootstrap_config(&self) -> anyhow::Result<Option<BootstrapConfig>> {
        if self.network.bootstrap_nodes.is_empty() {
            return Ok(None);
        }
        let seed_nodes = self
            .network
            .bootstrap_nodes
            .iter()
            .map(|s| {
                s.parse::<SocketAddr>()
                    .with_context(|| format!("invalid bootstrap node {s:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Some(BootstrapConfig {
            seed_nodes,
            max_retries: self.dht.bootstrap_retries,
            timeout_ms: self.dht.rpc_timeout_ms,
            min_responsive_seeds: self.dht.min_responsive_seeds,
        }))
    }
}
