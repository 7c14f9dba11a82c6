//! Configuration file support for the node.
//!
//! Loads optional `kwil.toml` from the data directory. CLI flags override
//! config file values; missing file means defaults. Validator public keys
//! and the leader key are hex-encoded in the file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct KwilConfig {
    pub node: NodeSection,
}

/// `[node]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub chain_id: String,
    pub p2p_host: String,
    pub p2p_port: u16,
    pub rpc_host: String,
    pub rpc_port: u16,
    /// "leader", "validator", or "sentry".
    pub role: String,
    /// Hex public key of the network leader.
    pub leader_pubkey: String,
    /// Hex public keys of the validator set (leader included).
    pub validators: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub pex: bool,
    pub target_connections: usize,
    pub gas_enabled: bool,
    /// Join approval threshold as a fraction of the board.
    pub join_threshold_num: u32,
    pub join_threshold_den: u32,
    pub propose_interval_ms: u64,
    pub ack_timeout_ms: u64,
    /// Dummy transaction generator interval (leader); 0 disables.
    pub dummy_tx_interval_ms: u64,
    pub dummy_tx_size: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            chain_id: "kwil-dev".into(),
            p2p_host: "0.0.0.0".into(),
            p2p_port: 6600,
            rpc_host: "127.0.0.1".into(),
            rpc_port: 8484,
            role: "sentry".into(),
            leader_pubkey: String::new(),
            validators: vec![],
            bootstrap_peers: vec![],
            pex: true,
            target_connections: crate::constants::TARGET_CONNECTIONS,
            gas_enabled: false,
            join_threshold_num: 2,
            join_threshold_den: 3,
            propose_interval_ms: 1_000,
            ack_timeout_ms: 10_000,
            dummy_tx_interval_ms: crate::constants::DUMMY_TX_INTERVAL_MS,
            dummy_tx_size: crate::constants::DUMMY_TX_SIZE,
        }
    }
}

impl KwilConfig {
    /// Load configuration from `kwil.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("kwil.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse bootstrap peers into socket addresses, dropping malformed
    /// entries.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}
