//! `kwild`: run a node of the replicated SQL-datastore network.
//!
//! Usage:
//!   kwild start                      # run a node from ./kwil-data/kwil.toml
//!   kwild start --role leader ...    # CLI flags override the config file
//!   kwild key init                   # generate the node key
//!   kwild key show                   # print the node's public key

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kwil_node::chain::{Role, Validator};
use kwil_node::config::KwilConfig;
use kwil_node::crypto::load_or_generate_nodekey;
use kwil_node::node::{Node, NodeConfig};
use kwil_node::voting::Threshold;

/// Kwil network node.
#[derive(Parser, Debug)]
#[command(name = "kwild", version, about = "Kwil decentralized datastore node")]
struct Cli {
    /// Data directory for keys, the address book, and the block store.
    #[arg(long, default_value = "./kwil-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node.
    Start {
        /// P2P listen address (host:port).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Admin RPC listen address (host:port).
        #[arg(long)]
        rpc: Option<SocketAddr>,

        /// Chain identifier.
        #[arg(long)]
        chain_id: Option<String>,

        /// Consensus role: leader, validator, or sentry.
        #[arg(long)]
        role: Option<String>,

        /// Hex public key of the network leader.
        #[arg(long)]
        leader: Option<String>,

        /// Bootstrap peer addresses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Disable peer exchange.
        #[arg(long)]
        no_pex: bool,
    },

    /// Node key management.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Generate the node key if it does not exist.
    Init,
    /// Print the node's public key and peer id.
    Show,
}

fn parse_role(role: &str) -> Result<Role, String> {
    match role {
        "leader" => Ok(Role::Leader),
        "validator" => Ok(Role::Validator),
        "sentry" => Ok(Role::Sentry),
        other => Err(format!("unknown role {:?}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Key { action } => run_key_command(action, &cli.data_dir),
        Command::Start {
            listen,
            rpc,
            chain_id,
            role,
            leader,
            peers,
            no_pex,
        } => {
            let config = KwilConfig::load(&cli.data_dir);
            let keypair = load_or_generate_nodekey(&cli.data_dir)?;

            let listen_addr = match listen {
                Some(addr) => addr,
                None => format!("{}:{}", config.node.p2p_host, config.node.p2p_port).parse()?,
            };
            let rpc_addr = match rpc {
                Some(addr) => addr,
                None => format!("{}:{}", config.node.rpc_host, config.node.rpc_port).parse()?,
            };
            let chain_id = chain_id.unwrap_or_else(|| config.node.chain_id.clone());
            let role = parse_role(role.as_deref().unwrap_or(&config.node.role))?;

            let leader_hex = leader.unwrap_or_else(|| config.node.leader_pubkey.clone());
            let leader_pubkey = if leader_hex.is_empty() {
                if role == Role::Leader {
                    keypair.public_bytes()
                } else {
                    return Err("a leader public key is required for non-leader roles".into());
                }
            } else {
                hex::decode(&leader_hex)?
            };

            let mut validators: Vec<Validator> = config
                .node
                .validators
                .iter()
                .filter_map(|pk| hex::decode(pk).ok())
                .map(|pubkey| Validator { pubkey, power: 1 })
                .collect();
            if !validators.iter().any(|v| v.pubkey == leader_pubkey) {
                validators.push(Validator {
                    pubkey: leader_pubkey.clone(),
                    power: 1,
                });
            }

            let bootstrap_peers = if peers.is_empty() {
                config.parse_bootstrap_peers()
            } else {
                peers
            };

            let dummy_tx_interval = match config.node.dummy_tx_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            };

            let node_config = NodeConfig {
                data_dir: cli.data_dir,
                listen_addr,
                rpc_addr: Some(rpc_addr),
                chain_id,
                role,
                keypair,
                leader_pubkey,
                validators,
                bootstrap_peers,
                pex: !no_pex && config.node.pex,
                target_connections: config.node.target_connections,
                gas_enabled: config.node.gas_enabled,
                join_threshold: Threshold {
                    num: config.node.join_threshold_num,
                    den: config.node.join_threshold_den,
                },
                propose_interval: Duration::from_millis(config.node.propose_interval_ms),
                ack_timeout: Duration::from_millis(config.node.ack_timeout_ms),
                dummy_tx_interval,
                dummy_tx_size: config.node.dummy_tx_size,
                memory_store: false,
            };

            run_node(node_config).await
        }
    }
}

async fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let rpc_addr = config.rpc_addr;
    let node = Node::new(config, shutdown.clone()).await?;

    if let Some(rpc_addr) = rpc_addr {
        tokio::spawn(kwil_node::node::rpc::serve(rpc_addr, node.handle()));
    }

    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl-C received, shutting down...");
        ctrl_c_token.cancel();
    });

    node.run().await;
    Ok(())
}

fn run_key_command(
    action: KeyAction,
    data_dir: &std::path::Path,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        KeyAction::Init => {
            let keypair = load_or_generate_nodekey(data_dir)?;
            println!("node public key: {}", hex::encode(keypair.public_bytes()));
            Ok(())
        }
        KeyAction::Show => {
            let key_path = data_dir.join("nodekey");
            if !key_path.exists() {
                return Err("no node key; run `kwild key init` first".into());
            }
            let keypair = load_or_generate_nodekey(data_dir)?;
            println!("node public key: {}", hex::encode(keypair.public_bytes()));
            println!("peer id:         {}", hex::encode(keypair.peer_id()));
            Ok(())
        }
    }
}
