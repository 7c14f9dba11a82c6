//! # Kwil node core
//!
//! A single participating process of a replicated SQL-datastore network:
//! - **P2P overlay**: stream-oriented peer transport with typed
//!   request/announce protocols and peer exchange
//! - **Mempool**: bounded, sender-nonce-ordered pending transactions
//! - **Block store**: content-addressed block/tx/result archive with
//!   in-flight fetch reservations
//! - **Consensus driver**: leader/validator propose/ack/commit rounds
//! - **Transaction application**: account/nonce enforcement, fee pricing,
//!   ordered dispatch into the execution engine
//!
//! The SQL engine itself, the user RPC surface, and the cryptographic
//! primitives are external collaborators consumed through traits.

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod engine;
pub mod network;
pub mod node;
pub mod voting;

/// Protocol constants
pub mod constants {
    /// Maximum wire message size (16 MiB)
    pub const MAX_WIRE_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Maximum accepted signature length on the wire
    pub const MAX_SIG_LEN: usize = 1000;
    /// Block header version emitted by this build
    pub const BLOCK_VERSION: u16 = 1;

    /// Transactions pulled from the mempool per proposed block
    pub const BLOCK_TX_COUNT: usize = 50;
    /// Payload size of generated dummy transactions
    pub const DUMMY_TX_SIZE: usize = 123_000;
    /// Dummy transaction broadcast interval in milliseconds (leader only)
    pub const DUMMY_TX_INTERVAL_MS: u64 = 1_000;
    /// Mempool rebroadcast sweep interval in milliseconds
    pub const REBROADCAST_INTERVAL_MS: u64 = 30_000;

    /// Maximum number of transactions in the mempool
    pub const MEMPOOL_MAX_TXS: usize = 50_000;
    /// Maximum pending transactions per sender
    pub const MEMPOOL_MAX_PER_SENDER: usize = 1_000;

    /// Target number of connected peers maintained by the peer manager
    pub const TARGET_CONNECTIONS: usize = 20;
    /// Maximum reconnect attempts to a single peer
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 500;
    /// Peers disconnected longer than this are evicted (7 days, in secs)
    pub const DISCONNECT_LIMIT_SECS: u64 = 7 * 24 * 60 * 60;
    /// Peer eviction sweep interval in seconds
    pub const PEER_EVICT_INTERVAL_SECS: u64 = 600;
    /// Peer exchange interval in seconds
    pub const PEX_INTERVAL_SECS: u64 = 20;

    /// Announcement write timeout in seconds
    pub const ANN_WRITE_TIMEOUT_SECS: u64 = 5;
    /// Announcement / small response read timeout in seconds
    pub const ANN_RESP_TIMEOUT_SECS: u64 = 5;
    /// Transaction fetch timeout in seconds
    pub const TX_GET_TIMEOUT_SECS: u64 = 30;
    /// Block fetch timeout in seconds
    pub const BLK_GET_TIMEOUT_SECS: u64 = 120;
    /// Snapshot chunk fetch timeout in seconds
    pub const SNAPSHOT_CHUNK_TIMEOUT_SECS: u64 = 300;
    /// Dial timeout for a single connection attempt in seconds
    pub const DIAL_TIMEOUT_SECS: u64 = 10;

    /// Accepted proposal timestamp skew from local clock (10 minutes, ms)
    pub const PROPOSAL_TIMESTAMP_SKEW_MS: u64 = 10 * 60 * 1000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all domains in this crate are ASCII).
/// Panics at runtime otherwise; that is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Size-limited bincode config used for both serialization and deserialization.
/// Prevents allocation-based DoS from crafted length prefixes within payloads.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize a value with the crate's canonical bincode configuration.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(value, bincode_config()).map_err(|e| e.to_string())
}

/// Deserialize a value with the crate's canonical bincode configuration.
pub fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    bincode::serde::decode_from_slice(bytes, bincode_config())
        .map(|(v, _)| v)
        .map_err(|e| e.to_string())
}
