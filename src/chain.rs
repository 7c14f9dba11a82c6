//! Core chain types: transactions, blocks, accounts, validators.
//!
//! A transaction's hash covers its full canonical encoding, signature
//! included. A block's hash covers the header only; the leader signature
//! covers the block hash. The signed message of a transaction embeds the
//! chain id, so a signature from one network never verifies on another.

use serde::{Deserialize, Serialize};

use crate::crypto::NodeKeypair;
use crate::Hash;

/// The closed set of transaction payload kinds.
///
/// Dispatch over kinds happens in exactly two places: the pricer and the
/// application pipeline's engine-call switch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Deploy a new dataset schema owned by the sender.
    DeploySchema { name: String, schema: Vec<u8> },
    /// Drop a dataset owned by the sender.
    DropSchema { dbid: String },
    /// Execute a state-mutating action against a dataset.
    ActionExecution {
        dbid: String,
        action: String,
        args: Vec<Vec<String>>,
    },
    /// Call a read-only action against a dataset.
    ActionCall {
        dbid: String,
        action: String,
        args: Vec<String>,
    },
    /// Request to join the validator set with the given power.
    ValidatorJoin { power: i64 },
    /// Leave the validator set.
    ValidatorLeave,
    /// Approve a pending join request for `candidate`.
    ValidatorApprove { candidate: Vec<u8> },
    /// Vote to remove a validator.
    ValidatorRemove { target: Vec<u8> },
    /// Create a generic voteable resolution.
    CreateResolution { body: Vec<u8> },
    /// Approve a resolution by id.
    ApproveResolution { resolution_id: Hash },
    /// Transfer balance to another account.
    Transfer { to: String, amount: u128 },
}

impl Payload {
    /// Short name used in logs and results.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::DeploySchema { .. } => "deploy_schema",
            Payload::DropSchema { .. } => "drop_schema",
            Payload::ActionExecution { .. } => "action_execution",
            Payload::ActionCall { .. } => "action_call",
            Payload::ValidatorJoin { .. } => "validator_join",
            Payload::ValidatorLeave => "validator_leave",
            Payload::ValidatorApprove { .. } => "validator_approve",
            Payload::ValidatorRemove { .. } => "validator_remove",
            Payload::CreateResolution { .. } => "create_resolution",
            Payload::ApproveResolution { .. } => "approve_resolution",
            Payload::Transfer { .. } => "transfer",
        }
    }
}

/// The signed portion of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxBody {
    pub description: String,
    pub payload: Payload,
    /// Fee offered by the sender, arbitrary precision non-negative.
    pub fee: u128,
    pub nonce: u64,
    /// Network identifier, embedded in the signed message for replay
    /// protection.
    pub chain_id: String,
}

/// Signature plus the name of the authenticator that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxSignature {
    pub sig: Vec<u8>,
    pub sig_type: String,
}

/// A signed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub signature: TxSignature,
    pub body: TxBody,
    /// Authenticator-specific identity bytes of the sender.
    pub sender: Vec<u8>,
}

impl Transaction {
    /// The digest a sender signs: chain-bound over the body fields.
    pub fn sign_bytes(body: &TxBody) -> Vec<u8> {
        let payload = crate::serialize(&body.payload).expect("payload encoding cannot fail");
        crate::hash_concat(&[
            body.chain_id.as_bytes(),
            body.description.as_bytes(),
            &payload,
            &body.fee.to_le_bytes(),
            &body.nonce.to_le_bytes(),
        ])
        .to_vec()
    }

    /// Transaction hash: digest of the canonical encoding, signature included.
    pub fn hash(&self) -> Hash {
        let bytes = crate::serialize(self).expect("tx encoding cannot fail");
        crate::hash_domain(b"kwil.tx", &bytes)
    }

    /// Build and sign a transaction with the node's ed25519 identity.
    pub fn signed_ed25519(keypair: &NodeKeypair, body: TxBody) -> Transaction {
        let sig = keypair.sign(&Self::sign_bytes(&body));
        Transaction {
            signature: TxSignature {
                sig,
                sig_type: crate::crypto::ED25519_AUTH.to_string(),
            },
            body,
            sender: keypair.public_bytes(),
        }
    }

    /// Approximate wire size, used for mempool accounting.
    pub fn size_bytes(&self) -> usize {
        crate::serialize(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// Result of applying one transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub code: u32,
    pub log: String,
    pub gas_used: i64,
    pub events: Vec<String>,
}

/// TxResult codes.
pub mod tx_code {
    pub const OK: u32 = 0;
    pub const WRONG_NONCE: u32 = 1;
    pub const INSUFFICIENT_FEE: u32 = 2;
    pub const INSUFFICIENT_BALANCE: u32 = 3;
    pub const INVALID_SIGNATURE: u32 = 4;
    pub const ENGINE_ERROR: u32 = 5;
    pub const WRONG_CHAIN: u32 = 6;
}

impl TxResult {
    pub fn ok(gas_used: i64, log: String, events: Vec<String>) -> Self {
        TxResult {
            code: tx_code::OK,
            log,
            gas_used,
            events,
        }
    }

    pub fn err(code: u32, log: impl Into<String>) -> Self {
        TxResult {
            code,
            log: log.into(),
            gas_used: 0,
            events: vec![],
        }
    }
}

/// Block header. The block hash digests this header only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u16,
    pub height: i64,
    pub prev_hash: Hash,
    pub prev_app_hash: Hash,
    /// Unix milliseconds at proposal time.
    pub timestamp: u64,
    pub merkle_root: Hash,
    /// Public key bytes of the proposer.
    pub proposer: Vec<u8>,
}

/// A block: header, ordered transactions, and the leader's signature over
/// the block hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txns: Vec<Transaction>,
    pub leader_sig: Vec<u8>,
}

impl Block {
    /// Assemble an unsigned block, computing the merkle root over the
    /// transactions in proposer order.
    pub fn build(
        height: i64,
        prev_hash: Hash,
        prev_app_hash: Hash,
        timestamp: u64,
        proposer: Vec<u8>,
        txns: Vec<Transaction>,
    ) -> Block {
        let tx_hashes: Vec<Hash> = txns.iter().map(|tx| tx.hash()).collect();
        Block {
            header: BlockHeader {
                version: crate::constants::BLOCK_VERSION,
                height,
                prev_hash,
                prev_app_hash,
                timestamp,
                merkle_root: merkle_root(&tx_hashes),
                proposer,
            },
            txns,
            leader_sig: vec![],
        }
    }

    /// Block hash: digest of the header's canonical encoding.
    pub fn hash(&self) -> Hash {
        let bytes = crate::serialize(&self.header).expect("header encoding cannot fail");
        crate::hash_domain(b"kwil.block", &bytes)
    }

    /// Sign the block hash with the leader's key.
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        self.leader_sig = keypair.sign(&self.hash());
    }

    /// Check that the merkle commitment matches the contained transactions.
    pub fn verify_merkle_root(&self) -> bool {
        let tx_hashes: Vec<Hash> = self.txns.iter().map(|tx| tx.hash()).collect();
        merkle_root(&tx_hashes) == self.header.merkle_root
    }
}

/// Merkle root over a list of hashes. Odd levels duplicate the last node;
/// the empty list commits to the zero hash.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level non-empty"));
        }
        level = level
            .chunks(2)
            .map(|pair| crate::hash_concat(&[&pair[0], &pair[1]]))
            .collect();
    }
    level[0]
}

/// An account tracked by the account store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub identifier: String,
    pub balance: u128,
    pub nonce: u64,
}

impl Account {
    pub fn new(identifier: String) -> Self {
        Account {
            identifier,
            balance: 0,
            nonce: 0,
        }
    }
}

/// Consensus role of a node at the current height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Validator,
    /// Non-voting observer: accepts commits, never produces ACKs.
    Sentry,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Validator => write!(f, "validator"),
            Role::Sentry => write!(f, "sentry"),
        }
    }
}

/// A member of the validator set. Power > 0 participates in consensus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub pubkey: Vec<u8>,
    pub power: i64,
}
