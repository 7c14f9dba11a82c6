//! Pending-transaction pool, keyed by hash and ordered per sender by nonce.
//!
//! Admission keeps a per-sender account view: the committed nonce and
//! balance, plus the fees of already-admitted transactions. For any
//! sender the admitted nonces always form the contiguous run
//! `{N+1, ..., N+k}` above the committed nonce `N`; a transaction past
//! the end of the run is rejected until the sender fills the gap.
//!
//! All operations are short and run under one external mutex (the node
//! wraps the pool in `Mutex<Mempool>`); nothing here suspends.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::chain::{Account, Transaction};
use crate::Hash;

/// Errors from mempool admission. These map onto the structured codes the
/// RPC layer returns to submitters.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    Duplicate,
    #[error("unknown sender (gas enabled, no account)")]
    UnknownSender,
    #[error("stale nonce {got}, account nonce {chain}")]
    StaleNonce { got: u64, chain: u64 },
    #[error("nonce {got} already pending")]
    NonceOccupied { got: u64 },
    #[error("out-of-order nonce {got}, expected {expected}")]
    OutOfOrderNonce { got: u64, expected: u64 },
    #[error("insufficient balance: fee {fee}, available {available}")]
    InsufficientBalance { fee: u128, available: u128 },
    #[error("sender at pending-transaction limit")]
    SenderLimit,
    #[error("mempool full")]
    PoolFull,
}

/// Mempool bounds and network mode.
#[derive(Clone, Copy, Debug)]
pub struct MempoolConfig {
    pub max_txs: usize,
    pub max_per_sender: usize,
    pub gas_enabled: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_txs: crate::constants::MEMPOOL_MAX_TXS,
            max_per_sender: crate::constants::MEMPOOL_MAX_PER_SENDER,
            gas_enabled: false,
        }
    }
}

#[derive(Clone, Debug)]
struct MempoolEntry {
    tx: Transaction,
    sender: String,
    nonce: u64,
    /// Monotonic arrival order, the FIFO key for reaping and eviction.
    order: u64,
    size: usize,
}

/// Account view for one sender with pending transactions.
#[derive(Clone, Debug, Default)]
struct SenderView {
    chain_nonce: u64,
    chain_balance: u128,
    /// Sum of fees of admitted transactions, reserved from the balance.
    pending_spend: u128,
    /// nonce -> tx hash, contiguous from `chain_nonce + 1`.
    admitted: BTreeMap<u64, Hash>,
}

/// Summary for the admin surface.
#[derive(Clone, Debug, serde::Serialize)]
pub struct MempoolStats {
    pub transaction_count: usize,
    pub sender_count: usize,
    pub total_bytes: usize,
    pub max_txs: usize,
}

/// The pending transaction pool.
pub struct Mempool {
    config: MempoolConfig,
    txs: HashMap<Hash, MempoolEntry>,
    senders: HashMap<String, SenderView>,
    arrival: u64,
    total_bytes: usize,
    rebroadcast: HashSet<Hash>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Mempool {
            config,
            txs: HashMap::new(),
            senders: HashMap::new(),
            arrival: 0,
            total_bytes: 0,
            rebroadcast: HashSet::new(),
        }
    }

    /// Admit a transaction. `identifier` is the sender's account id as
    /// derived by its authenticator; `account` is the current on-chain
    /// account, if any. Signature and chain id are already verified by
    /// the application pipeline before admission.
    pub fn insert(
        &mut self,
        tx: Transaction,
        identifier: &str,
        account: Option<&Account>,
    ) -> Result<Hash, MempoolError> {
        let hash = tx.hash();
        if self.txs.contains_key(&hash) {
            return Err(MempoolError::Duplicate);
        }

        if self.config.gas_enabled && account.is_none() && !self.senders.contains_key(identifier) {
            return Err(MempoolError::UnknownSender);
        }

        // Account view: the live one, or a fresh baseline from chain state.
        // Nothing is written until every check passes.
        let (chain_nonce, chain_balance, pending_spend, admitted_len) =
            match self.senders.get(identifier) {
                Some(v) => (v.chain_nonce, v.chain_balance, v.pending_spend, v.admitted.len()),
                None => (
                    account.map(|a| a.nonce).unwrap_or(0),
                    account.map(|a| a.balance).unwrap_or(0),
                    0,
                    0,
                ),
            };

        let nonce = tx.body.nonce;
        if nonce <= chain_nonce {
            return Err(MempoolError::StaleNonce {
                got: nonce,
                chain: chain_nonce,
            });
        }
        let expected = chain_nonce + admitted_len as u64 + 1;
        if nonce < expected {
            return Err(MempoolError::NonceOccupied { got: nonce });
        }
        if nonce > expected {
            return Err(MempoolError::OutOfOrderNonce {
                got: nonce,
                expected,
            });
        }

        if self.config.gas_enabled {
            let available = chain_balance.saturating_sub(pending_spend);
            if tx.body.fee > available {
                return Err(MempoolError::InsufficientBalance {
                    fee: tx.body.fee,
                    available,
                });
            }
        }

        if admitted_len >= self.config.max_per_sender {
            return Err(MempoolError::SenderLimit);
        }

        if self.txs.len() >= self.config.max_txs {
            self.evict_for(identifier)?;
        }

        let view = self.senders.entry(identifier.to_string()).or_default();
        if view.admitted.is_empty() {
            view.chain_nonce = chain_nonce;
            view.chain_balance = chain_balance;
            view.pending_spend = 0;
        }
        view.admitted.insert(nonce, hash);
        view.pending_spend = view.pending_spend.saturating_add(tx.body.fee);

        let size = tx.size_bytes();
        self.total_bytes += size;
        let order = self.arrival;
        self.arrival += 1;
        self.txs.insert(
            hash,
            MempoolEntry {
                tx,
                sender: identifier.to_string(),
                nonce,
                order,
                size,
            },
        );
        Ok(hash)
    }

    /// Make room for an insert by `identifier`: pick the sender owning the
    /// globally oldest entry (FIFO) and evict its highest pending nonce,
    /// which preserves that sender's nonce contiguity. The inserting
    /// sender is never the victim.
    fn evict_for(&mut self, identifier: &str) -> Result<(), MempoolError> {
        while self.txs.len() >= self.config.max_txs {
            let victim_sender = self
                .txs
                .values()
                .filter(|e| e.sender != identifier)
                .min_by_key(|e| e.order)
                .map(|e| e.sender.clone())
                .ok_or(MempoolError::PoolFull)?;
            let victim_hash = {
                let view = self
                    .senders
                    .get(&victim_sender)
                    .expect("victim view exists");
                match view.admitted.last_key_value() {
                    Some((_, hash)) => *hash,
                    None => return Err(MempoolError::PoolFull),
                }
            };
            self.remove_entry(&victim_hash);
            tracing::debug!(
                sender = %victim_sender,
                "Evicted pending tx to make room"
            );
        }
        Ok(())
    }

    fn remove_entry(&mut self, hash: &Hash) -> Option<MempoolEntry> {
        let entry = self.txs.remove(hash)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.rebroadcast.remove(hash);
        if let Some(view) = self.senders.get_mut(&entry.sender) {
            view.admitted.remove(&entry.nonce);
            view.pending_spend = view.pending_spend.saturating_sub(entry.tx.body.fee);
            if view.admitted.is_empty() {
                self.senders.remove(&entry.sender);
            }
        }
        Some(entry)
    }

    /// Drop transactions included in a committed block.
    pub fn remove_committed(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.remove_entry(hash);
        }
    }

    /// Re-evaluate every sender after a commit changed account state.
    /// Entries that turned stale or unpayable are evicted; survivors of
    /// changed senders are marked for rebroadcast and returned.
    pub fn recheck<F>(&mut self, lookup: F) -> Vec<Hash>
    where
        F: Fn(&str) -> Option<Account>,
    {
        let senders: Vec<String> = self.senders.keys().cloned().collect();
        let mut rebroadcast = Vec::new();

        for sender in senders {
            let account = lookup(&sender);
            let new_nonce = account.as_ref().map(|a| a.nonce).unwrap_or(0);
            let new_balance = account.as_ref().map(|a| a.balance).unwrap_or(0);

            let Some(view) = self.senders.get(&sender) else { continue };
            let changed = view.chain_nonce != new_nonce || view.chain_balance != new_balance;
            let admitted: Vec<(u64, Hash)> =
                view.admitted.iter().map(|(n, h)| (*n, *h)).collect();

            let mut survivors = Vec::new();
            let mut evict = Vec::new();
            let mut expected = new_nonce + 1;
            let mut spent: u128 = 0;
            let mut broken = false;
            for (nonce, hash) in admitted {
                if broken || nonce < expected {
                    evict.push(hash);
                    continue;
                }
                if nonce > expected {
                    // contiguity broke; everything from here on is
                    // unreachable until the sender refills the gap
                    broken = true;
                    evict.push(hash);
                    continue;
                }
                let fee = self.txs.get(&hash).map(|e| e.tx.body.fee).unwrap_or(0);
                if self.config.gas_enabled && spent.saturating_add(fee) > new_balance {
                    broken = true;
                    evict.push(hash);
                    continue;
                }
                spent = spent.saturating_add(fee);
                expected += 1;
                survivors.push(hash);
            }

            for hash in evict {
                self.remove_entry(&hash);
            }
            if let Some(view) = self.senders.get_mut(&sender) {
                view.chain_nonce = new_nonce;
                view.chain_balance = new_balance;
                view.pending_spend = spent;
            }
            if changed {
                for hash in survivors {
                    self.rebroadcast.insert(hash);
                    rebroadcast.push(hash);
                }
            }
        }
        rebroadcast
    }

    /// Pull up to `max` transactions for a block proposal, FIFO across
    /// senders. Arrival order implies nonce order within a sender, so the
    /// batch is valid to execute as-is. Entries stay pooled until the
    /// block commits.
    pub fn reap(&self, max: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.txs.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().take(max).map(|e| e.tx.clone()).collect()
    }

    /// Drain the rebroadcast markers, returning the transactions to
    /// re-announce.
    pub fn take_rebroadcast(&mut self) -> Vec<Transaction> {
        let hashes: Vec<Hash> = self.rebroadcast.drain().collect();
        hashes
            .iter()
            .filter_map(|h| self.txs.get(h).map(|e| e.tx.clone()))
            .collect()
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.txs.get(hash).map(|e| &e.tx)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    /// Admitted nonces for a sender, ascending. Test hook for the
    /// contiguity invariant.
    pub fn pending_nonces(&self, identifier: &str) -> Vec<u64> {
        self.senders
            .get(identifier)
            .map(|v| v.admitted.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            transaction_count: self.txs.len(),
            sender_count: self.senders.len(),
            total_bytes: self.total_bytes,
            max_txs: self.config.max_txs,
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}
