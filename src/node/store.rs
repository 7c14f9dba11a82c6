//! Content-addressed block store.
//!
//! Four indices: height → (hash, app_hash), hash → block, hash → tx
//! results, tx hash → block hash. A single reader-writer lock protects
//! the in-memory indices so readers never block readers; the in-flight
//! fetch reservations live in a separate mutex-protected set shared by
//! both implementations through [`PrefetchGuard`].
//!
//! `MemBlockStore` backs tests and ephemeral nodes; `SledBlockStore` is
//! the durable store with one sled tree per index. Storage I/O failures
//! are the one error class treated as fatal by the node.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::chain::{Block, Transaction, TxResult};
use crate::Hash;

/// Errors from block store operations. `Io` and `Corrupt` are fatal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("store corruption: {0}")]
    Corrupt(String),
}

/// Location of a confirmed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TxLocation {
    pub tx: Transaction,
    pub height: i64,
    pub block_hash: Hash,
    pub index: u32,
}

/// Releases an in-flight fetch reservation when dropped, so a cancelled
/// fetch cannot wedge its hash.
pub struct PrefetchGuard {
    hash: Hash,
    fetching: Option<Arc<Mutex<HashSet<Hash>>>>,
}

impl PrefetchGuard {
    fn armed(hash: Hash, fetching: Arc<Mutex<HashSet<Hash>>>) -> Self {
        PrefetchGuard {
            hash,
            fetching: Some(fetching),
        }
    }

    fn inert(hash: Hash) -> Self {
        PrefetchGuard {
            hash,
            fetching: None,
        }
    }
}

impl Drop for PrefetchGuard {
    fn drop(&mut self) {
        if let Some(fetching) = &self.fetching {
            fetching
                .lock()
                .expect("fetching lock poisoned")
                .remove(&self.hash);
        }
    }
}

/// The block archive contract.
pub trait BlockStore: Send + Sync {
    /// Lookup by block hash.
    fn get(&self, hash: &Hash) -> Result<Option<(Block, Hash)>, StoreError>;

    /// Lookup by height; returns the block hash too.
    fn get_by_height(&self, height: i64) -> Result<Option<(Hash, Block, Hash)>, StoreError>;

    fn have(&self, hash: &Hash) -> bool;

    /// Idempotent store; indexes all contained transactions.
    fn store(&self, block: &Block, app_hash: Hash) -> Result<(), StoreError>;

    /// Store the ordered result vector for a block; index `i` corresponds
    /// to the i-th transaction.
    fn store_results(&self, block_hash: &Hash, results: &[TxResult]) -> Result<(), StoreError>;

    fn results(&self, block_hash: &Hash) -> Result<Option<Vec<TxResult>>, StoreError>;

    fn result(&self, block_hash: &Hash, index: u32) -> Result<Option<TxResult>, StoreError>;

    /// Highest committed block: `(height, hash, app_hash)`. Zero height
    /// with a zero hash means empty.
    fn best(&self) -> (i64, Hash, Hash);

    /// Reserve an in-flight fetch for `hash`. Returns `true` to exactly
    /// one caller until that caller's guard drops; `false` when the block
    /// is already stored or being fetched.
    fn prefetch(&self, hash: &Hash) -> (bool, PrefetchGuard);

    /// Confirmed-transaction lookup.
    fn get_tx(&self, tx_hash: &Hash) -> Result<Option<TxLocation>, StoreError>;

    fn have_tx(&self, tx_hash: &Hash) -> bool;
}

#[derive(Default)]
struct MemIndices {
    heights: HashMap<i64, (Hash, Hash)>,
    blocks: HashMap<Hash, Block>,
    results: HashMap<Hash, Vec<TxResult>>,
    txs: HashMap<Hash, Hash>,
    best: (i64, Hash, Hash),
}

/// Memory-backed block store, suitable for tests and ephemeral nodes.
pub struct MemBlockStore {
    inner: RwLock<MemIndices>,
    fetching: Arc<Mutex<HashSet<Hash>>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        MemBlockStore {
            inner: RwLock::new(MemIndices::default()),
            fetching: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemBlockStore {
    fn get(&self, hash: &Hash) -> Result<Option<(Block, Hash)>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(block) = inner.blocks.get(hash) else {
            return Ok(None);
        };
        let app_hash = inner
            .heights
            .get(&block.header.height)
            .map(|(_, app)| *app)
            .ok_or_else(|| StoreError::Corrupt("block missing height index".into()))?;
        Ok(Some((block.clone(), app_hash)))
    }

    fn get_by_height(&self, height: i64) -> Result<Option<(Hash, Block, Hash)>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some((hash, app_hash)) = inner.heights.get(&height) else {
            return Ok(None);
        };
        let block = inner
            .blocks
            .get(hash)
            .ok_or_else(|| StoreError::Corrupt("height index missing block".into()))?;
        Ok(Some((*hash, block.clone(), *app_hash)))
    }

    fn have(&self, hash: &Hash) -> bool {
        self.inner
            .read()
            .expect("store lock poisoned")
            .blocks
            .contains_key(hash)
    }

    fn store(&self, block: &Block, app_hash: Hash) -> Result<(), StoreError> {
        let block_hash = block.hash();
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .heights
            .insert(block.header.height, (block_hash, app_hash));
        for tx in &block.txns {
            inner.txs.insert(tx.hash(), block_hash);
        }
        inner.blocks.insert(block_hash, block.clone());
        if block.header.height >= inner.best.0 {
            inner.best = (block.header.height, block_hash, app_hash);
        }
        Ok(())
    }

    fn store_results(&self, block_hash: &Hash, results: &[TxResult]) -> Result<(), StoreError> {
        self.inner
            .write()
            .expect("store lock poisoned")
            .results
            .insert(*block_hash, results.to_vec());
        Ok(())
    }

    fn results(&self, block_hash: &Hash) -> Result<Option<Vec<TxResult>>, StoreError> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .results
            .get(block_hash)
            .cloned())
    }

    fn result(&self, block_hash: &Hash, index: u32) -> Result<Option<TxResult>, StoreError> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .results
            .get(block_hash)
            .and_then(|r| r.get(index as usize))
            .cloned())
    }

    fn best(&self) -> (i64, Hash, Hash) {
        self.inner.read().expect("store lock poisoned").best
    }

    fn prefetch(&self, hash: &Hash) -> (bool, PrefetchGuard) {
        if self.have(hash) {
            return (false, PrefetchGuard::inert(*hash));
        }
        let mut fetching = self.fetching.lock().expect("fetching lock poisoned");
        if !fetching.insert(*hash) {
            return (false, PrefetchGuard::inert(*hash));
        }
        (true, PrefetchGuard::armed(*hash, self.fetching.clone()))
    }

    fn get_tx(&self, tx_hash: &Hash) -> Result<Option<TxLocation>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(block_hash) = inner.txs.get(tx_hash) else {
            return Ok(None);
        };
        let block = inner
            .blocks
            .get(block_hash)
            .ok_or_else(|| StoreError::Corrupt("tx index missing block".into()))?;
        for (index, tx) in block.txns.iter().enumerate() {
            if tx.hash() == *tx_hash {
                return Ok(Some(TxLocation {
                    tx: tx.clone(),
                    height: block.header.height,
                    block_hash: *block_hash,
                    index: index as u32,
                }));
            }
        }
        Err(StoreError::Corrupt("tx index points at wrong block".into()))
    }

    fn have_tx(&self, tx_hash: &Hash) -> bool {
        self.inner
            .read()
            .expect("store lock poisoned")
            .txs
            .contains_key(tx_hash)
    }
}

/// Durable block store: one sled tree per index under the given
/// directory. Height keys are big-endian so lexicographic order matches
/// numeric order; the best pointer is cached and rebuilt on open.
pub struct SledBlockStore {
    #[allow(dead_code)]
    db: sled::Db,
    blocks: sled::Tree,
    heights: sled::Tree,
    results: sled::Tree,
    txs: sled::Tree,
    best: RwLock<(i64, Hash, Hash)>,
    fetching: Arc<Mutex<HashSet<Hash>>>,
}

fn io_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

impl SledBlockStore {
    /// Open or create the store at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(io_err)?;
        Self::from_db(db)
    }

    /// Open a temporary store (for testing).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(io_err)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let blocks = db.open_tree("blocks").map_err(io_err)?;
        let heights = db.open_tree("heights").map_err(io_err)?;
        let results = db.open_tree("results").map_err(io_err)?;
        let txs = db.open_tree("txs").map_err(io_err)?;

        // Rebuild the best pointer from the last (highest) height key.
        let best = match heights.last().map_err(io_err)? {
            Some((key, value)) => {
                let height = i64::from_be_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Corrupt("bad height key".into()))?,
                );
                let (hash, app_hash) = split_hash_pair(&value)?;
                (height, hash, app_hash)
            }
            None => (0, [0u8; 32], [0u8; 32]),
        };

        Ok(SledBlockStore {
            db,
            blocks,
            heights,
            results,
            txs,
            best: RwLock::new(best),
            fetching: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }
}

fn split_hash_pair(value: &[u8]) -> Result<(Hash, Hash), StoreError> {
    if value.len() != 64 {
        return Err(StoreError::Corrupt("bad hash pair length".into()));
    }
    let mut hash = [0u8; 32];
    let mut app_hash = [0u8; 32];
    hash.copy_from_slice(&value[..32]);
    app_hash.copy_from_slice(&value[32..]);
    Ok((hash, app_hash))
}

impl BlockStore for SledBlockStore {
    fn get(&self, hash: &Hash) -> Result<Option<(Block, Hash)>, StoreError> {
        let Some(bytes) = self.blocks.get(hash).map_err(io_err)? else {
            return Ok(None);
        };
        let block: Block = crate::deserialize(&bytes).map_err(StoreError::Corrupt)?;
        let app_hash = self
            .heights
            .get((block.header.height).to_be_bytes())
            .map_err(io_err)?
            .map(|v| split_hash_pair(&v).map(|(_, app)| app))
            .transpose()?
            .ok_or_else(|| StoreError::Corrupt("block missing height index".into()))?;
        Ok(Some((block, app_hash)))
    }

    fn get_by_height(&self, height: i64) -> Result<Option<(Hash, Block, Hash)>, StoreError> {
        let Some(value) = self.heights.get(height.to_be_bytes()).map_err(io_err)? else {
            return Ok(None);
        };
        let (hash, app_hash) = split_hash_pair(&value)?;
        let bytes = self
            .blocks
            .get(hash)
            .map_err(io_err)?
            .ok_or_else(|| StoreError::Corrupt("height index missing block".into()))?;
        let block: Block = crate::deserialize(&bytes).map_err(StoreError::Corrupt)?;
        Ok(Some((hash, block, app_hash)))
    }

    fn have(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash).unwrap_or(false)
    }

    fn store(&self, block: &Block, app_hash: Hash) -> Result<(), StoreError> {
        let block_hash = block.hash();
        let bytes = crate::serialize(block).map_err(StoreError::Corrupt)?;

        let mut pair = Vec::with_capacity(64);
        pair.extend_from_slice(&block_hash);
        pair.extend_from_slice(&app_hash);

        self.blocks.insert(block_hash, bytes).map_err(io_err)?;
        self.heights
            .insert(block.header.height.to_be_bytes(), pair)
            .map_err(io_err)?;
        for tx in &block.txns {
            self.txs
                .insert(tx.hash(), block_hash.to_vec())
                .map_err(io_err)?;
        }

        let mut best = self.best.write().expect("best lock poisoned");
        if block.header.height >= best.0 {
            *best = (block.header.height, block_hash, app_hash);
        }
        Ok(())
    }

    fn store_results(&self, block_hash: &Hash, results: &[TxResult]) -> Result<(), StoreError> {
        let bytes = crate::serialize(&results.to_vec()).map_err(StoreError::Corrupt)?;
        self.results.insert(block_hash, bytes).map_err(io_err)?;
        Ok(())
    }

    fn results(&self, block_hash: &Hash) -> Result<Option<Vec<TxResult>>, StoreError> {
        let Some(bytes) = self.results.get(block_hash).map_err(io_err)? else {
            return Ok(None);
        };
        let results: Vec<TxResult> = crate::deserialize(&bytes).map_err(StoreError::Corrupt)?;
        Ok(Some(results))
    }

    fn result(&self, block_hash: &Hash, index: u32) -> Result<Option<TxResult>, StoreError> {
        Ok(self
            .results(block_hash)?
            .and_then(|r| r.get(index as usize).cloned()))
    }

    fn best(&self) -> (i64, Hash, Hash) {
        *self.best.read().expect("best lock poisoned")
    }

    fn prefetch(&self, hash: &Hash) -> (bool, PrefetchGuard) {
        if self.have(hash) {
            return (false, PrefetchGuard::inert(*hash));
        }
        let mut fetching = self.fetching.lock().expect("fetching lock poisoned");
        if !fetching.insert(*hash) {
            return (false, PrefetchGuard::inert(*hash));
        }
        (true, PrefetchGuard::armed(*hash, self.fetching.clone()))
    }

    fn get_tx(&self, tx_hash: &Hash) -> Result<Option<TxLocation>, StoreError> {
        let Some(block_hash_bytes) = self.txs.get(tx_hash).map_err(io_err)? else {
            return Ok(None);
        };
        let block_hash: Hash = block_hash_bytes
            .as_ref()
            .try_into()
            .map_err(|_| StoreError::Corrupt("bad tx index value".into()))?;
        let Some((block, _)) = self.get(&block_hash)? else {
            return Err(StoreError::Corrupt("tx index missing block".into()));
        };
        for (index, tx) in block.txns.iter().enumerate() {
            if tx.hash() == *tx_hash {
                return Ok(Some(TxLocation {
                    tx: tx.clone(),
                    height: block.header.height,
                    block_hash,
                    index: index as u32,
                }));
            }
        }
        Err(StoreError::Corrupt("tx index points at wrong block".into()))
    }

    fn have_tx(&self, tx_hash: &Hash) -> bool {
        self.txs.contains_key(tx_hash).unwrap_or(false)
    }
}
