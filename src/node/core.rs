//! Node orchestrator.
//!
//! Owns the host identity and wires the block store, mempool, application
//! pipeline, consensus driver, transport, and peer manager together. The
//! main loop serves protocol requests, turns announcements into fetches
//! (guarded by block-store prefetch reservations), forwards verified
//! ack/reset gossip into the consensus channels, and performs the
//! driver's outbound actions. The leader additionally runs the dummy-tx
//! generator and the periodic mempool rebroadcast sweep.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::mempool::{Mempool, MempoolConfig, MempoolError};
use super::store::{BlockStore, MemBlockStore, SledBlockStore, StoreError};
use super::txapp::{TxApp, TxAppError};
use crate::chain::{Block, Payload, Role, Transaction, TxBody, Validator};
use crate::consensus::{
    ConsensusConfig, ConsensusEngine, ConsensusHandle, ConsensusInput, ConsensusOutput,
};
use crate::crypto::{verify_ed25519, NodeKeypair};
use crate::engine::{DatasetEngine, MemAccountStore, Pricer};
use crate::network::p2p::{self, P2pConfig, P2pError, P2pEvent, P2pHandle};
use crate::network::peers::PeerMan;
use crate::network::protocol::{
    is_no_data, AckPayload, BlockAnn, BlockHeightReq, HashReq, ProtocolId, ResetPayload,
    DISCOVER_PEERS_MSG, GET_MSG, NO_DATA,
};
use crate::network::PeerId;
use crate::voting::Threshold;
use crate::Hash;

/// Node configuration, fully explicit: nothing is read from package-level
/// state.
#[derive(Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub rpc_addr: Option<SocketAddr>,
    pub chain_id: String,
    pub role: Role,
    pub keypair: NodeKeypair,
    pub leader_pubkey: Vec<u8>,
    /// Initial validator set (leader included).
    pub validators: Vec<Validator>,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub pex: bool,
    pub target_connections: usize,
    pub gas_enabled: bool,
    pub join_threshold: Threshold,
    pub propose_interval: Duration,
    pub ack_timeout: Duration,
    /// Dummy transaction generator interval; `None` disables it.
    pub dummy_tx_interval: Option<Duration>,
    pub dummy_tx_size: usize,
    /// Use the in-memory block store instead of sled (tests, ephemeral
    /// nodes).
    pub memory_store: bool,
}

/// Errors from node construction and admission.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Admission(#[from] MempoolError),
    #[error(transparent)]
    Verification(#[from] TxAppError),
}

/// Gossip deduplication: two generational seen-sets. When the current set
/// exceeds capacity it becomes the previous one and a fresh set starts.
struct SeenCache {
    current: HashSet<Hash>,
    prev: HashSet<Hash>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        SeenCache {
            current: HashSet::new(),
            prev: HashSet::new(),
            capacity,
        }
    }

    /// Mark a key as seen; returns `false` when it was already seen.
    fn insert(&mut self, key: Hash) -> bool {
        if self.current.contains(&key) || self.prev.contains(&key) {
            return false;
        }
        self.current.insert(key);
        if self.current.len() > self.capacity {
            std::mem::swap(&mut self.current, &mut self.prev);
            self.current.clear();
        }
        true
    }
}

/// Cloneable view over the node's shared parts, used by the RPC service,
/// the dummy-tx generator, and announce-fetch tasks.
#[derive(Clone)]
pub struct NodeHandle {
    pub chain_id: String,
    pub role: Role,
    pub p2p: P2pHandle,
    pub store: Arc<dyn BlockStore>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub txapp: Arc<TxApp>,
    pub validators: Arc<RwLock<HashMap<String, Validator>>>,
    pub peer_man: Arc<PeerMan<P2pHandle>>,
    pub consensus: ConsensusHandle,
    leader_pubkey: Vec<u8>,
}

impl NodeHandle {
    /// Admit a transaction locally and announce its hash to peers. The
    /// entry point behind the RPC `broadcast` method.
    pub async fn broadcast_tx(&self, tx: Transaction) -> Result<Hash, NodeError> {
        let identifier = self.txapp.verify(&tx)?;
        let account = self.txapp.account(&identifier);
        let hash = {
            let mut mempool = self.mempool.lock().expect("mempool lock poisoned");
            mempool.insert(tx, &identifier, account.as_ref())?
        };
        self.announce_tx(hash, None).await;
        Ok(hash)
    }

    /// Announce a transaction hash on `txann` to all peers (shuffled),
    /// optionally skipping the peer it came from. Each announcement is a
    /// request answered with `"get"` (peer wants it and will fetch) or
    /// nothing; the fan-out runs concurrently so one slow peer cannot
    /// stall the rest.
    pub async fn announce_tx(&self, hash: Hash, exclude: Option<PeerId>) {
        let payload = HashReq { hash }.encode();
        for peer in self.shuffled_peers(exclude).await {
            let p2p = self.p2p.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                // the response is an interest signal only; the peer pulls
                // the content over `kwil/tx/1` itself
                let _ = p2p.request(peer, ProtocolId::TxAnn, payload).await;
            });
        }
    }

    /// Announce a committed block on `blkann` to all peers, same
    /// request/interest shape as `announce_tx`.
    pub async fn announce_block(&self, ann: &BlockAnn, exclude: Option<PeerId>) {
        let payload = ann.encode();
        for peer in self.shuffled_peers(exclude).await {
            let p2p = self.p2p.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = p2p.request(peer, ProtocolId::BlkAnn, payload).await;
            });
        }
    }

    async fn shuffled_peers(&self, exclude: Option<PeerId>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .p2p
            .peers()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.peer_id)
            .filter(|p| exclude.as_ref() != Some(p))
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers
    }

    /// Fetch a transaction announced by `from`, verify it, admit it, and
    /// re-announce.
    async fn fetch_announced_tx(&self, from: PeerId, hash: Hash) {
        let resp = match self
            .p2p
            .request(from, ProtocolId::Tx, HashReq { hash }.encode())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "Announced tx fetch failed");
                return;
            }
        };
        if is_no_data(&resp) {
            return;
        }
        let tx: Transaction = match crate::deserialize(&resp) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(error = %e, "Announced tx undecodable");
                return;
            }
        };
        if tx.hash() != hash {
            tracing::debug!(peer = %hex::encode(&from[..8]), "Announced tx hash mismatch");
            return;
        }
        let identifier = match self.txapp.verify(&tx) {
            Ok(identifier) => identifier,
            Err(e) => {
                tracing::debug!(error = %e, "Announced tx failed verification");
                return;
            }
        };
        let account = self.txapp.account(&identifier);
        let admitted = {
            let mut mempool = self.mempool.lock().expect("mempool lock poisoned");
            mempool.insert(tx, &identifier, account.as_ref())
        };
        match admitted {
            Ok(hash) => self.announce_tx(hash, Some(from)).await,
            Err(e) => tracing::debug!(error = %e, "Announced tx rejected"),
        }
    }

    /// Fetch a committed block announced by `from` and hand it to the
    /// consensus driver. The caller reserved the fetch; the guard is held
    /// for the duration.
    async fn fetch_announced_block(
        &self,
        from: PeerId,
        ann: BlockAnn,
        _guard: crate::node::store::PrefetchGuard,
    ) {
        let resp = match self
            .p2p
            .request(from, ProtocolId::Block, HashReq { hash: ann.hash }.encode())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "Announced block fetch failed");
                return;
            }
        };
        if is_no_data(&resp) || resp.len() < 32 {
            return;
        }
        let mut app_hash = [0u8; 32];
        app_hash.copy_from_slice(&resp[..32]);
        if app_hash != ann.app_hash {
            tracing::debug!(peer = %hex::encode(&from[..8]), "Block response app hash mismatch");
            return;
        }
        let block: Block = match crate::deserialize(&resp[32..]) {
            Ok(block) => block,
            Err(e) => {
                tracing::debug!(error = %e, "Announced block undecodable");
                return;
            }
        };
        if block.hash() != ann.hash {
            tracing::debug!(peer = %hex::encode(&from[..8]), "Announced block hash mismatch");
            return;
        }
        self.consensus
            .send(ConsensusInput::Commit { block, app_hash })
            .await;

        // propagate the announcement
        self.announce_block(&ann, Some(from)).await;
    }

    /// Whether `pubkey` belongs to a validator with voting power.
    fn is_validator(&self, pubkey: &[u8]) -> bool {
        self.validators
            .read()
            .expect("validators lock poisoned")
            .get(&hex::encode(pubkey))
            .map(|v| v.power > 0)
            .unwrap_or(false)
    }
}

/// The node itself: construction wires everything, `run` drives it.
pub struct Node {
    config: NodeConfig,
    handle: NodeHandle,
    p2p_events: mpsc::Receiver<P2pEvent>,
    consensus_out: mpsc::Receiver<ConsensusOutput>,
    engine: Option<ConsensusEngine>,
    seen: SeenCache,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    dummy_nonce: u64,
}

impl Node {
    /// Create and wire a node. The shutdown token is the root of every
    /// task this node spawns.
    pub async fn new(config: NodeConfig, shutdown: CancellationToken) -> Result<Node, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store: Arc<dyn BlockStore> = if config.memory_store {
            Arc::new(MemBlockStore::new())
        } else {
            Arc::new(SledBlockStore::open(&config.data_dir.join("blockstore"))?)
        };

        let accounts = Arc::new(MemAccountStore::new());
        let engine = Arc::new(DatasetEngine::new());
        let validators: Arc<RwLock<HashMap<String, Validator>>> = Arc::new(RwLock::new(
            config
                .validators
                .iter()
                .map(|v| (hex::encode(&v.pubkey), v.clone()))
                .collect(),
        ));
        let txapp = Arc::new(TxApp::new(
            config.chain_id.clone(),
            Pricer::new(config.gas_enabled),
            accounts,
            engine,
            validators.clone(),
            config.join_threshold,
            crate::voting::DEFAULT_JOIN_EXPIRY_BLOCKS,
        ));
        let mempool = Arc::new(Mutex::new(Mempool::new(MempoolConfig {
            gas_enabled: config.gas_enabled,
            ..Default::default()
        })));

        let p2p_result = p2p::start(
            P2pConfig {
                listen_addr: config.listen_addr,
                max_peers: config.target_connections.max(8) * 4,
                keypair: config.keypair.clone(),
                chain_id: config.chain_id.clone(),
            },
            shutdown.clone(),
        )
        .await?;
        let p2p = p2p_result.handle;
        let local_addr = p2p_result.local_addr;

        let peer_man = PeerMan::new(
            p2p.clone(),
            config.data_dir.join("addrbook.json"),
            config.pex,
            config.target_connections,
        );

        let (engine, consensus, consensus_out) = ConsensusEngine::create(
            ConsensusConfig {
                role: config.role,
                keypair: config.keypair.clone(),
                leader_pubkey: config.leader_pubkey.clone(),
                chain_id: config.chain_id.clone(),
                propose_interval: config.propose_interval,
                ack_timeout: config.ack_timeout,
                max_block_txs: crate::constants::BLOCK_TX_COUNT,
                empty_blocks: false,
            },
            store.clone(),
            mempool.clone(),
            txapp.clone(),
            validators.clone(),
        );

        let handle = NodeHandle {
            chain_id: config.chain_id.clone(),
            role: config.role,
            p2p,
            store,
            mempool,
            txapp,
            validators,
            peer_man,
            consensus,
            leader_pubkey: config.leader_pubkey.clone(),
        };

        tracing::info!(
            peer = %hex::encode(&config.keypair.peer_id()[..8]),
            addr = %local_addr,
            role = %config.role,
            "Node ready"
        );

        Ok(Node {
            config,
            handle,
            p2p_events: p2p_result.events,
            consensus_out,
            engine: Some(engine),
            seen: SeenCache::new(10_000),
            local_addr,
            shutdown,
            dummy_nonce: 0,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// The actual P2P listen address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until the shutdown token fires: starts the peer manager and the
    /// consensus driver, connects bootstrap peers, then serves the event
    /// loop.
    pub async fn run(mut self) {
        let token = self.shutdown.clone();
        self.handle.peer_man.clone().start(token.clone());

        let engine = self.engine.take().expect("engine consumed once");
        let engine_token = token.clone();
        let consensus_task = tokio::spawn(engine.run(engine_token));

        for addr in self.config.bootstrap_peers.clone() {
            match self.handle.p2p.connect(addr).await {
                Ok(peer) => {
                    tracing::info!(addr = %addr, peer = %hex::encode(&peer[..8]), "Connected to bootstrap peer");
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Failed to connect to bootstrap peer");
                }
            }
        }

        let mut dummy_tick = tokio::time::interval(
            self.config
                .dummy_tx_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        let mut rebroadcast_tick = tokio::time::interval(Duration::from_millis(
            crate::constants::REBROADCAST_INTERVAL_MS,
        ));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = self.p2p_events.recv() => {
                    self.handle_p2p_event(event).await;
                }
                Some(output) = self.consensus_out.recv() => {
                    self.handle_consensus_output(output).await;
                }
                _ = dummy_tick.tick() => {
                    if self.config.role == Role::Leader && self.config.dummy_tx_interval.is_some() {
                        self.send_dummy_tx().await;
                    }
                }
                _ = rebroadcast_tick.tick() => {
                    self.rebroadcast_marked().await;
                }
            }
        }

        // orderly shutdown: persist the address book, stop the transport,
        // join the driver
        if let Err(e) = self.handle.peer_man.save_peers() {
            tracing::warn!(error = %e, "Failed to save address book on shutdown");
        }
        let _ = self.handle.p2p.shutdown().await;
        let _ = consensus_task.await;
        tracing::info!("Node shutdown complete");
    }

    async fn handle_p2p_event(&mut self, event: P2pEvent) {
        match event {
            P2pEvent::PeerConnected { peer, listen_addr, protocols, .. } => {
                tracing::info!(peer = %hex::encode(&peer[..8]), addr = %listen_addr, "Peer connected");
                self.handle.peer_man.connected(peer, listen_addr, protocols);
            }
            P2pEvent::PeerDisconnected { peer, open_for } => {
                tracing::info!(peer = %hex::encode(&peer[..8]), "Peer disconnected");
                self.handle
                    .peer_man
                    .clone()
                    .disconnected(peer, open_for, self.shutdown.clone());
            }
            P2pEvent::Request { from, proto, payload, reply } => {
                let response = self.serve_request(from, proto, &payload);
                let _ = reply.send(response);
            }
            P2pEvent::Announce { from, proto, payload } => {
                self.handle_announce(from, proto, payload).await;
            }
            P2pEvent::Gossip { from, proto, payload } => {
                self.handle_gossip(from, proto, payload).await;
            }
        }
    }

    /// Malformed wire input on a stream: drop the peer's connection. The
    /// protocol error never escalates past the stream.
    fn protocol_violation(&self, from: PeerId, what: &str) {
        tracing::debug!(peer = %hex::encode(&from[..8]), what, "Protocol error, closing stream");
        let p2p = self.handle.p2p.clone();
        tokio::spawn(async move {
            let _ = p2p.disconnect(from).await;
        });
    }

    /// Serve one protocol request. Lookups and interest decisions only;
    /// never holds a lock across I/O because the reply is a channel send
    /// and content fetches run in spawned tasks.
    fn serve_request(&mut self, from: PeerId, proto: ProtocolId, payload: &[u8]) -> Vec<u8> {
        match proto {
            ProtocolId::TxAnn => {
                // announcement: reply "get" when we want the content, empty
                // otherwise; the fetch itself goes over `kwil/tx/1`
                let Ok(req) = HashReq::decode(payload) else {
                    self.protocol_violation(from, "txann hash");
                    return vec![];
                };
                if !self.seen.insert(crate::hash_concat(&[b"txann", &req.hash])) {
                    return vec![];
                }
                let known = {
                    let mempool = self.handle.mempool.lock().expect("mempool lock poisoned");
                    mempool.contains(&req.hash)
                } || self.handle.store.have_tx(&req.hash);
                if known {
                    return vec![];
                }
                let handle = self.handle.clone();
                tokio::spawn(async move { handle.fetch_announced_tx(from, req.hash).await });
                GET_MSG.to_vec()
            }
            ProtocolId::BlkAnn => {
                let ann = match BlockAnn::decode(payload) {
                    Ok(ann) => ann,
                    Err(e) => {
                        self.protocol_violation(from, &format!("block announcement: {}", e));
                        return vec![];
                    }
                };
                // the announcement must carry the leader's signature over
                // the block hash, checked before any fetch happens
                if verify_ed25519(&self.handle.leader_pubkey, &ann.hash, &ann.leader_sig).is_err() {
                    tracing::debug!(peer = %hex::encode(&from[..8]), "Block announcement with bad leader sig");
                    return vec![];
                }
                if !self.seen.insert(crate::hash_concat(&[b"blkann", &ann.hash])) {
                    return vec![];
                }
                let (should_fetch, guard) = self.handle.store.prefetch(&ann.hash);
                if !should_fetch {
                    return vec![];
                }
                let handle = self.handle.clone();
                tokio::spawn(async move { handle.fetch_announced_block(from, ann, guard).await });
                GET_MSG.to_vec()
            }
            ProtocolId::Tx => {
                let Ok(req) = HashReq::decode(payload) else {
                    self.protocol_violation(from, "tx hash");
                    return NO_DATA.to_vec();
                };
                // mempool first, then the confirmed index
                let pooled = {
                    let mempool = self.handle.mempool.lock().expect("mempool lock poisoned");
                    mempool.get(&req.hash).cloned()
                };
                let tx = pooled.or_else(|| {
                    self.handle
                        .store
                        .get_tx(&req.hash)
                        .ok()
                        .flatten()
                        .map(|loc| loc.tx)
                });
                match tx.and_then(|tx| crate::serialize(&tx).ok()) {
                    Some(bytes) => bytes,
                    None => NO_DATA.to_vec(),
                }
            }
            ProtocolId::Block => {
                let Ok(req) = HashReq::decode(payload) else {
                    self.protocol_violation(from, "block hash");
                    return NO_DATA.to_vec();
                };
                match self.handle.store.get(&req.hash) {
                    Ok(Some((block, app_hash))) => {
                        let Ok(block_bytes) = crate::serialize(&block) else {
                            return NO_DATA.to_vec();
                        };
                        let mut resp = Vec::with_capacity(32 + block_bytes.len());
                        resp.extend_from_slice(&app_hash);
                        resp.extend_from_slice(&block_bytes);
                        resp
                    }
                    _ => NO_DATA.to_vec(),
                }
            }
            ProtocolId::BlockHeight => {
                let Ok(req) = BlockHeightReq::decode(payload) else {
                    self.protocol_violation(from, "block height");
                    return NO_DATA.to_vec();
                };
                match self.handle.store.get_by_height(req.height) {
                    Ok(Some((hash, block, _))) => {
                        let Ok(block_bytes) = crate::serialize(&block) else {
                            return NO_DATA.to_vec();
                        };
                        let mut resp = Vec::with_capacity(32 + block_bytes.len());
                        resp.extend_from_slice(&hash);
                        resp.extend_from_slice(&block_bytes);
                        resp
                    }
                    _ => NO_DATA.to_vec(),
                }
            }
            ProtocolId::Discovery => {
                if !self.config.pex || payload != DISCOVER_PEERS_MSG {
                    return NO_DATA.to_vec();
                }
                let (all, _, _) = self.handle.peer_man.known_peers();
                // don't hand the requester itself back
                let filtered: Vec<_> = all
                    .into_iter()
                    .filter(|p| p.id != hex::encode(from))
                    .collect();
                crate::serialize(&filtered).unwrap_or_else(|_| NO_DATA.to_vec())
            }
            // snapshot serving is a stub: the codecs round-trip, the data
            // is not yet offered
            ProtocolId::SnapshotCatalog | ProtocolId::SnapshotChunk | ProtocolId::SnapshotMeta => {
                NO_DATA.to_vec()
            }
            _ => NO_DATA.to_vec(),
        }
    }

    async fn handle_announce(&mut self, from: PeerId, proto: ProtocolId, payload: Vec<u8>) {
        match proto {
            ProtocolId::BlkProp => {
                let block: Block = match crate::deserialize(&payload) {
                    Ok(block) => block,
                    Err(e) => {
                        tracing::debug!(error = %e, "Malformed block proposal");
                        return;
                    }
                };
                let block_hash = block.hash();
                if !self.seen.insert(crate::hash_concat(&[b"blkprop", &block_hash])) {
                    return;
                }
                self.handle
                    .consensus
                    .send(ConsensusInput::Proposal { block })
                    .await;
            }
            _ => {}
        }
    }

    async fn handle_gossip(&mut self, from: PeerId, proto: ProtocolId, payload: Vec<u8>) {
        match proto {
            ProtocolId::Ack => {
                let ack = match AckPayload::decode(&payload) {
                    Ok(ack) => ack,
                    Err(e) => {
                        tracing::debug!(error = %e, "Malformed ACK gossip");
                        return;
                    }
                };
                let dedup = crate::hash_concat(&[
                    b"ack",
                    &ack.validator,
                    &(ack.height as u64).to_le_bytes(),
                    &ack.block_hash,
                    &[u8::from(ack.ack)],
                ]);
                if !self.seen.insert(dedup) {
                    return;
                }
                // boundary verification; the driver re-checks before counting
                if !self.handle.is_validator(&ack.validator) {
                    tracing::debug!("ACK gossip from non-validator dropped");
                    return;
                }
                let sign_bytes = AckPayload::sign_bytes(
                    &self.handle.chain_id,
                    ack.height,
                    &ack.block_hash,
                    &ack.app_hash,
                    ack.ack,
                );
                if verify_ed25519(&ack.validator, &sign_bytes, &ack.signature).is_err() {
                    tracing::debug!("ACK gossip with bad signature dropped");
                    return;
                }
                self.handle
                    .consensus
                    .send(ConsensusInput::Ack(ack))
                    .await;
                let _ = self
                    .handle
                    .p2p
                    .gossip(ProtocolId::Ack, payload, Some(from))
                    .await;
            }
            ProtocolId::Reset => {
                let reset = match ResetPayload::decode(&payload) {
                    Ok(reset) => reset,
                    Err(e) => {
                        tracing::debug!(error = %e, "Malformed reset gossip");
                        return;
                    }
                };
                let dedup = crate::hash_concat(&[
                    b"reset",
                    &reset.validator,
                    &(reset.height as u64).to_le_bytes(),
                    reset.reason.as_bytes(),
                ]);
                if !self.seen.insert(dedup) {
                    return;
                }
                if !self.handle.is_validator(&reset.validator) {
                    tracing::debug!("Reset gossip from non-validator dropped");
                    return;
                }
                let sign_bytes =
                    ResetPayload::sign_bytes(&self.handle.chain_id, reset.height, &reset.reason);
                if verify_ed25519(&reset.validator, &sign_bytes, &reset.signature).is_err() {
                    tracing::debug!("Reset gossip with bad signature dropped");
                    return;
                }
                self.handle
                    .consensus
                    .send(ConsensusInput::Reset {
                        height: reset.height,
                        reason: reset.reason.clone(),
                    })
                    .await;
                let _ = self
                    .handle
                    .p2p
                    .gossip(ProtocolId::Reset, payload, Some(from))
                    .await;
            }
            _ => {}
        }
    }

    async fn handle_consensus_output(&mut self, output: ConsensusOutput) {
        match output {
            ConsensusOutput::AnnounceProposal { block } => {
                let Ok(payload) = crate::serialize(&block) else { return };
                // mark our own proposal as seen so the relay echo is ignored
                self.seen
                    .insert(crate::hash_concat(&[b"blkprop", &block.hash()]));
                for peer in self.handle.shuffled_peers(None).await {
                    let _ = self
                        .handle
                        .p2p
                        .announce(peer, ProtocolId::BlkProp, payload.clone())
                        .await;
                }
            }
            ConsensusOutput::AnnounceCommit { block, app_hash } => {
                let ann = BlockAnn {
                    hash: block.hash(),
                    height: block.header.height,
                    app_hash,
                    leader_sig: block.leader_sig.clone(),
                };
                self.seen
                    .insert(crate::hash_concat(&[b"blkann", &ann.hash]));
                self.handle.announce_block(&ann, None).await;
            }
            ConsensusOutput::BroadcastAck(ack) => {
                let _ = self
                    .handle
                    .p2p
                    .gossip(ProtocolId::Ack, ack.encode(), None)
                    .await;
            }
            ConsensusOutput::BroadcastReset(reset) => {
                // the driver already reset its own round before emitting this
                let _ = self
                    .handle
                    .p2p
                    .gossip(ProtocolId::Reset, reset.encode(), None)
                    .await;
            }
        }
    }

    /// Leader-only traffic generator: a padded transfer per tick, admitted
    /// and announced like any user transaction.
    async fn send_dummy_tx(&mut self) {
        let identifier = hex::encode(self.config.keypair.public_bytes());
        if self.dummy_nonce == 0 {
            let chain_nonce = self
                .handle
                .txapp
                .account(&identifier)
                .map(|a| a.nonce)
                .unwrap_or(0);
            let depth = {
                let mempool = self.handle.mempool.lock().expect("mempool lock poisoned");
                mempool.pending_nonces(&identifier).len() as u64
            };
            self.dummy_nonce = chain_nonce + depth;
        }
        self.dummy_nonce += 1;

        let filler = "00".repeat(self.config.dummy_tx_size / 2);
        let tx = Transaction::signed_ed25519(
            &self.config.keypair,
            TxBody {
                description: filler,
                payload: Payload::Transfer {
                    to: identifier.clone(),
                    amount: 0,
                },
                fee: 0,
                nonce: self.dummy_nonce,
                chain_id: self.config.chain_id.clone(),
            },
        );
        match self.handle.broadcast_tx(tx).await {
            Ok(hash) => {
                tracing::debug!(hash = %hex::encode(&hash[..8]), nonce = self.dummy_nonce, "Dummy tx broadcast");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dummy tx rejected");
                self.dummy_nonce -= 1;
            }
        }
    }

    /// Re-announce transactions the mempool marked after a recheck.
    async fn rebroadcast_marked(&mut self) {
        let txs = {
            let mut mempool = self.handle.mempool.lock().expect("mempool lock poisoned");
            mempool.take_rebroadcast()
        };
        for tx in txs {
            self.handle.announce_tx(tx.hash(), None).await;
        }
    }
}
