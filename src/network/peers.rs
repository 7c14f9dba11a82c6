//! Peer/connection manager.
//!
//! Responsibilities, in order:
//!  1. own the peerstore (and its address book file)
//!  2. react to connect/disconnect notifications from the transport
//!  3. reconnect dropped peers with capped exponential backoff
//!  4. maintain a minimum number of connections
//!  5. evict peers disconnected for over a week
//!  6. peer exchange: learn new peers from connected ones
//!
//! The manager consumes only the narrow [`Connector`] capability, not the
//! whole transport; the node wires the real P2P handle in, tests wire a
//! mock.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::p2p::{ConnectedPeer, P2pError, P2pHandle};
use super::protocol::{ProtocolId, DISCOVER_PEERS_MSG};
use super::{PeerId, PeerInfo};

/// Base delay for reconnect backoff; doubles each attempt, capped at 60s.
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Cap on a single reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Tick while we have zero connections.
const URGENT_CONN_INTERVAL: Duration = Duration::from_secs(1);
/// Tick while at least one connection is up.
const NORMAL_CONN_INTERVAL: Duration = Duration::from_secs(20);
/// Per-peer timeout for a discovery request during PEX.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);
/// New peers dialed per PEX round.
const PEX_DIAL_CAP: usize = 8;

/// Narrow transport capability consumed by the peer manager.
pub trait Connector: Send + Sync + 'static {
    /// Dial any of the given addresses; resolves when one handshake
    /// completes.
    fn dial(&self, addrs: &[SocketAddr]) -> impl Future<Output = Result<PeerId, P2pError>> + Send;

    /// Ask a connected peer for its known peers over the discovery
    /// protocol.
    fn request_peers(
        &self,
        peer: PeerId,
    ) -> impl Future<Output = Result<Vec<PeerInfo>, P2pError>> + Send;

    /// Currently connected peers.
    fn connected_peers(&self) -> impl Future<Output = Vec<ConnectedPeer>> + Send;
}

impl<C: Connector> Connector for Arc<C> {
    async fn dial(&self, addrs: &[SocketAddr]) -> Result<PeerId, P2pError> {
        (**self).dial(addrs).await
    }

    async fn request_peers(&self, peer: PeerId) -> Result<Vec<PeerInfo>, P2pError> {
        (**self).request_peers(peer).await
    }

    async fn connected_peers(&self) -> Vec<ConnectedPeer> {
        (**self).connected_peers().await
    }
}

impl Connector for P2pHandle {
    async fn dial(&self, addrs: &[SocketAddr]) -> Result<PeerId, P2pError> {
        let mut last_err = P2pError::ConnectionFailed("no addresses".into());
        for addr in addrs {
            match self.connect(*addr).await {
                Ok(peer) => return Ok(peer),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn request_peers(&self, peer: PeerId) -> Result<Vec<PeerInfo>, P2pError> {
        let resp = self
            .request(peer, ProtocolId::Discovery, DISCOVER_PEERS_MSG.to_vec())
            .await?;
        if super::protocol::is_no_data(&resp) || resp.is_empty() {
            return Ok(vec![]);
        }
        crate::deserialize(&resp).map_err(P2pError::SendFailed)
    }

    async fn connected_peers(&self) -> Vec<ConnectedPeer> {
        self.peers().await.unwrap_or_default()
    }
}

/// One known peer in the peerstore.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub addrs: Vec<SocketAddr>,
    pub protocols: Vec<String>,
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
}

/// The peer manager. Owns the peerstore; all external access goes through
/// its API.
pub struct PeerMan<C> {
    connector: C,
    addr_book: PathBuf,
    pex: bool,
    target_connections: usize,
    store: Mutex<HashMap<PeerId, PeerRecord>>,
    reconnecting: Mutex<HashSet<PeerId>>,
}

impl<C: Connector> PeerMan<C> {
    /// Create the manager and load the address book if present.
    pub fn new(connector: C, addr_book: PathBuf, pex: bool, target_connections: usize) -> Arc<Self> {
        let pm = Arc::new(PeerMan {
            connector,
            addr_book,
            pex,
            target_connections: target_connections.max(1),
            store: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
        });
        match load_peers(&pm.addr_book) {
            Ok(peers) => {
                let count = pm.add_peers(&peers);
                tracing::info!(count, "Loaded address book");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load address book"),
        }
        pm
    }

    /// Spawn the maintenance, eviction, and (optional) PEX loops. All
    /// terminate when `ctx` is cancelled.
    pub fn start(self: Arc<Self>, ctx: CancellationToken) {
        let pm = self.clone();
        let token = ctx.clone();
        tokio::spawn(async move { pm.maintain_min_peers(token).await });

        let pm = self.clone();
        let token = ctx.clone();
        tokio::spawn(async move { pm.remove_old_peers(token).await });

        if self.pex {
            let pm = self.clone();
            tokio::spawn(async move { pm.pex_loop(ctx).await });
        }
    }

    /// Transport notification: a peer finished its handshake.
    pub fn connected(&self, peer: PeerId, listen_addr: SocketAddr, protocols: Vec<String>) {
        let mut store = self.store.lock().expect("peerstore lock poisoned");
        let record = store.entry(peer).or_insert_with(|| PeerRecord {
            addrs: vec![],
            protocols: vec![],
            connected: false,
            disconnected_at: None,
        });
        if !record.addrs.contains(&listen_addr) {
            record.addrs.push(listen_addr);
        }
        record.protocols = protocols;
        record.connected = true;
        record.disconnected_at = None;
    }

    /// Transport notification: a peer connection closed. Records the
    /// timestamp and spawns the reconnect task.
    pub fn disconnected(self: Arc<Self>, peer: PeerId, open_for: Duration, ctx: CancellationToken) {
        {
            let mut store = self.store.lock().expect("peerstore lock poisoned");
            let Some(record) = store.get_mut(&peer) else { return };
            record.connected = false;
            record.disconnected_at = Some(Instant::now());
        }
        if ctx.is_cancelled() {
            return;
        }
        {
            let mut reconnecting = self.reconnecting.lock().expect("reconnect lock poisoned");
            if !reconnecting.insert(peer) {
                return; // a reconnect task is already running for this peer
            }
        }
        let pm = self.clone();
        tokio::spawn(async move {
            // Initial grace before the first attempt; connections that died
            // within a second back off harder.
            let mut delay = Duration::from_secs(1);
            if open_for < Duration::from_secs(1) {
                delay *= 3;
            }
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = tokio::time::sleep(delay) => pm.reconnect_with_retry(peer, ctx).await,
            }
            pm.reconnecting
                .lock()
                .expect("reconnect lock poisoned")
                .remove(&peer);
        });
    }

    /// Reconnect with exponential backoff and capped retries.
    async fn reconnect_with_retry(&self, peer: PeerId, ctx: CancellationToken) {
        for attempt in 0..crate::constants::MAX_RECONNECT_ATTEMPTS {
            let (addrs, still_down) = {
                let store = self.store.lock().expect("peerstore lock poisoned");
                match store.get(&peer) {
                    Some(record) => (record.addrs.clone(), !record.connected),
                    None => return, // evicted meanwhile
                }
            };
            if !still_down {
                return; // the peer came back on its own (e.g. inbound)
            }
            if addrs.is_empty() {
                return;
            }

            let delay = BASE_RECONNECT_DELAY
                .saturating_mul(1u32 << attempt.min(5))
                .min(MAX_RECONNECT_DELAY);

            tracing::debug!(
                peer = %hex::encode(&peer[..8]),
                attempt = attempt + 1,
                "Attempting reconnection"
            );
            match self.connector.dial(&addrs).await {
                Ok(_) => {
                    tracing::info!(peer = %hex::encode(&peer[..8]), "Reconnected to peer");
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        peer = %hex::encode(&peer[..8]),
                        error = %e,
                        delay = ?delay,
                        "Reconnect failed, backing off"
                    );
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!(peer = %hex::encode(&peer[..8]), "Exceeded max reconnect attempts, giving up");
    }

    /// Keep at least `target_connections` peers connected. Ticks fast
    /// while starved, slow otherwise.
    async fn maintain_min_peers(&self, ctx: CancellationToken) {
        let mut interval = tokio::time::interval(URGENT_CONN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = interval.tick() => {}
            }

            let (_, connected, disconnected) = self.known_peers();
            let active = connected.len();
            if active < self.target_connections {
                if active == 0 && disconnected.is_empty() {
                    tracing::warn!("No connected peers and no known addresses to dial");
                    continue;
                }
                tracing::info!(
                    active,
                    target = self.target_connections,
                    "Below connection target, dialing known peers"
                );
                let mut added = 0usize;
                for info in &disconnected {
                    let addrs: Vec<SocketAddr> =
                        info.addresses.iter().filter_map(|a| a.parse().ok()).collect();
                    if addrs.is_empty() {
                        continue;
                    }
                    match self.connector.dial(&addrs).await {
                        Ok(_) => added += 1,
                        Err(e) => {
                            tracing::debug!(peer = %info.id, error = %e, "Failed to dial peer");
                        }
                    }
                }
                // Keep hammering known addresses until something connects.
                if added == 0 && active == 0 {
                    interval = tokio::time::interval(URGENT_CONN_INTERVAL);
                } else {
                    interval = tokio::time::interval(NORMAL_CONN_INTERVAL);
                }
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.reset();
            }
        }
    }

    /// Periodically drop peers disconnected for over the limit.
    async fn remove_old_peers(&self, ctx: CancellationToken) {
        let limit = Duration::from_secs(crate::constants::DISCONNECT_LIMIT_SECS);
        let mut interval = tokio::time::interval(Duration::from_secs(
            crate::constants::PEER_EVICT_INTERVAL_SECS,
        ));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.evict_older_than(limit);
        }
    }

    /// Remove every disconnected peer whose last disconnect is older than
    /// `limit`. Exposed for tests.
    pub fn evict_older_than(&self, limit: Duration) {
        let mut store = self.store.lock().expect("peerstore lock poisoned");
        let now = Instant::now();
        store.retain(|peer, record| {
            let stale = !record.connected
                && record
                    .disconnected_at
                    .map(|t| now.duration_since(t) > limit)
                    .unwrap_or(false);
            if stale {
                tracing::info!(peer = %hex::encode(&peer[..8]), "Removed long-disconnected peer");
            }
            !stale
        });
    }

    /// Peer-exchange loop: learn addresses from connected peers, dial a
    /// bounded number of new ones, persist the address book.
    async fn pex_loop(&self, ctx: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(crate::constants::PEX_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = interval.tick() => {}
            }

            let discovered = self.find_peers("kwil").await;
            let new_count = self.add_peers(&discovered);
            if new_count > 0 {
                tracing::debug!(count = new_count, "PEX discovered new peers");
                let mut dialed = 0usize;
                for info in &discovered {
                    if dialed >= PEX_DIAL_CAP {
                        break;
                    }
                    let Some(peer_id) = info.peer_id() else { continue };
                    let already_connected = {
                        let store = self.store.lock().expect("peerstore lock poisoned");
                        store.get(&peer_id).map(|r| r.connected).unwrap_or(false)
                    };
                    if already_connected {
                        continue;
                    }
                    let addrs: Vec<SocketAddr> =
                        info.addresses.iter().filter_map(|a| a.parse().ok()).collect();
                    if addrs.is_empty() {
                        continue;
                    }
                    if self.connector.dial(&addrs).await.is_ok() {
                        dialed += 1;
                    }
                }
            }
            if let Err(e) = self.save_peers() {
                tracing::warn!(error = %e, "Failed to write address book");
            }
        }
    }

    /// Ask every currently-connected peer for its peers over the discovery
    /// protocol. The namespace is carried for forward compatibility; the
    /// wire protocol today has a single namespace.
    pub async fn find_peers(&self, _namespace: &str) -> Vec<PeerInfo> {
        let connected = self.connector.connected_peers().await;
        let mut found = Vec::new();
        for peer in connected {
            let request = tokio::time::timeout(
                DISCOVER_TIMEOUT,
                self.connector.request_peers(peer.peer_id),
            );
            match request.await {
                Ok(Ok(peers)) => found.extend(peers),
                Ok(Err(e)) => {
                    tracing::debug!(peer = %hex::encode(&peer.peer_id[..8]), error = %e, "Discovery request failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %hex::encode(&peer.peer_id[..8]), "Discovery request timed out");
                }
            }
        }
        found
    }

    /// Merge peer infos into the store; returns how many new address
    /// entries were added.
    pub fn add_peers(&self, peers: &[PeerInfo]) -> usize {
        let mut store = self.store.lock().expect("peerstore lock poisoned");
        let mut count = 0usize;
        for info in peers {
            let Some(peer_id) = info.peer_id() else {
                tracing::warn!(id = %info.id, "Skipping peer with malformed id");
                continue;
            };
            let record = store.entry(peer_id).or_insert_with(|| PeerRecord {
                addrs: vec![],
                protocols: vec![],
                connected: false,
                disconnected_at: None,
            });
            for addr in &info.addresses {
                let Ok(addr) = addr.parse::<SocketAddr>() else { continue };
                if !record.addrs.contains(&addr) {
                    record.addrs.push(addr);
                    count += 1;
                }
            }
            for proto in &info.protocols {
                if !record.protocols.contains(proto) {
                    record.protocols.push(proto.clone());
                }
            }
        }
        count
    }

    /// Snapshot of all known peers, split into connected and disconnected.
    pub fn known_peers(&self) -> (Vec<PeerInfo>, Vec<PeerInfo>, Vec<PeerInfo>) {
        let store = self.store.lock().expect("peerstore lock poisoned");
        let mut all = Vec::with_capacity(store.len());
        let mut connected = Vec::new();
        let mut disconnected = Vec::new();
        for (peer_id, record) in store.iter() {
            let info = PeerInfo {
                id: hex::encode(peer_id),
                addresses: record.addrs.iter().map(|a| a.to_string()).collect(),
                protocols: record.protocols.clone(),
            };
            if record.connected {
                connected.push(info.clone());
            } else {
                disconnected.push(info.clone());
            }
            all.push(info);
        }
        (all, connected, disconnected)
    }

    /// Persist all known peers to the address book file.
    pub fn save_peers(&self) -> std::io::Result<()> {
        let (all, _, _) = self.known_peers();
        persist_peers(&all, &self.addr_book)
    }
}

/// Save known peers to a JSON file.
fn persist_peers(peers: &[PeerInfo], path: &PathBuf) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(peers)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}

/// Load the address book. Unknown JSON keys are ignored.
fn load_peers(path: &PathBuf) -> std::io::Result<Vec<PeerInfo>> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
