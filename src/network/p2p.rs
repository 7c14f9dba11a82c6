//! P2P transport: a stream-oriented TCP overlay.
//!
//! Each peer connection carries length-framed multiplexed messages
//! (`protocol::Frame`): requests with correlation ids, their responses,
//! one-way announcements, and gossip. A plaintext hello exchange at
//! connect time pins the protocol version, chain id, peer identity, and
//! advertised protocol list.
//!
//! The overlay is driven by a single event loop owning the peer table;
//! the application talks to it through a cloneable [`P2pHandle`] and
//! consumes [`P2pEvent`]s from a bounded channel. Stream handlers never
//! hold application locks across network operations because all network
//! I/O lives in per-connection tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::protocol::{Frame, FrameKind, ProtocolId};
use super::PeerId;
use crate::crypto::{peer_id_from_pubkey, NodeKeypair};

/// Overlay protocol version, checked at handshake.
pub const P2P_VERSION: u32 = 1;

/// Errors from P2P operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum P2pError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("peer limit reached ({0})")]
    PeerLimitReached(usize),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("peer not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("shutdown")]
    Shutdown,
}

/// Configuration for the overlay.
#[derive(Clone)]
pub struct P2pConfig {
    pub listen_addr: SocketAddr,
    pub max_peers: usize,
    pub keypair: NodeKeypair,
    pub chain_id: String,
}

/// Plaintext handshake message, exchanged once per connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Hello {
    version: u32,
    chain_id: String,
    pubkey: Vec<u8>,
    listen_port: u16,
    protocols: Vec<String>,
}

/// A connected peer as reported by `peers()`.
#[derive(Clone, Debug)]
pub struct ConnectedPeer {
    pub peer_id: PeerId,
    pub pubkey: Vec<u8>,
    /// Remote address of the live connection.
    pub addr: SocketAddr,
    /// The address the peer says it listens on (their port, our view of
    /// their IP). This is what goes into the address book.
    pub listen_addr: SocketAddr,
    pub protocols: Vec<String>,
    pub outbound: bool,
}

/// A command sent from the application to the P2P event loop.
enum P2pCommand {
    Connect(SocketAddr, oneshot::Sender<Result<PeerId, P2pError>>),
    Disconnect(PeerId),
    Request {
        peer: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, P2pError>>,
    },
    Announce {
        peer: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
    },
    Gossip {
        proto: ProtocolId,
        payload: Vec<u8>,
        exclude: Option<PeerId>,
    },
    GetPeers(oneshot::Sender<Vec<ConnectedPeer>>),
    Shutdown,
}

/// An event received from the P2P layer by the application.
#[derive(Debug)]
pub enum P2pEvent {
    /// A connection completed its handshake (inbound or outbound).
    PeerConnected {
        peer: PeerId,
        listen_addr: SocketAddr,
        protocols: Vec<String>,
        outbound: bool,
    },
    /// A peer connection closed. `open_for` is how long it was up.
    PeerDisconnected { peer: PeerId, open_for: Duration },
    /// An inbound request; send the response bytes through `reply`.
    Request {
        from: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// A one-way announcement.
    Announce {
        from: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
    },
    /// A gossiped message.
    Gossip {
        from: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
    },
}

/// Commands from the event loop to one connection task.
enum ConnCommand {
    Request {
        proto: ProtocolId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, P2pError>>,
    },
    Response {
        id: u64,
        proto: ProtocolId,
        payload: Vec<u8>,
    },
    OneWay {
        kind: FrameKind,
        proto: ProtocolId,
        payload: Vec<u8>,
    },
    Close,
}

/// Internal event from connection tasks to the main P2P loop.
enum InternalEvent {
    Connected {
        peer_id: PeerId,
        pubkey: Vec<u8>,
        addr: SocketAddr,
        listen_addr: SocketAddr,
        protocols: Vec<String>,
        outbound: bool,
        conn_tx: mpsc::Sender<ConnCommand>,
        accepted: oneshot::Sender<bool>,
    },
    Disconnected {
        peer_id: PeerId,
        open_for: Duration,
    },
}

/// Handle for the application to interact with the P2P layer.
#[derive(Clone)]
pub struct P2pHandle {
    command_tx: mpsc::Sender<P2pCommand>,
}

impl P2pHandle {
    /// Dial a peer and wait for the handshake to complete.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::Connect(addr, tx))
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)?
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Disconnect(peer))
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Issue a request on `proto` and await the response, bounded by the
    /// protocol's content timeout.
    pub async fn request(
        &self,
        peer: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::Request {
                peer,
                proto,
                payload,
                reply: tx,
            })
            .await
            .map_err(|_| P2pError::Shutdown)?;
        match tokio::time::timeout(proto.response_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(P2pError::NotConnected),
            Err(_) => Err(P2pError::Timeout),
        }
    }

    /// Send a one-way announcement to a specific peer.
    pub async fn announce(
        &self,
        peer: PeerId,
        proto: ProtocolId,
        payload: Vec<u8>,
    ) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Announce {
                peer,
                proto,
                payload,
            })
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    /// Gossip a message to all connected peers, optionally excluding one.
    pub async fn gossip(
        &self,
        proto: ProtocolId,
        payload: Vec<u8>,
        exclude: Option<PeerId>,
    ) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Gossip {
                proto,
                payload,
                exclude,
            })
            .await
            .map_err(|_| P2pError::Shutdown)
    }

    pub async fn peers(&self) -> Result<Vec<ConnectedPeer>, P2pError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(P2pCommand::GetPeers(tx))
            .await
            .map_err(|_| P2pError::Shutdown)?;
        rx.await.map_err(|_| P2pError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<(), P2pError> {
        self.command_tx
            .send(P2pCommand::Shutdown)
            .await
            .map_err(|_| P2pError::Shutdown)
    }
}

/// Result of starting the P2P layer.
pub struct P2pStartResult {
    pub handle: P2pHandle,
    pub events: mpsc::Receiver<P2pEvent>,
    /// The actual bound address (useful when listening on port 0).
    pub local_addr: SocketAddr,
}

/// Start the P2P networking layer.
pub async fn start(
    config: P2pConfig,
    shutdown: CancellationToken,
) -> Result<P2pStartResult, P2pError> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::channel::<P2pCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<P2pEvent>(256);

    tokio::spawn(p2p_loop(
        config, listener, local_addr, command_rx, event_tx, shutdown,
    ));

    Ok(P2pStartResult {
        handle: P2pHandle { command_tx },
        events: event_rx,
        local_addr,
    })
}

struct PeerEntry {
    conn_tx: mpsc::Sender<ConnCommand>,
    info: ConnectedPeer,
}

/// Main P2P event loop: owns the peer table.
async fn p2p_loop(
    config: P2pConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    mut command_rx: mpsc::Receiver<P2pCommand>,
    event_tx: mpsc::Sender<P2pEvent>,
    shutdown: CancellationToken,
) {
    let mut peers: HashMap<PeerId, PeerEntry> = HashMap::new();
    let (internal_tx, mut internal_rx) = mpsc::channel::<InternalEvent>(256);
    let our_peer_id = config.keypair.peer_id();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            result = listener.accept() => {
                let Ok((stream, addr)) = result else { continue };
                if peers.len() >= config.max_peers {
                    continue;
                }
                let config = config.clone();
                let internal_tx = internal_tx.clone();
                let event_tx = event_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        run_connection(stream, addr, false, config, local_addr, internal_tx, event_tx, shutdown, None).await
                    {
                        tracing::debug!(addr = %addr, error = %e, "Inbound connection failed");
                    }
                });
            }

            Some(cmd) = command_rx.recv() => {
                match cmd {
                    P2pCommand::Connect(addr, reply) => {
                        if peers.len() >= config.max_peers {
                            let _ = reply.send(Err(P2pError::PeerLimitReached(config.max_peers)));
                            continue;
                        }
                        let config = config.clone();
                        let internal_tx = internal_tx.clone();
                        let event_tx = event_tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let dial = tokio::time::timeout(
                                Duration::from_secs(crate::constants::DIAL_TIMEOUT_SECS),
                                TcpStream::connect(addr),
                            )
                            .await;
                            let stream = match dial {
                                Ok(Ok(stream)) => stream,
                                Ok(Err(e)) => {
                                    let _ = reply.send(Err(P2pError::ConnectionFailed(e.to_string())));
                                    return;
                                }
                                Err(_) => {
                                    let _ = reply.send(Err(P2pError::Timeout));
                                    return;
                                }
                            };
                            if let Err(e) = run_connection(
                                stream, addr, true, config, local_addr, internal_tx, event_tx, shutdown,
                                Some(reply),
                            )
                            .await
                            {
                                tracing::debug!(addr = %addr, error = %e, "Outbound connection failed");
                            }
                        });
                    }
                    P2pCommand::Disconnect(peer) => {
                        if let Some(entry) = peers.get(&peer) {
                            let _ = entry.conn_tx.try_send(ConnCommand::Close);
                        }
                    }
                    P2pCommand::Request { peer, proto, payload, reply } => {
                        match peers.get(&peer) {
                            Some(entry) => {
                                if let Err(e) =
                                    entry.conn_tx.try_send(ConnCommand::Request { proto, payload, reply })
                                {
                                    let cmd = match e {
                                        mpsc::error::TrySendError::Full(cmd)
                                        | mpsc::error::TrySendError::Closed(cmd) => cmd,
                                    };
                                    if let ConnCommand::Request { reply, .. } = cmd {
                                        let _ = reply.send(Err(P2pError::SendFailed(
                                            "connection busy or closed".into(),
                                        )));
                                    }
                                }
                            }
                            None => {
                                let _ = reply.send(Err(P2pError::NotConnected));
                            }
                        }
                    }
                    P2pCommand::Announce { peer, proto, payload } => {
                        if let Some(entry) = peers.get(&peer) {
                            let _ = entry.conn_tx.try_send(ConnCommand::OneWay {
                                kind: FrameKind::Announce,
                                proto,
                                payload,
                            });
                        }
                    }
                    P2pCommand::Gossip { proto, payload, exclude } => {
                        for (id, entry) in &peers {
                            if exclude.as_ref() == Some(id) {
                                continue;
                            }
                            if let Err(e) = entry.conn_tx.try_send(ConnCommand::OneWay {
                                kind: FrameKind::Gossip,
                                proto,
                                payload: payload.clone(),
                            }) {
                                tracing::debug!(
                                    peer = %hex::encode(&id[..8]),
                                    error = %e,
                                    "Failed to gossip to peer (channel full or closed)"
                                );
                            }
                        }
                    }
                    P2pCommand::GetPeers(reply) => {
                        let infos = peers.values().map(|p| p.info.clone()).collect();
                        let _ = reply.send(infos);
                    }
                    P2pCommand::Shutdown => break,
                }
            }

            Some(event) = internal_rx.recv() => {
                match event {
                    InternalEvent::Connected {
                        peer_id, pubkey, addr, listen_addr, protocols, outbound, conn_tx, accepted,
                    } => {
                        if peer_id == our_peer_id {
                            tracing::debug!("Rejected self-connection");
                            let _ = accepted.send(false);
                            continue;
                        }
                        if peers.contains_key(&peer_id) || peers.len() >= config.max_peers {
                            let _ = accepted.send(false);
                            continue;
                        }
                        let _ = accepted.send(true);
                        peers.insert(peer_id, PeerEntry {
                            conn_tx,
                            info: ConnectedPeer {
                                peer_id,
                                pubkey,
                                addr,
                                listen_addr,
                                protocols: protocols.clone(),
                                outbound,
                            },
                        });
                        let _ = event_tx
                            .send(P2pEvent::PeerConnected { peer: peer_id, listen_addr, protocols, outbound })
                            .await;
                    }
                    InternalEvent::Disconnected { peer_id, open_for } => {
                        if peers.remove(&peer_id).is_some() {
                            let _ = event_tx
                                .send(P2pEvent::PeerDisconnected { peer: peer_id, open_for })
                                .await;
                        }
                    }
                }
            }
        }
    }

    // Closing conn_tx senders unblocks every connection task.
    for entry in peers.values() {
        let _ = entry.conn_tx.try_send(ConnCommand::Close);
    }
}

/// Write one length-prefixed frame, bounded by the announce-write timeout.
async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), P2pError> {
    if bytes.len() > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return Err(P2pError::SendFailed("frame too large".into()));
    }
    let mut buf = Vec::with_capacity(4 + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
    tokio::time::timeout(
        Duration::from_secs(crate::constants::ANN_WRITE_TIMEOUT_SECS),
        writer.write_all(&buf),
    )
    .await
    .map_err(|_| P2pError::SendFailed("write timed out".into()))?
    .map_err(|e| P2pError::SendFailed(e.to_string()))
}

/// Read one length-prefixed frame.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, P2pError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > crate::constants::MAX_WIRE_MESSAGE_BYTES {
        return Err(P2pError::ConnectionFailed("frame too large".into()));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| P2pError::ConnectionFailed(e.to_string()))?;
    Ok(buf)
}

/// Run one peer connection: handshake, register, then pump frames until
/// close. A cancelled handler closes its stream before returning (the
/// halves drop here).
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    config: P2pConfig,
    local_addr: SocketAddr,
    internal_tx: mpsc::Sender<InternalEvent>,
    event_tx: mpsc::Sender<P2pEvent>,
    shutdown: CancellationToken,
    connect_reply: Option<oneshot::Sender<Result<PeerId, P2pError>>>,
) -> Result<(), P2pError> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    // ── Hello exchange ──
    let our_hello = Hello {
        version: P2P_VERSION,
        chain_id: config.chain_id.clone(),
        pubkey: config.keypair.public_bytes(),
        listen_port: local_addr.port(),
        protocols: ProtocolId::all().iter().map(|p| p.as_str().to_string()).collect(),
    };
    let hello_bytes =
        crate::serialize(&our_hello).map_err(|e| P2pError::InvalidHandshake(e))?;
    write_frame(&mut writer, &hello_bytes).await?;

    let their_bytes = tokio::time::timeout(
        Duration::from_secs(crate::constants::ANN_RESP_TIMEOUT_SECS),
        read_frame(&mut reader),
    )
    .await
    .map_err(|_| P2pError::InvalidHandshake("hello timed out".into()))??;
    let their_hello: Hello = crate::deserialize(&their_bytes)
        .map_err(|e| P2pError::InvalidHandshake(e))?;

    if their_hello.version != P2P_VERSION {
        let err = P2pError::InvalidHandshake(format!("version {}", their_hello.version));
        if let Some(reply) = connect_reply {
            let _ = reply.send(Err(err.clone()));
        }
        return Err(err);
    }
    if their_hello.chain_id != config.chain_id {
        let err = P2pError::InvalidHandshake(format!("chain id {}", their_hello.chain_id));
        if let Some(reply) = connect_reply {
            let _ = reply.send(Err(err.clone()));
        }
        return Err(err);
    }

    let peer_id = peer_id_from_pubkey(&their_hello.pubkey);
    let listen_addr = SocketAddr::new(addr.ip(), their_hello.listen_port);

    // ── Register with the event loop ──
    let (conn_tx, mut conn_rx) = mpsc::channel::<ConnCommand>(64);
    let (accepted_tx, accepted_rx) = oneshot::channel();
    internal_tx
        .send(InternalEvent::Connected {
            peer_id,
            pubkey: their_hello.pubkey.clone(),
            addr,
            listen_addr,
            protocols: their_hello.protocols.clone(),
            outbound,
            conn_tx: conn_tx.clone(),
            accepted: accepted_tx,
        })
        .await
        .map_err(|_| P2pError::Shutdown)?;
    if !accepted_rx.await.unwrap_or(false) {
        let err = P2pError::InvalidHandshake("rejected by peer table".into());
        if let Some(reply) = connect_reply {
            let _ = reply.send(Err(err.clone()));
        }
        return Err(err);
    }
    if let Some(reply) = connect_reply {
        let _ = reply.send(Ok(peer_id));
    }

    let opened = Instant::now();
    let conn_token = shutdown.child_token();
    let pending: std::sync::Arc<
        std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, P2pError>>>>,
    > = Default::default();

    // Writer task: owns the write half and drains the command channel.
    // Request ids are assigned here; the reader completes them.
    let writer_pending = pending.clone();
    let writer_token = conn_token.clone();
    let writer_task = tokio::spawn(async move {
        let mut next_request_id: u64 = 1;
        loop {
            let cmd = tokio::select! {
                _ = writer_token.cancelled() => break,
                cmd = conn_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                ConnCommand::Request { proto, payload, reply } => {
                    let id = next_request_id;
                    next_request_id += 1;
                    let frame = Frame { kind: FrameKind::Request, request_id: id, proto, payload };
                    // register before writing so a fast response can't race
                    // the bookkeeping
                    writer_pending.lock().expect("pending lock poisoned").insert(id, reply);
                    if let Err(e) = write_frame(&mut writer, &frame.encode()).await {
                        let reply = writer_pending.lock().expect("pending lock poisoned").remove(&id);
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                ConnCommand::Response { id, proto, payload } => {
                    let frame = Frame { kind: FrameKind::Response, request_id: id, proto, payload };
                    if write_frame(&mut writer, &frame.encode()).await.is_err() {
                        break;
                    }
                }
                ConnCommand::OneWay { kind, proto, payload } => {
                    let frame = Frame { kind, request_id: 0, proto, payload };
                    if write_frame(&mut writer, &frame.encode()).await.is_err() {
                        break;
                    }
                }
                ConnCommand::Close => break,
            }
        }
        writer_token.cancel();
    });

    // Reader loop. The cancelled branch terminates the connection, so an
    // interrupted partial read is never resumed.
    let result = loop {
        let bytes = tokio::select! {
            _ = conn_token.cancelled() => break Ok(()),
            result = read_frame(&mut reader) => match result {
                Ok(bytes) => bytes,
                Err(e) => break Err(e),
            },
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // malformed wire message: fatal for this stream only
                tracing::debug!(peer = %hex::encode(&peer_id[..8]), error = %e, "Protocol error, closing stream");
                break Err(P2pError::ConnectionFailed(e.to_string()));
            }
        };
        match frame.kind {
            FrameKind::Request => {
                let (reply_tx, reply_rx) = oneshot::channel::<Vec<u8>>();
                let _ = event_tx
                    .send(P2pEvent::Request {
                        from: peer_id,
                        proto: frame.proto,
                        payload: frame.payload,
                        reply: reply_tx,
                    })
                    .await;
                let conn_tx = conn_tx.clone();
                let id = frame.request_id;
                let proto = frame.proto;
                tokio::spawn(async move {
                    if let Ok(payload) = reply_rx.await {
                        let _ = conn_tx.send(ConnCommand::Response { id, proto, payload }).await;
                    }
                });
            }
            FrameKind::Response => {
                let reply = pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&frame.request_id);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(frame.payload));
                }
            }
            FrameKind::Announce => {
                let _ = event_tx
                    .send(P2pEvent::Announce { from: peer_id, proto: frame.proto, payload: frame.payload })
                    .await;
            }
            FrameKind::Gossip => {
                let _ = event_tx
                    .send(P2pEvent::Gossip { from: peer_id, proto: frame.proto, payload: frame.payload })
                    .await;
            }
        }
    };

    conn_token.cancel();
    let _ = writer_task.await;
    for (_, reply) in pending.lock().expect("pending lock poisoned").drain() {
        let _ = reply.send(Err(P2pError::NotConnected));
    }
    let _ = internal_tx
        .send(InternalEvent::Disconnected {
            peer_id,
            open_for: opened.elapsed(),
        })
        .await;
    result
}
