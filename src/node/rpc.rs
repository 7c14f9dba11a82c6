//! Admin JSON RPC.
//!
//! A thin axum service over the node handle, bound to loopback by
//! default: `status`, `peers`, `validators`, `pending_joins`,
//! `resolution_status`, and `broadcast`. The user-facing query surface is
//! out of scope; this serves the operator.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use super::core::NodeHandle;
use crate::chain::Transaction;

#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    pub chain_id: String,
    pub role: String,
    pub best_height: i64,
    pub best_hash: String,
    pub app_hash: String,
    pub peers_connected: usize,
    pub peers_known: usize,
    pub mempool: super::mempool::MempoolStats,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidatorEntry {
    pub pubkey: String,
    pub power: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct JoinEntry {
    pub id: String,
    pub candidate: String,
    pub approvals: usize,
    pub board: usize,
    pub expires_at: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Hex-encoded canonical transaction bytes.
    pub tx: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BroadcastResponse {
    pub hash: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: msg.into() }))
}

async fn status(State(node): State<NodeHandle>) -> Json<StatusResponse> {
    let (height, hash, app_hash) = node.store.best();
    let (all, connected, _) = node.peer_man.known_peers();
    let mempool = node.mempool.lock().expect("mempool lock poisoned").stats();
    Json(StatusResponse {
        chain_id: node.chain_id.clone(),
        role: node.role.to_string(),
        best_height: height,
        best_hash: hex::encode(hash),
        app_hash: hex::encode(app_hash),
        peers_connected: connected.len(),
        peers_known: all.len(),
        mempool,
    })
}

async fn peers(State(node): State<NodeHandle>) -> Json<serde_json::Value> {
    let (all, connected, disconnected) = node.peer_man.known_peers();
    Json(serde_json::json!({
        "all": all,
        "connected": connected,
        "disconnected": disconnected,
    }))
}

async fn validators(State(node): State<NodeHandle>) -> Json<Vec<ValidatorEntry>> {
    let set = node.validators.read().expect("validators lock poisoned");
    let mut entries: Vec<ValidatorEntry> = set
        .values()
        .map(|v| ValidatorEntry {
            pubkey: hex::encode(&v.pubkey),
            power: v.power,
        })
        .collect();
    entries.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
    Json(entries)
}

async fn pending_joins(State(node): State<NodeHandle>) -> Json<Vec<JoinEntry>> {
    let joins = node
        .txapp
        .pending_joins()
        .into_iter()
        .map(|r| {
            let candidate = match &r.kind {
                crate::voting::ResolutionKind::ValidatorJoin { candidate, .. } => {
                    hex::encode(candidate)
                }
                _ => String::new(),
            };
            JoinEntry {
                id: hex::encode(r.id),
                candidate,
                approvals: r.approvals.values().filter(|v| **v).count(),
                board: r.board.len(),
                expires_at: r.expires_at,
            }
        })
        .collect();
    Json(joins)
}

async fn resolution_status(
    State(node): State<NodeHandle>,
    Path(id): Path<String>,
) -> Result<Json<crate::voting::ResolutionStatus>, (StatusCode, Json<ErrorResponse>)> {
    let bytes = hex::decode(&id)
        .map_err(|_| error(StatusCode::BAD_REQUEST, "malformed resolution id"))?;
    let id: crate::Hash = bytes
        .try_into()
        .map_err(|_| error(StatusCode::BAD_REQUEST, "resolution id must be 32 bytes"))?;
    let height = node.store.best().0;
    node.txapp
        .resolution_status(&id, height)
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "resolution not found"))
}

async fn broadcast(
    State(node): State<NodeHandle>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, (StatusCode, Json<ErrorResponse>)> {
    let bytes = hex::decode(&req.tx)
        .map_err(|_| error(StatusCode::BAD_REQUEST, "malformed tx hex"))?;
    let tx: Transaction = crate::deserialize(&bytes)
        .map_err(|e| error(StatusCode::BAD_REQUEST, format!("undecodable tx: {}", e)))?;
    match node.broadcast_tx(tx).await {
        Ok(hash) => Ok(Json(BroadcastResponse {
            hash: hex::encode(hash),
        })),
        Err(e) => Err(error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

pub fn router(node: NodeHandle) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/peers", get(peers))
        .route("/v1/validators", get(validators))
        .route("/v1/joins", get(pending_joins))
        .route("/v1/resolution/:id", get(resolution_status))
        .route("/v1/broadcast", post(broadcast))
        .with_state(node)
}

/// Serve the admin RPC until the process exits.
pub async fn serve(addr: SocketAddr, node: NodeHandle) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Admin RPC listening");
    axum::serve(listener, router(node)).await
}
