//! Peer overlay: shared types, wire codecs, TCP transport, peer manager.

pub mod p2p;
pub mod peers;
pub mod protocol;

use serde::{Deserialize, Serialize};

use crate::Hash;

/// A peer identifier: domain-separated hash of the peer's public key.
pub type PeerId = Hash;

/// Information about a known peer, as persisted in the address book.
///
/// The JSON form is `{ "id": ..., "addresses": [...], "protocols": [...] }`;
/// unknown keys are ignored on load so newer nodes can extend the format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Hex-encoded peer id.
    pub id: String,
    /// Dialable `host:port` addresses.
    pub addresses: Vec<String>,
    /// Protocol IDs the peer advertised at handshake.
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl PeerInfo {
    pub fn peer_id(&self) -> Option<PeerId> {
        let bytes = hex::decode(&self.id).ok()?;
        bytes.try_into().ok()
    }
}
