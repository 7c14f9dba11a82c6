//! Wire codecs for the typed peer protocols.
//!
//! Every message is fixed-layout binary: integers little-endian, hashes 32
//! bytes, signatures length-prefixed with an 8-byte count and bounded to
//! `MAX_SIG_LEN`. A length mismatch or oversize signature is a protocol
//! error; the transport closes the stream on it. Responses use the single
//! byte `0x00` as the not-found sentinel, announcements are answered with
//! `"get"` or nothing.

use crate::constants::MAX_SIG_LEN;
use crate::Hash;

/// Request/announce protocols spoken over peer streams. The URIs are
/// opaque identifiers exchanged at handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    Discovery = 0,
    Tx = 1,
    TxAnn = 2,
    BlockHeight = 3,
    Block = 4,
    BlkAnn = 5,
    BlkProp = 6,
    SnapshotCatalog = 7,
    SnapshotChunk = 8,
    SnapshotMeta = 9,
    /// Gossip topic for validator ACKs.
    Ack = 10,
    /// Gossip topic for consensus resets.
    Reset = 11,
}

impl ProtocolId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::Discovery => "kwil/discovery/1",
            ProtocolId::Tx => "kwil/tx/1",
            ProtocolId::TxAnn => "kwil/txann/1",
            ProtocolId::BlockHeight => "kwil/blkheight/1",
            ProtocolId::Block => "kwil/blk/1",
            ProtocolId::BlkAnn => "kwil/blkann/1",
            ProtocolId::BlkProp => "kwil/blkprop/1",
            ProtocolId::SnapshotCatalog => "kwil/snapcat/1",
            ProtocolId::SnapshotChunk => "kwil/snapchunk/1",
            ProtocolId::SnapshotMeta => "kwil/snapmeta/1",
            ProtocolId::Ack => "kwil/gossip/ack/1",
            ProtocolId::Reset => "kwil/gossip/reset/1",
        }
    }

    pub fn from_u8(value: u8) -> Option<ProtocolId> {
        Some(match value {
            0 => ProtocolId::Discovery,
            1 => ProtocolId::Tx,
            2 => ProtocolId::TxAnn,
            3 => ProtocolId::BlockHeight,
            4 => ProtocolId::Block,
            5 => ProtocolId::BlkAnn,
            6 => ProtocolId::BlkProp,
            7 => ProtocolId::SnapshotCatalog,
            8 => ProtocolId::SnapshotChunk,
            9 => ProtocolId::SnapshotMeta,
            10 => ProtocolId::Ack,
            11 => ProtocolId::Reset,
            _ => return None,
        })
    }

    /// The read timeout for a response on this protocol.
    pub fn response_timeout(&self) -> std::time::Duration {
        use crate::constants::*;
        let secs = match self {
            ProtocolId::Tx => TX_GET_TIMEOUT_SECS,
            ProtocolId::Block | ProtocolId::BlockHeight | ProtocolId::BlkProp => {
                BLK_GET_TIMEOUT_SECS
            }
            ProtocolId::SnapshotChunk => SNAPSHOT_CHUNK_TIMEOUT_SECS,
            _ => ANN_RESP_TIMEOUT_SECS,
        };
        std::time::Duration::from_secs(secs)
    }

    /// All protocols a full node serves, for handshake advertisement.
    pub fn all() -> Vec<ProtocolId> {
        vec![
            ProtocolId::Discovery,
            ProtocolId::Tx,
            ProtocolId::TxAnn,
            ProtocolId::BlockHeight,
            ProtocolId::Block,
            ProtocolId::BlkAnn,
            ProtocolId::BlkProp,
            ProtocolId::SnapshotCatalog,
            ProtocolId::SnapshotChunk,
            ProtocolId::SnapshotMeta,
            ProtocolId::Ack,
            ProtocolId::Reset,
        ]
    }
}

/// Response sent back when the requested content is wanted.
pub const GET_MSG: &[u8] = b"get";
/// Request body on the discovery protocol.
pub const DISCOVER_PEERS_MSG: &[u8] = b"discover_peers";
/// Single-byte not-found response sentinel.
pub const NO_DATA: [u8; 1] = [0];

/// Is this response the not-found sentinel?
pub fn is_no_data(resp: &[u8]) -> bool {
    resp == NO_DATA
}

/// Malformed wire input. Closes the stream, never escalates.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message length: got {got}, want {want}")]
    Length { got: usize, want: usize },
    #[error("truncated message")]
    Truncated,
    #[error("signature length {0} exceeds maximum")]
    SignatureTooLong(usize),
    #[error("unknown protocol id {0}")]
    UnknownProtocol(u8),
    #[error("malformed message: {0}")]
    Malformed(String),
}

fn read_hash(buf: &[u8], at: usize) -> Result<Hash, ProtocolError> {
    let end = at.checked_add(32).ok_or(ProtocolError::Truncated)?;
    let slice = buf.get(at..end).ok_or(ProtocolError::Truncated)?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(slice);
    Ok(hash)
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64, ProtocolError> {
    let end = at.checked_add(8).ok_or(ProtocolError::Truncated)?;
    let slice = buf.get(at..end).ok_or(ProtocolError::Truncated)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, ProtocolError> {
    let end = at.checked_add(4).ok_or(ProtocolError::Truncated)?;
    let slice = buf.get(at..end).ok_or(ProtocolError::Truncated)?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

/// Read an 8-byte length-prefixed signature bounded to `MAX_SIG_LEN`.
fn read_sig(buf: &[u8], at: usize) -> Result<(Vec<u8>, usize), ProtocolError> {
    let len = read_u64(buf, at)? as usize;
    if len > MAX_SIG_LEN {
        return Err(ProtocolError::SignatureTooLong(len));
    }
    let start = at + 8;
    let end = start.checked_add(len).ok_or(ProtocolError::Truncated)?;
    let sig = buf.get(start..end).ok_or(ProtocolError::Truncated)?.to_vec();
    Ok((sig, end))
}

fn write_sig(buf: &mut Vec<u8>, sig: &[u8]) {
    buf.extend_from_slice(&(sig.len() as u64).to_le_bytes());
    buf.extend_from_slice(sig);
}

/// 32-byte content request, shared by `kwil/tx/1`, `kwil/blk/1`, and the
/// announcement protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashReq {
    pub hash: Hash,
}

impl HashReq {
    pub fn encode(&self) -> Vec<u8> {
        self.hash.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<HashReq, ProtocolError> {
        if buf.len() != 32 {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: 32,
            });
        }
        Ok(HashReq {
            hash: read_hash(buf, 0)?,
        })
    }
}

/// Height request for `kwil/blkheight/1`: 8-byte little-endian signed height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeightReq {
    pub height: i64,
}

impl BlockHeightReq {
    pub fn encode(&self) -> Vec<u8> {
        (self.height as u64).to_le_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<BlockHeightReq, ProtocolError> {
        if buf.len() != 8 {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: 8,
            });
        }
        Ok(BlockHeightReq {
            height: read_u64(buf, 0)? as i64,
        })
    }
}

/// Committed-block announcement for `kwil/blkann/1`.
///
/// Layout: `hash(32) || height(8 LE) || app_hash(32) || sig_len(8 LE) ||
/// leader_sig`. The leader signature lets a peer discard fake
/// announcements without fetching the block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockAnn {
    pub hash: Hash,
    pub height: i64,
    pub app_hash: Hash,
    pub leader_sig: Vec<u8>,
}

impl BlockAnn {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 8 + 32 + 8 + self.leader_sig.len());
        buf.extend_from_slice(&self.hash);
        buf.extend_from_slice(&(self.height as u64).to_le_bytes());
        buf.extend_from_slice(&self.app_hash);
        write_sig(&mut buf, &self.leader_sig);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<BlockAnn, ProtocolError> {
        let hash = read_hash(buf, 0)?;
        let height = read_u64(buf, 32)? as i64;
        let app_hash = read_hash(buf, 40)?;
        let (leader_sig, end) = read_sig(buf, 72)?;
        if end != buf.len() {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: end,
            });
        }
        Ok(BlockAnn {
            hash,
            height,
            app_hash,
            leader_sig,
        })
    }
}

/// Snapshot chunk request for `kwil/snapchunk/1`.
///
/// Layout: `height(8) || format(4) || index(4) || hash(32)`, in that order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotChunkReq {
    pub height: u64,
    pub format: u32,
    pub index: u32,
    pub hash: Hash,
}

impl SnapshotChunkReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 + 4 + 32);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.format.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.hash);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SnapshotChunkReq, ProtocolError> {
        if buf.len() != 8 + 4 + 4 + 32 {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: 48,
            });
        }
        Ok(SnapshotChunkReq {
            height: read_u64(buf, 0)?,
            format: read_u32(buf, 8)?,
            index: read_u32(buf, 12)?,
            hash: read_hash(buf, 16)?,
        })
    }
}

/// Snapshot metadata request for `kwil/snapmeta/1`:
/// `height(8) || format(4)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMetaReq {
    pub height: u64,
    pub format: u32,
}

impl SnapshotMetaReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.format.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SnapshotMetaReq, ProtocolError> {
        if buf.len() != 12 {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: 12,
            });
        }
        Ok(SnapshotMetaReq {
            height: read_u64(buf, 0)?,
            format: read_u32(buf, 8)?,
        })
    }
}

/// Signed validator ACK/NACK gossiped on the `ack` topic.
///
/// Layout: `height(8) || block_hash(32) || app_hash(32) || vote(1) ||
/// val_len(8) || validator || sig_len(8) || signature`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub height: i64,
    pub block_hash: Hash,
    pub app_hash: Hash,
    pub ack: bool,
    /// Public key bytes of the voting validator.
    pub validator: Vec<u8>,
    pub signature: Vec<u8>,
}

impl AckPayload {
    /// The bytes a validator signs: `(height, block_hash, app_hash, vote)`,
    /// chain-bound.
    pub fn sign_bytes(
        chain_id: &str,
        height: i64,
        block_hash: &Hash,
        app_hash: &Hash,
        ack: bool,
    ) -> Vec<u8> {
        crate::hash_concat(&[
            b"kwil.ack",
            chain_id.as_bytes(),
            &(height as u64).to_le_bytes(),
            block_hash,
            app_hash,
            &[u8::from(ack)],
        ])
        .to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(81 + self.validator.len() + self.signature.len() + 16);
        buf.extend_from_slice(&(self.height as u64).to_le_bytes());
        buf.extend_from_slice(&self.block_hash);
        buf.extend_from_slice(&self.app_hash);
        buf.push(u8::from(self.ack));
        write_sig(&mut buf, &self.validator);
        write_sig(&mut buf, &self.signature);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<AckPayload, ProtocolError> {
        let height = read_u64(buf, 0)? as i64;
        let block_hash = read_hash(buf, 8)?;
        let app_hash = read_hash(buf, 40)?;
        let vote = *buf.get(72).ok_or(ProtocolError::Truncated)?;
        if vote > 1 {
            return Err(ProtocolError::Malformed(format!("vote byte {}", vote)));
        }
        let (validator, at) = read_sig(buf, 73)?;
        let (signature, end) = read_sig(buf, at)?;
        if end != buf.len() {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: end,
            });
        }
        Ok(AckPayload {
            height,
            block_hash,
            app_hash,
            ack: vote == 1,
            validator,
            signature,
        })
    }
}

/// Signed reset announcement gossiped on the `reset` topic.
///
/// Layout: `height(8) || reason_len(4) || reason || val_len(8) ||
/// validator || sig_len(8) || signature`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetPayload {
    pub height: i64,
    pub reason: String,
    pub validator: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Longest accepted reset reason.
const MAX_REASON_LEN: usize = 256;

impl ResetPayload {
    pub fn sign_bytes(chain_id: &str, height: i64, reason: &str) -> Vec<u8> {
        crate::hash_concat(&[
            b"kwil.reset",
            chain_id.as_bytes(),
            &(height as u64).to_le_bytes(),
            reason.as_bytes(),
        ])
        .to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason = self.reason.as_bytes();
        let mut buf =
            Vec::with_capacity(12 + reason.len() + self.validator.len() + self.signature.len() + 16);
        buf.extend_from_slice(&(self.height as u64).to_le_bytes());
        buf.extend_from_slice(&(reason.len() as u32).to_le_bytes());
        buf.extend_from_slice(reason);
        write_sig(&mut buf, &self.validator);
        write_sig(&mut buf, &self.signature);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<ResetPayload, ProtocolError> {
        let height = read_u64(buf, 0)? as i64;
        let reason_len = read_u32(buf, 8)? as usize;
        if reason_len > MAX_REASON_LEN {
            return Err(ProtocolError::Malformed(format!(
                "reason length {}",
                reason_len
            )));
        }
        let reason_end = 12usize.checked_add(reason_len).ok_or(ProtocolError::Truncated)?;
        let reason_bytes = buf.get(12..reason_end).ok_or(ProtocolError::Truncated)?;
        let reason = String::from_utf8(reason_bytes.to_vec())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let (validator, at) = read_sig(buf, reason_end)?;
        let (signature, end) = read_sig(buf, at)?;
        if end != buf.len() {
            return Err(ProtocolError::Length {
                got: buf.len(),
                want: end,
            });
        }
        Ok(ResetPayload {
            height,
            reason,
            validator,
            signature,
        })
    }
}

/// Transport frame kinds. Private multiplexing detail of the overlay; the
/// §-protocol layouts above are the payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Announce = 2,
    Gossip = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<FrameKind> {
        Some(match value {
            0 => FrameKind::Request,
            1 => FrameKind::Response,
            2 => FrameKind::Announce,
            3 => FrameKind::Gossip,
            _ => return None,
        })
    }
}

/// One multiplexed message on a peer connection:
/// `[kind(1)][request_id(8 LE)][proto(1)][payload]`, carried behind a
/// u32 length prefix written by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub request_id: u64,
    pub proto: ProtocolId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.push(self.proto as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolError> {
        if buf.len() < 10 {
            return Err(ProtocolError::Truncated);
        }
        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| ProtocolError::Malformed(format!("frame kind {}", buf[0])))?;
        let request_id = read_u64(buf, 1)?;
        let proto = ProtocolId::from_u8(buf[9]).ok_or(ProtocolError::UnknownProtocol(buf[9]))?;
        Ok(Frame {
            kind,
            request_id,
            proto,
            payload: buf[10..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_req_roundtrip() {
        let req = HashReq { hash: [7u8; 32] };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(HashReq::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn hash_req_wrong_length() {
        assert!(matches!(
            HashReq::decode(&[0u8; 31]),
            Err(ProtocolError::Length { got: 31, want: 32 })
        ));
    }

    #[test]
    fn height_req_roundtrip() {
        let req = BlockHeightReq { height: -1 };
        let decoded = BlockHeightReq::decode(&req.encode()).unwrap();
        assert_eq!(decoded.height, -1);

        let req = BlockHeightReq { height: 123_456 };
        assert_eq!(BlockHeightReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn height_req_little_endian() {
        let req = BlockHeightReq { height: 1 };
        let bytes = req.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..], &[0u8; 7]);
    }

    #[test]
    fn block_ann_roundtrip() {
        let ann = BlockAnn {
            hash: [1u8; 32],
            height: 42,
            app_hash: [2u8; 32],
            leader_sig: vec![3u8; 64],
        };
        assert_eq!(BlockAnn::decode(&ann.encode()).unwrap(), ann);
    }

    #[test]
    fn block_ann_rejects_oversize_sig() {
        let ann = BlockAnn {
            hash: [1u8; 32],
            height: 1,
            app_hash: [2u8; 32],
            leader_sig: vec![0u8; MAX_SIG_LEN + 1],
        };
        assert!(matches!(
            BlockAnn::decode(&ann.encode()),
            Err(ProtocolError::SignatureTooLong(_))
        ));
    }

    #[test]
    fn block_ann_rejects_trailing_bytes() {
        let ann = BlockAnn {
            hash: [1u8; 32],
            height: 1,
            app_hash: [2u8; 32],
            leader_sig: vec![5u8; 10],
        };
        let mut bytes = ann.encode();
        bytes.push(0xFF);
        assert!(BlockAnn::decode(&bytes).is_err());
    }

    #[test]
    fn snapshot_chunk_req_roundtrip() {
        let req = SnapshotChunkReq {
            height: 9000,
            format: 1,
            index: 7,
            hash: [9u8; 32],
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 48);
        let decoded = SnapshotChunkReq::decode(&bytes).unwrap();
        assert_eq!(decoded, req);
        // format and index occupy distinct byte ranges
        assert_eq!(decoded.format, 1);
        assert_eq!(decoded.index, 7);
    }

    #[test]
    fn snapshot_meta_req_roundtrip() {
        let req = SnapshotMetaReq {
            height: 500,
            format: 2,
        };
        assert_eq!(SnapshotMetaReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn ack_payload_roundtrip() {
        for ack in [true, false] {
            let payload = AckPayload {
                height: 12,
                block_hash: [4u8; 32],
                app_hash: [5u8; 32],
                ack,
                validator: vec![6u8; 32],
                signature: vec![7u8; 64],
            };
            assert_eq!(AckPayload::decode(&payload.encode()).unwrap(), payload);
        }
    }

    #[test]
    fn ack_payload_rejects_bad_vote_byte() {
        let payload = AckPayload {
            height: 12,
            block_hash: [4u8; 32],
            app_hash: [5u8; 32],
            ack: true,
            validator: vec![6u8; 32],
            signature: vec![7u8; 64],
        };
        let mut bytes = payload.encode();
        bytes[72] = 9;
        assert!(AckPayload::decode(&bytes).is_err());
    }

    #[test]
    fn ack_sign_bytes_chain_bound() {
        let a = AckPayload::sign_bytes("chain-a", 1, &[0u8; 32], &[1u8; 32], true);
        let b = AckPayload::sign_bytes("chain-b", 1, &[0u8; 32], &[1u8; 32], true);
        assert_ne!(a, b);
    }

    #[test]
    fn reset_payload_roundtrip() {
        let payload = ResetPayload {
            height: 3,
            reason: "equivocation".into(),
            validator: vec![1u8; 32],
            signature: vec![2u8; 64],
        };
        assert_eq!(ResetPayload::decode(&payload.encode()).unwrap(), payload);
    }

    #[test]
    fn reset_payload_bounds_reason() {
        let payload = ResetPayload {
            height: 3,
            reason: "x".repeat(MAX_REASON_LEN + 1),
            validator: vec![],
            signature: vec![],
        };
        assert!(ResetPayload::decode(&payload.encode()).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame {
            kind: FrameKind::Request,
            request_id: 77,
            proto: ProtocolId::Tx,
            payload: vec![1, 2, 3],
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn frame_rejects_unknown_proto() {
        let mut bytes = Frame {
            kind: FrameKind::Gossip,
            request_id: 0,
            proto: ProtocolId::Ack,
            payload: vec![],
        }
        .encode();
        bytes[9] = 200;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::UnknownProtocol(200))
        ));
    }

    #[test]
    fn no_data_sentinel() {
        assert!(is_no_data(&NO_DATA));
        assert!(!is_no_data(b"full response"));
        assert!(!is_no_data(&[0, 0]));
    }

    #[test]
    fn protocol_ids_roundtrip() {
        for proto in ProtocolId::all() {
            assert_eq!(ProtocolId::from_u8(proto as u8), Some(proto));
            assert!(proto.as_str().starts_with("kwil/"));
        }
    }
}
