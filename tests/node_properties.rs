//! Node invariant tests: the properties that must hold for all inputs.
//!
//! Covered here:
//! - **Mempool nonce contiguity**: admitted nonces per sender are always
//!   the contiguous run above the committed nonce
//! - **Block store monotonicity**: `best()` never moves backwards
//! - **At-most-one fetch**: concurrent prefetch reservations have exactly
//!   one winner until release
//! - **Codec round-trips**: decode(encode(m)) == m for every protocol
//!   message
//! - **Signature soundness**: nothing with a forged sender passes
//!   verification into the pool
//! - **Replay protection**: wrong-chain transactions never admit
//! - **Reconnect bound**: no more than 500 attempts per disconnect

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kwil_node::chain::{Account, Payload, Transaction, TxBody, Validator};
use kwil_node::crypto::NodeKeypair;
use kwil_node::engine::{DatasetEngine, MemAccountStore, Pricer};
use kwil_node::network::p2p::{ConnectedPeer, P2pError};
use kwil_node::network::peers::{Connector, PeerMan};
use kwil_node::network::protocol::*;
use kwil_node::network::{PeerId, PeerInfo};
use kwil_node::node::mempool::{Mempool, MempoolConfig};
use kwil_node::node::store::{BlockStore, MemBlockStore};
use kwil_node::node::txapp::{TxApp, TxAppError};
use kwil_node::voting::Threshold;

const CHAIN: &str = "kwil-test";

fn make_tx_on(chain: &str, kp: &NodeKeypair, nonce: u64) -> Transaction {
    Transaction::signed_ed25519(
        kp,
        TxBody {
            description: format!("tx {}", nonce),
            payload: Payload::Transfer {
                to: "ee".repeat(32),
                amount: 1,
            },
            fee: 0,
            nonce,
            chain_id: chain.into(),
        },
    )
}

fn make_tx(kp: &NodeKeypair, nonce: u64) -> Transaction {
    make_tx_on(CHAIN, kp, nonce)
}

fn make_txapp() -> TxApp {
    TxApp::new(
        CHAIN.to_string(),
        Pricer::new(false),
        Arc::new(MemAccountStore::new()),
        Arc::new(DatasetEngine::new()),
        Arc::new(RwLock::new(HashMap::<String, Validator>::new())),
        Threshold::default(),
        100,
    )
}

// ── Mempool nonce contiguity ────────────────────────────────────────────

#[test]
fn mempool_contiguity_under_adversarial_submission() {
    let kp = NodeKeypair::generate();
    let mut pool = Mempool::new(MempoolConfig::default());
    let account = Account {
        identifier: "A".into(),
        balance: 0,
        nonce: 10,
    };

    // submit nonces in a scrambled order with gaps and stale values;
    // only the contiguous extension ever lands
    for nonce in [14u64, 11, 9, 13, 12, 11, 30, 12, 13, 10, 14, 15] {
        let _ = pool.insert(make_tx(&kp, nonce), "A", Some(&account));
        let pending = pool.pending_nonces("A");
        let expected: Vec<u64> = (11..11 + pending.len() as u64).collect();
        assert_eq!(pending, expected, "contiguity broken after nonce {}", nonce);
    }
    assert_eq!(pool.pending_nonces("A"), vec![11, 12, 13, 14, 15]);
}

#[test]
fn mempool_contiguity_survives_commit_and_recheck() {
    let kp = NodeKeypair::generate();
    let mut pool = Mempool::new(MempoolConfig::default());
    let mut hashes = vec![];
    for nonce in 1..=6u64 {
        hashes.push(pool.insert(make_tx(&kp, nonce), "A", None).unwrap());
    }

    // a block commits nonces 1..3
    pool.remove_committed(&hashes[..3]);
    pool.recheck(|_| {
        Some(Account {
            identifier: "A".into(),
            balance: 0,
            nonce: 3,
        })
    });
    assert_eq!(pool.pending_nonces("A"), vec![4, 5, 6]);

    // the previously-gapped nonce 7 is admittable now
    pool.insert(make_tx(&kp, 7), "A", None).unwrap();
    assert_eq!(pool.pending_nonces("A"), vec![4, 5, 6, 7]);
}

// ── Block store monotonicity ────────────────────────────────────────────

#[test]
fn block_store_best_monotone_under_any_store_order() {
    let kp = NodeKeypair::generate();
    let store = MemBlockStore::new();

    let mut blocks = vec![];
    let mut prev = [0u8; 32];
    for height in 1..=8i64 {
        let mut blk = kwil_node::chain::Block::build(
            height,
            prev,
            [0u8; 32],
            1000 + height as u64,
            kp.public_bytes(),
            vec![],
        );
        blk.sign(&kp);
        prev = blk.hash();
        blocks.push(blk);
    }

    // store out of order; best only ever goes up
    let order = [2usize, 0, 5, 1, 7, 3, 6, 4];
    let mut best_seen = 0i64;
    for &i in &order {
        let blk = &blocks[i];
        store.store(blk, [i as u8; 32]).unwrap();
        let (height, hash, _) = store.best();
        assert!(height >= best_seen, "best went backwards");
        best_seen = height;
        if blk.header.height >= height {
            assert_eq!(hash, blk.hash());
        }
    }
    assert_eq!(store.best().0, 8);
}

// ── At-most-one prefetch ────────────────────────────────────────────────

#[tokio::test]
async fn prefetch_single_winner_under_task_contention() {
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
    let hash = [3u8; 32];
    let wins = Arc::new(AtomicUsize::new(0));
    let guards = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = vec![];
    for _ in 0..32 {
        let store = store.clone();
        let wins = wins.clone();
        let guards = guards.clone();
        tasks.push(tokio::spawn(async move {
            let (ok, guard) = store.prefetch(&hash);
            if ok {
                wins.fetch_add(1, Ordering::SeqCst);
            }
            // keep all reservations alive until every task has tried
            guards.lock().unwrap().push(guard);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(wins.load(Ordering::SeqCst), 1);

    // after all guards release, the next caller wins again
    guards.lock().unwrap().clear();
    let (ok, _guard) = store.prefetch(&hash);
    assert!(ok);
}

// ── Codec round-trips ───────────────────────────────────────────────────

#[test]
fn all_protocol_messages_roundtrip() {
    let hash_req = HashReq { hash: [7u8; 32] };
    assert_eq!(HashReq::decode(&hash_req.encode()).unwrap(), hash_req);

    for height in [0i64, 1, -1, i64::MAX, 123_456] {
        let req = BlockHeightReq { height };
        assert_eq!(BlockHeightReq::decode(&req.encode()).unwrap(), req);
    }

    let ann = BlockAnn {
        hash: [1u8; 32],
        height: 99,
        app_hash: [2u8; 32],
        leader_sig: vec![9u8; 64],
    };
    assert_eq!(BlockAnn::decode(&ann.encode()).unwrap(), ann);

    let chunk = SnapshotChunkReq {
        height: 1_000,
        format: 3,
        index: 17,
        hash: [4u8; 32],
    };
    assert_eq!(SnapshotChunkReq::decode(&chunk.encode()).unwrap(), chunk);

    let meta = SnapshotMetaReq {
        height: 1_000,
        format: 3,
    };
    assert_eq!(SnapshotMetaReq::decode(&meta.encode()).unwrap(), meta);

    for ack_vote in [true, false] {
        let ack = AckPayload {
            height: 5,
            block_hash: [5u8; 32],
            app_hash: [6u8; 32],
            ack: ack_vote,
            validator: vec![7u8; 32],
            signature: vec![8u8; 64],
        };
        assert_eq!(AckPayload::decode(&ack.encode()).unwrap(), ack);
    }

    let reset = ResetPayload {
        height: 5,
        reason: "ack timeout".into(),
        validator: vec![7u8; 32],
        signature: vec![8u8; 64],
    };
    assert_eq!(ResetPayload::decode(&reset.encode()).unwrap(), reset);

    for kind in [FrameKind::Request, FrameKind::Response, FrameKind::Announce, FrameKind::Gossip] {
        let frame = Frame {
            kind,
            request_id: 42,
            proto: ProtocolId::BlkAnn,
            payload: vec![1, 2, 3, 4],
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }
}

#[test]
fn oversize_signature_is_protocol_error() {
    let ann = BlockAnn {
        hash: [1u8; 32],
        height: 1,
        app_hash: [2u8; 32],
        leader_sig: vec![0u8; 1001],
    };
    assert!(matches!(
        BlockAnn::decode(&ann.encode()),
        Err(ProtocolError::SignatureTooLong(1001))
    ));
}

// ── Signature soundness ─────────────────────────────────────────────────

#[test]
fn forged_sender_never_verifies() {
    let app = make_txapp();
    let honest = NodeKeypair::generate();
    let imposter = NodeKeypair::generate();

    // a transaction signed by one key but claiming another identity
    let mut forged = make_tx(&honest, 1);
    forged.sender = imposter.public_bytes();
    assert!(matches!(
        app.verify(&forged),
        Err(TxAppError::InvalidSignature(_))
    ));

    // tampering with the body after signing also fails
    let mut tampered = make_tx(&honest, 1);
    tampered.body.fee = 999;
    assert!(app.verify(&tampered).is_err());

    // the honest transaction verifies to the honest identity
    let ok = make_tx(&honest, 1);
    assert_eq!(app.verify(&ok).unwrap(), hex::encode(honest.public_bytes()));
}

// ── Replay protection ───────────────────────────────────────────────────

#[test]
fn wrong_chain_rejected_at_admission() {
    let app = make_txapp();
    let kp = NodeKeypair::generate();
    let foreign = make_tx_on("kwil-other", &kp, 1);
    assert!(matches!(app.verify(&foreign), Err(TxAppError::WrongChain(_))));
}

// ── Reconnect bound ─────────────────────────────────────────────────────

struct RefusingConnector {
    dials: AtomicUsize,
}

impl Connector for RefusingConnector {
    async fn dial(&self, _addrs: &[std::net::SocketAddr]) -> Result<PeerId, P2pError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(P2pError::ConnectionFailed("refused".into()))
    }

    async fn request_peers(&self, _peer: PeerId) -> Result<Vec<PeerInfo>, P2pError> {
        Ok(vec![])
    }

    async fn connected_peers(&self) -> Vec<ConnectedPeer> {
        vec![]
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_bounded_at_500() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(RefusingConnector {
        dials: AtomicUsize::new(0),
    });
    let pm = PeerMan::new(
        connector.clone(),
        dir.path().join("addrbook.json"),
        false,
        20,
    );

    let peer: PeerId = [1u8; 32];
    pm.add_peers(&[PeerInfo {
        id: hex::encode(peer),
        addresses: vec!["127.0.0.1:19999".into()],
        protocols: vec![],
    }]);
    let ctx = CancellationToken::new();
    pm.connected(peer, "127.0.0.1:19999".parse().unwrap(), vec![]);
    pm.clone().disconnected(peer, Duration::from_secs(30), ctx.clone());

    // 500 attempts at up to 60s apart is bounded by ~30,000s of virtual
    // time; advance well past that and make sure the count stopped
    for _ in 0..600 {
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
    }
    let total = connector.dials.load(Ordering::SeqCst);
    assert!(total <= 500, "dialed {} times, bound is 500", total);
    assert!(total >= 400, "expected the retry loop to run out, saw {}", total);
    ctx.cancel();
}
