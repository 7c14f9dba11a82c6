//! End-to-end scenarios: real nodes over loopback TCP with ephemeral
//! ports.
//!
//! 1. Nonce ordering through admission and commit
//! 2. Leader commit round with ACK quorum
//! 3. Dropped proposal: no quorum, reset, height unchanged
//! 4. Leader equivocation observed via cross-gossip
//! 5. Peer reconnect after a dropped connection
//! 6. Address book persistence across restart

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use kwil_node::chain::{Payload, Role, Transaction, TxBody, Validator};
use kwil_node::crypto::NodeKeypair;
use kwil_node::network::p2p;
use kwil_node::network::protocol::ProtocolId;
use kwil_node::node::mempool::MempoolError;
use kwil_node::node::{Node, NodeConfig, NodeError, NodeHandle};
use kwil_node::voting::Threshold;

const CHAIN: &str = "kwil-e2e";

struct TestNet {
    leader_kp: NodeKeypair,
    validator_kps: Vec<NodeKeypair>,
    validators: Vec<Validator>,
}

fn make_net(n_validators: usize) -> TestNet {
    let leader_kp = NodeKeypair::generate();
    let validator_kps: Vec<NodeKeypair> =
        (0..n_validators).map(|_| NodeKeypair::generate()).collect();
    let mut validators = vec![Validator {
        pubkey: leader_kp.public_bytes(),
        power: 1,
    }];
    for kp in &validator_kps {
        validators.push(Validator {
            pubkey: kp.public_bytes(),
            power: 1,
        });
    }
    TestNet {
        leader_kp,
        validator_kps,
        validators,
    }
}

struct RunningNode {
    handle: NodeHandle,
    addr: SocketAddr,
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn spawn_node(
    net: &TestNet,
    role: Role,
    keypair: NodeKeypair,
    bootstrap: Vec<SocketAddr>,
) -> RunningNode {
    spawn_node_in(net, role, keypair, bootstrap, tempfile::tempdir().unwrap()).await
}

async fn spawn_node_in(
    net: &TestNet,
    role: Role,
    keypair: NodeKeypair,
    bootstrap: Vec<SocketAddr>,
    dir: tempfile::TempDir,
) -> RunningNode {
    let token = CancellationToken::new();
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        rpc_addr: None,
        chain_id: CHAIN.to_string(),
        role,
        keypair,
        leader_pubkey: net.leader_kp.public_bytes(),
        validators: net.validators.clone(),
        bootstrap_peers: bootstrap,
        pex: false,
        target_connections: 8,
        gas_enabled: false,
        join_threshold: Threshold::default(),
        propose_interval: Duration::from_millis(200),
        ack_timeout: Duration::from_millis(1_500),
        dummy_tx_interval: None,
        dummy_tx_size: 0,
        memory_store: true,
    };
    let node = Node::new(config, token.clone()).await.unwrap();
    let handle = node.handle();
    let addr = node.local_addr();
    let task = tokio::spawn(node.run());
    RunningNode {
        handle,
        addr,
        token,
        task,
        _dir: dir,
    }
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn transfer(kp: &NodeKeypair, nonce: u64, note: &str) -> Transaction {
    Transaction::signed_ed25519(
        kp,
        TxBody {
            description: note.into(),
            payload: Payload::Transfer {
                to: "ff".repeat(32),
                amount: 0,
            },
            fee: 0,
            nonce,
            chain_id: CHAIN.into(),
        },
    )
}

// ── Scenario 1: nonce ordering ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonce_ordering_through_commit() {
    let net = make_net(2);
    let leader = spawn_node(&net, Role::Leader, net.leader_kp.clone(), vec![]).await;
    let v1 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[0].clone(),
        vec![leader.addr],
    )
    .await;
    let v2 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[1].clone(),
        vec![leader.addr],
    )
    .await;

    let sender = NodeKeypair::generate();
    let sender_id = hex::encode(sender.public_bytes());

    // 1 and 2 admit
    leader.handle.broadcast_tx(transfer(&sender, 1, "a")).await.unwrap();
    let tx2 = transfer(&sender, 2, "b");
    leader.handle.broadcast_tx(tx2.clone()).await.unwrap();

    // resubmitting 2 is a duplicate
    match leader.handle.broadcast_tx(tx2).await {
        Err(NodeError::Admission(MempoolError::Duplicate)) => {}
        other => panic!("expected duplicate rejection, got {:?}", other.map(hex::encode)),
    }

    // 4 is out of order until 3 fills the gap
    match leader.handle.broadcast_tx(transfer(&sender, 4, "d")).await {
        Err(NodeError::Admission(MempoolError::OutOfOrderNonce { got: 4, expected: 3 })) => {}
        other => panic!("expected out-of-order rejection, got {:?}", other.map(hex::encode)),
    }
    leader.handle.broadcast_tx(transfer(&sender, 3, "c")).await.unwrap();
    leader.handle.broadcast_tx(transfer(&sender, 4, "d")).await.unwrap();

    // all four commit; every node agrees the sender's nonce is 4
    let all_committed = wait_until(Duration::from_secs(20), || {
        [&leader, &v1, &v2].iter().all(|n| {
            n.handle
                .txapp
                .account(&sender_id)
                .map(|a| a.nonce == 4)
                .unwrap_or(false)
        })
    })
    .await;
    assert!(all_committed, "sender nonce did not reach 4 on all nodes");

    for node in [leader, v1, v2] {
        node.token.cancel();
        let _ = node.task.await;
    }
}

// ── Scenario 2: leader commit round ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_commit_round() {
    let net = make_net(2);
    let leader = spawn_node(&net, Role::Leader, net.leader_kp.clone(), vec![]).await;
    let v1 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[0].clone(),
        vec![leader.addr],
    )
    .await;
    let v2 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[1].clone(),
        vec![leader.addr],
    )
    .await;

    let sender = NodeKeypair::generate();
    leader.handle.broadcast_tx(transfer(&sender, 1, "x")).await.unwrap();

    let committed = wait_until(Duration::from_secs(20), || {
        [&leader, &v1, &v2].iter().all(|n| n.handle.store.best().0 >= 1)
    })
    .await;
    assert!(committed, "not all nodes reached height 1");

    // same block everywhere at height 1
    let (_, leader_hash, leader_app) = leader.handle.store.best();
    for node in [&v1, &v2] {
        let (hash, _, app_hash) = node
            .handle
            .store
            .get_by_height(1)
            .unwrap()
            .expect("height 1 committed");
        assert_eq!(hash, leader_hash);
        assert_eq!(app_hash, leader_app);
    }

    // the included transaction left every mempool
    for node in [&leader, &v1, &v2] {
        assert!(node.handle.mempool.lock().unwrap().is_empty());
    }

    for node in [leader, v1, v2] {
        node.token.cancel();
        let _ = node.task.await;
    }
}

// ── Scenario 3: dropped proposal, no quorum ─────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_proposal_resets_without_commit() {
    // the validator set is {L, V1, V2} but V1 never starts: quorum of 2
    // non-leader ACKs is unreachable
    let net = make_net(2);
    let leader = spawn_node(&net, Role::Leader, net.leader_kp.clone(), vec![]).await;
    let v2 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[1].clone(),
        vec![leader.addr],
    )
    .await;

    let sender = NodeKeypair::generate();
    let tx_hash = leader
        .handle
        .broadcast_tx(transfer(&sender, 1, "stuck"))
        .await
        .unwrap();

    // give it several proposal rounds and ack timeouts
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(leader.handle.store.best().0, 0, "leader must not commit");
    assert_eq!(v2.handle.store.best().0, 0, "validator must not commit");
    // the transaction stays pooled for the next round
    assert!(leader.handle.mempool.lock().unwrap().contains(&tx_hash));

    for node in [leader, v2] {
        node.token.cancel();
        let _ = node.task.await;
    }
}

// ── Scenario 4: leader equivocation ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivocating_leader_detected_via_cross_gossip() {
    let net = make_net(2);
    // honest validators, connected to each other for cross-gossip
    let v1 = spawn_node(&net, Role::Validator, net.validator_kps[0].clone(), vec![]).await;
    let v2 = spawn_node(
        &net,
        Role::Validator,
        net.validator_kps[1].clone(),
        vec![v1.addr],
    )
    .await;

    // the malicious leader is a bare transport endpoint signing two
    // different proposals for height 1
    let token = CancellationToken::new();
    let evil = p2p::start(
        p2p::P2pConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_peers: 8,
            keypair: net.leader_kp.clone(),
            chain_id: CHAIN.to_string(),
        },
        token.clone(),
    )
    .await
    .unwrap();
    let peer_v1 = evil.handle.connect(v1.addr).await.unwrap();
    let peer_v2 = evil.handle.connect(v2.addr).await.unwrap();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let mut block_a = kwil_node::chain::Block::build(
        1,
        [0u8; 32],
        [0u8; 32],
        now,
        net.leader_kp.public_bytes(),
        vec![],
    );
    block_a.sign(&net.leader_kp);
    let mut block_b = kwil_node::chain::Block::build(
        1,
        [0u8; 32],
        [0u8; 32],
        now + 1, // differs only in timestamp, still within tolerance
        net.leader_kp.public_bytes(),
        vec![],
    );
    block_b.sign(&net.leader_kp);
    assert_ne!(block_a.hash(), block_b.hash());

    evil.handle
        .announce(
            peer_v1,
            ProtocolId::BlkProp,
            kwil_node::serialize(&block_a).unwrap(),
        )
        .await
        .unwrap();
    evil.handle
        .announce(
            peer_v2,
            ProtocolId::BlkProp,
            kwil_node::serialize(&block_b).unwrap(),
        )
        .await
        .unwrap();

    // each validator relays its proposal; upon seeing the sibling both
    // reset, and with no honest leader nothing ever commits
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(v1.handle.store.best().0, 0);
    assert_eq!(v2.handle.store.best().0, 0);

    token.cancel();
    for node in [v1, v2] {
        node.token.cancel();
        let _ = node.task.await;
    }
}

// ── Scenario 5: peer reconnect ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_reconnects_after_drop() {
    let net = make_net(0);
    let a_kp = NodeKeypair::generate();
    let b_kp = NodeKeypair::generate();
    let b_peer_id = b_kp.peer_id();
    let a_peer_id = a_kp.peer_id();

    let b = spawn_node(&net, Role::Sentry, b_kp, vec![]).await;
    let a = spawn_node(&net, Role::Sentry, a_kp, vec![b.addr]).await;

    let connected = wait_until(Duration::from_secs(10), || {
        let (_, connected, _) = a.handle.peer_man.known_peers();
        connected.iter().any(|p| p.id == hex::encode(b_peer_id))
    })
    .await;
    assert!(connected, "initial connection not established");

    // sever the connection from B's side
    b.handle.p2p.disconnect(a_peer_id).await.unwrap();
    let dropped = wait_until(Duration::from_secs(10), || {
        let (_, connected, _) = a.handle.peer_man.known_peers();
        !connected.iter().any(|p| p.id == hex::encode(b_peer_id))
    })
    .await;
    assert!(dropped, "disconnect not observed");

    // the reconnect task (or min-peer maintenance) restores it within the
    // first backoff steps
    let restored = wait_until(Duration::from_secs(30), || {
        let (_, connected, _) = a.handle.peer_man.known_peers();
        connected.iter().any(|p| p.id == hex::encode(b_peer_id))
    })
    .await;
    assert!(restored, "peer not reconnected");

    for node in [a, b] {
        node.token.cancel();
        let _ = node.task.await;
    }
}

// ── Scenario 6: address book persistence ────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn address_book_survives_restart() {
    let net = make_net(0);
    let peers: Vec<RunningNode> = {
        let mut nodes = vec![];
        for _ in 0..3 {
            nodes.push(spawn_node(&net, Role::Sentry, NodeKeypair::generate(), vec![]).await);
        }
        nodes
    };
    let peer_addrs: Vec<SocketAddr> = peers.iter().map(|p| p.addr).collect();

    let a_kp = NodeKeypair::generate();
    let a_dir = tempfile::tempdir().unwrap();
    let a = spawn_node_in(&net, Role::Sentry, a_kp.clone(), peer_addrs, a_dir).await;

    let connected = wait_until(Duration::from_secs(10), || {
        let (_, connected, _) = a.handle.peer_man.known_peers();
        connected.len() >= 3
    })
    .await;
    assert!(connected, "did not connect to all three peers");

    let (known_before, _, _) = a.handle.peer_man.known_peers();
    let ids_before: Vec<String> = known_before.iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids_before.len(), 3);

    // stop node A; run() persists the address book on the way out
    let a_dir = a._dir;
    a.token.cancel();
    let _ = a.task.await;

    // restart with the same data dir and no bootstrap peers
    let restarted = spawn_node_in(&net, Role::Sentry, a_kp, vec![], a_dir).await;
    let (known_after, _, _) = restarted.handle.peer_man.known_peers();
    for id in &ids_before {
        let entry = known_after.iter().find(|p| &p.id == id);
        let entry = entry.unwrap_or_else(|| panic!("peer {} missing after restart", id));
        assert!(!entry.addresses.is_empty(), "peer {} lost its addresses", id);
    }

    restarted.token.cancel();
    let _ = restarted.task.await;
    for node in peers {
        node.token.cancel();
        let _ = node.task.await;
    }
}
