//! The consensus round driver.
//!
//! One round per height: the leader proposes a block, validators replay it
//! in a staging window and answer with signed ACKs, and once the leader
//! collects a quorum of positive ACKs it announces the committed block.
//! Validators commit on that announcement; sentries skip the vote and
//! commit only.
//!
//! The driver's per-height state is owned by its single task. Everything
//! else talks to it through bounded channels: [`ConsensusInput`] in,
//! [`ConsensusOutput`] out. Messages that fail verification are dropped
//! with a log line; they never terminate the driver. Engine-level
//! execution failures during replay produce a NACK, not a crash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::{Block, Role, TxResult, Validator};
use crate::crypto::{verify_ed25519, NodeKeypair};
use crate::network::protocol::{AckPayload, ResetPayload};
use crate::node::mempool::Mempool;
use crate::node::store::BlockStore;
use crate::node::txapp::{BlockContext, TxApp};
use crate::Hash;

/// Round phases for the current height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingProposal,
    Executing,
    AwaitingCommit,
    Committed,
}

/// Driver configuration.
#[derive(Clone)]
pub struct ConsensusConfig {
    pub role: Role,
    pub keypair: NodeKeypair,
    pub leader_pubkey: Vec<u8>,
    pub chain_id: String,
    /// Leader proposal tick.
    pub propose_interval: Duration,
    /// How long the leader waits for ACK quorum before resetting.
    pub ack_timeout: Duration,
    pub max_block_txs: usize,
    /// Propose blocks even when the mempool is empty.
    pub empty_blocks: bool,
}

/// Messages into the driver. The node verifies transport-level signatures
/// (gossip senders) before forwarding; the driver re-checks everything
/// consensus-critical.
#[derive(Debug)]
pub enum ConsensusInput {
    /// A block proposal received on `blkprop`.
    Proposal { block: Block },
    /// A validator ACK/NACK from the ack gossip topic.
    Ack(AckPayload),
    /// A committed-block announcement (block fetched via `blk`).
    Commit { block: Block, app_hash: Hash },
    /// A reset announcement from the reset gossip topic.
    Reset { height: i64, reason: String },
}

/// Actions the node performs on behalf of the driver.
#[derive(Debug)]
pub enum ConsensusOutput {
    /// Announce a proposal on `blkprop` (leader origination or validator
    /// relay).
    AnnounceProposal { block: Block },
    /// Announce a committed block on `blkann`.
    AnnounceCommit { block: Block, app_hash: Hash },
    /// Gossip our signed ACK/NACK.
    BroadcastAck(AckPayload),
    /// Gossip a reset for the current height.
    BroadcastReset(ResetPayload),
}

/// Cloneable sender for feeding the driver.
#[derive(Clone)]
pub struct ConsensusHandle {
    input_tx: mpsc::Sender<ConsensusInput>,
}

impl ConsensusHandle {
    /// Hand an input to the driver. Non-blocking: when the driver's queue
    /// is full the message is dropped (gossip redelivers), which also
    /// rules out a send cycle between the node loop and the driver.
    pub async fn send(&self, input: ConsensusInput) {
        if let Err(e) = self.input_tx.try_send(input) {
            tracing::debug!(error = %e, "Consensus input dropped (queue full)");
        }
    }
}

/// Per-height round state, owned by the driver task.
struct RoundState {
    height: i64,
    phase: Phase,
    block: Option<Block>,
    block_hash: Hash,
    app_hash: Hash,
    results: Vec<TxResult>,
    /// Leader side: validator identifier -> positive vote.
    acks: HashMap<String, bool>,
    /// First valid-signed proposal hash seen at this height, for
    /// equivocation detection.
    proposal_seen: Option<Hash>,
    proposed_at: Option<Instant>,
    /// A staging checkpoint is open over accounts/engine state.
    staged: bool,
}

impl RoundState {
    /// A round that has not started consuming inputs yet. The transition
    /// to `AwaitingProposal` happens on first activity.
    fn idle(height: i64) -> Self {
        RoundState {
            phase: Phase::Idle,
            ..RoundState::fresh(height)
        }
    }

    fn fresh(height: i64) -> Self {
        RoundState {
            height,
            phase: Phase::AwaitingProposal,
            block: None,
            block_hash: [0u8; 32],
            app_hash: [0u8; 32],
            results: vec![],
            acks: HashMap::new(),
            proposal_seen: None,
            proposed_at: None,
            staged: false,
        }
    }
}

/// The consensus round driver.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    store: Arc<dyn BlockStore>,
    mempool: Arc<Mutex<Mempool>>,
    txapp: Arc<TxApp>,
    validators: Arc<RwLock<HashMap<String, Validator>>>,
    round: RoundState,
    out_tx: mpsc::Sender<ConsensusOutput>,
    input_rx: Option<mpsc::Receiver<ConsensusInput>>,
    /// Root context, set by `run`. Fatal storage failures cancel it to
    /// bring the whole node down.
    shutdown: Option<CancellationToken>,
}

/// Commitment to the state after a block: digest of the previous app hash
/// and the ordered result codes and gas. Every replayer computes the same
/// value or NACKs.
pub fn compute_app_hash(prev_app_hash: &Hash, results: &[TxResult]) -> Hash {
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(1 + results.len());
    parts.push(prev_app_hash.to_vec());
    for result in results {
        let mut item = Vec::with_capacity(12);
        item.extend_from_slice(&result.code.to_le_bytes());
        item.extend_from_slice(&result.gas_used.to_le_bytes());
        parts.push(item);
    }
    let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    crate::hash_concat(&refs)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ConsensusEngine {
    /// Build the driver with its channels wired. Returns the driver, the
    /// input handle, and the output receiver.
    pub fn create(
        config: ConsensusConfig,
        store: Arc<dyn BlockStore>,
        mempool: Arc<Mutex<Mempool>>,
        txapp: Arc<TxApp>,
        validators: Arc<RwLock<HashMap<String, Validator>>>,
    ) -> (Self, ConsensusHandle, mpsc::Receiver<ConsensusOutput>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let height = store.best().0 + 1;
        let engine = ConsensusEngine {
            config,
            store,
            mempool,
            txapp,
            validators,
            round: RoundState::idle(height),
            out_tx,
            input_rx: Some(input_rx),
            shutdown: None,
        };
        let handle = ConsensusHandle { input_tx };
        (engine, handle, out_rx)
    }

    /// Drive the round state machine until cancelled.
    pub async fn run(mut self, ctx: CancellationToken) {
        self.shutdown = Some(ctx.clone());
        let mut input_rx = self.input_rx.take().expect("created with create()");
        let mut propose_tick = tokio::time::interval(self.config.propose_interval);
        propose_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut timeout_tick = tokio::time::interval(Duration::from_millis(200));

        tracing::info!(
            role = %self.config.role,
            height = self.round.height,
            "Consensus driver started"
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    if self.round.staged {
                        self.txapp.rollback_staged();
                    }
                    break;
                }
                Some(input) = input_rx.recv() => {
                    self.process(input).await;
                }
                _ = propose_tick.tick() => {
                    if self.config.role == Role::Leader {
                        self.try_propose().await;
                    }
                }
                _ = timeout_tick.tick() => {
                    self.check_ack_timeout().await;
                }
            }
        }
        tracing::info!("Consensus driver stopped");
    }

    /// Process one input. Exposed for driving the state machine directly
    /// in tests.
    pub async fn process(&mut self, input: ConsensusInput) {
        self.leave_idle();
        match input {
            ConsensusInput::Proposal { block } => self.handle_proposal(block).await,
            ConsensusInput::Ack(ack) => self.handle_ack(ack).await,
            ConsensusInput::Commit { block, app_hash } => {
                self.handle_commit(block, app_hash).await
            }
            ConsensusInput::Reset { height, reason } => self.handle_reset(height, reason).await,
        }
    }

    /// The automatic `Idle -> AwaitingProposal` transition on first
    /// activity at a height.
    fn leave_idle(&mut self) {
        if self.round.phase == Phase::Idle {
            self.round.phase = Phase::AwaitingProposal;
        }
    }

    pub fn phase(&self) -> Phase {
        self.round.phase
    }

    pub fn height(&self) -> i64 {
        self.round.height
    }

    /// Validate a proposal header against the current round: height
    /// continuity, previous hash, leader identity and signature, and
    /// timestamp skew. Verification failures return `false`; the caller
    /// drops the proposal.
    pub fn accept_proposal(
        &self,
        height: i64,
        block_hash: &Hash,
        prev_hash: &Hash,
        proposer: &[u8],
        leader_sig: &[u8],
        timestamp: u64,
    ) -> bool {
        if height != self.round.height {
            tracing::debug!(got = height, want = self.round.height, "Proposal height mismatch");
            return false;
        }
        let (_, best_hash, _) = self.store.best();
        if *prev_hash != best_hash {
            tracing::debug!("Proposal prev hash mismatch");
            return false;
        }
        if proposer != self.config.leader_pubkey.as_slice() {
            tracing::debug!("Proposal from non-leader");
            return false;
        }
        if verify_ed25519(proposer, block_hash, leader_sig).is_err() {
            tracing::debug!("Proposal leader signature invalid");
            return false;
        }
        let now = now_ms();
        let skew = crate::constants::PROPOSAL_TIMESTAMP_SKEW_MS;
        if timestamp + skew < now || timestamp > now + skew {
            tracing::debug!(timestamp, now, "Proposal timestamp outside tolerance");
            return false;
        }
        true
    }

    /// Validate a commit announcement: height continuity, leader identity
    /// and signature over the block hash.
    pub fn accept_commit(
        &self,
        height: i64,
        block_hash: &Hash,
        proposer: &[u8],
        leader_sig: &[u8],
    ) -> bool {
        if height != self.round.height {
            tracing::debug!(got = height, want = self.round.height, "Commit height mismatch");
            return false;
        }
        if proposer != self.config.leader_pubkey.as_slice() {
            tracing::debug!("Commit from non-leader");
            return false;
        }
        if verify_ed25519(proposer, block_hash, leader_sig).is_err() {
            tracing::debug!("Commit leader signature invalid");
            return false;
        }
        true
    }

    // ── Leader ──

    /// Pull a batch, build and sign a block, execute it locally, and
    /// announce the proposal.
    async fn try_propose(&mut self) {
        self.leave_idle();
        if self.round.phase != Phase::AwaitingProposal || self.round.block.is_some() {
            return;
        }
        let batch = {
            let mempool = self.mempool.lock().expect("mempool lock poisoned");
            mempool.reap(self.config.max_block_txs)
        };
        if batch.is_empty() && !self.config.empty_blocks {
            return;
        }

        let (prev_height, prev_hash, prev_app_hash) = self.store.best();
        let mut block = Block::build(
            prev_height + 1,
            prev_hash,
            prev_app_hash,
            now_ms(),
            self.config.keypair.public_bytes(),
            batch,
        );
        block.sign(&self.config.keypair);
        let block_hash = block.hash();

        // Execute our own proposal in a staging window; committed once
        // quorum arrives.
        self.txapp.checkpoint();
        let results = self.execute_block(&block);
        let app_hash = compute_app_hash(&prev_app_hash, &results);

        self.round.block = Some(block.clone());
        self.round.block_hash = block_hash;
        self.round.app_hash = app_hash;
        self.round.results = results;
        self.round.acks.clear();
        self.round.staged = true;
        self.round.proposed_at = Some(Instant::now());
        self.round.phase = Phase::AwaitingCommit;

        tracing::info!(
            height = block.header.height,
            hash = %hex::encode(&block_hash[..8]),
            txs = block.txns.len(),
            "Proposed block"
        );
        let _ = self
            .out_tx
            .send(ConsensusOutput::AnnounceProposal { block })
            .await;
    }

    /// Count a validator ACK toward quorum. Leader only.
    async fn handle_ack(&mut self, ack: AckPayload) {
        if self.config.role != Role::Leader {
            return;
        }
        if self.round.phase != Phase::AwaitingCommit || ack.height != self.round.height {
            return;
        }

        let voter = hex::encode(&ack.validator);
        let is_validator = {
            let set = self.validators.read().expect("validators lock poisoned");
            set.get(&voter).map(|v| v.power > 0).unwrap_or(false)
        };
        if !is_validator || ack.validator == self.config.leader_pubkey {
            tracing::debug!(voter = %voter, "ACK from non-validator dropped");
            return;
        }
        let sign_bytes = AckPayload::sign_bytes(
            &self.config.chain_id,
            ack.height,
            &ack.block_hash,
            &ack.app_hash,
            ack.ack,
        );
        if verify_ed25519(&ack.validator, &sign_bytes, &ack.signature).is_err() {
            tracing::debug!(voter = %voter, "ACK signature invalid, dropped");
            return;
        }

        let positive =
            ack.ack && ack.block_hash == self.round.block_hash && ack.app_hash == self.round.app_hash;
        self.round.acks.insert(voter, positive);

        let quorum = self.quorum();
        let yes = self.round.acks.values().filter(|v| **v).count();
        let no = self.round.acks.values().filter(|v| !**v).count();
        tracing::debug!(yes, no, quorum, height = self.round.height, "ACK recorded");

        if yes >= quorum {
            self.commit_own_round().await;
        } else if no >= quorum {
            tracing::warn!(height = self.round.height, "NACK quorum, resetting round");
            self.abort_round("nack quorum").await;
        }
    }

    /// Leader reached quorum: commit the staged state, persist, announce.
    async fn commit_own_round(&mut self) {
        let Some(block) = self.round.block.take() else { return };
        let app_hash = self.round.app_hash;
        let results = std::mem::take(&mut self.round.results);

        self.txapp.commit_staged();
        self.round.staged = false;
        self.persist_committed(&block, app_hash, &results);

        tracing::info!(
            height = block.header.height,
            hash = %hex::encode(&block.hash()[..8]),
            "Committed block (quorum)"
        );
        let _ = self
            .out_tx
            .send(ConsensusOutput::AnnounceCommit {
                block: block.clone(),
                app_hash,
            })
            .await;
        self.advance_round();
    }

    /// Leader ACK-timeout watchdog.
    async fn check_ack_timeout(&mut self) {
        if self.config.role != Role::Leader || self.round.phase != Phase::AwaitingCommit {
            return;
        }
        let Some(proposed_at) = self.round.proposed_at else { return };
        if proposed_at.elapsed() > self.config.ack_timeout {
            tracing::warn!(height = self.round.height, "ACK timeout, resetting round");
            self.abort_round("ack timeout").await;
        }
    }

    /// Abort the in-flight round: roll back staging, broadcast a signed
    /// reset, and re-enter AwaitingProposal at the same height. The
    /// mempool is untouched.
    async fn abort_round(&mut self, reason: &str) {
        if self.round.staged {
            self.txapp.rollback_staged();
        }
        let height = self.round.height;
        let sign_bytes = ResetPayload::sign_bytes(&self.config.chain_id, height, reason);
        let reset = ResetPayload {
            height,
            reason: reason.to_string(),
            validator: self.config.keypair.public_bytes(),
            signature: self.config.keypair.sign(&sign_bytes),
        };
        self.round = RoundState::fresh(height);
        let _ = self
            .out_tx
            .send(ConsensusOutput::BroadcastReset(reset))
            .await;
    }

    // ── Validator / sentry ──

    /// Handle an incoming proposal: verify, detect equivocation, replay,
    /// and answer with a signed ACK or NACK.
    async fn handle_proposal(&mut self, block: Block) {
        if self.config.role == Role::Leader {
            return; // we originate proposals, never consume them
        }
        let block_hash = block.hash();

        if !self.accept_proposal(
            block.header.height,
            &block_hash,
            &block.header.prev_hash,
            &block.header.proposer,
            &block.leader_sig,
            block.header.timestamp,
        ) {
            return;
        }

        // Two distinct valid-signed proposals at one height is leader
        // equivocation: drop the round and tell everyone.
        if let Some(seen) = self.round.proposal_seen {
            if seen != block_hash {
                tracing::warn!(
                    height = block.header.height,
                    first = %hex::encode(&seen[..8]),
                    second = %hex::encode(&block_hash[..8]),
                    "Leader equivocation observed"
                );
                self.abort_round("leader equivocation").await;
                return;
            }
            return; // duplicate of what we already processed
        }
        self.round.proposal_seen = Some(block_hash);

        // Relay the proposal so every validator observes it (and any
        // conflicting sibling).
        let _ = self
            .out_tx
            .send(ConsensusOutput::AnnounceProposal {
                block: block.clone(),
            })
            .await;

        if self.config.role == Role::Sentry {
            return; // non-voting: wait for the commit announcement
        }

        // Replay failure answers with a NACK rather than silence, so the
        // leader can reach a negative quorum and reset.
        if !block.verify_merkle_root() {
            tracing::warn!(
                height = block.header.height,
                "Proposal merkle root mismatch, NACKing"
            );
            self.send_vote(block.header.height, block_hash, [0u8; 32], false)
                .await;
            return;
        }

        // Replay in a staging window and vote.
        self.round.phase = Phase::Executing;
        self.txapp.checkpoint();
        let results = self.execute_block(&block);
        let app_hash = compute_app_hash(&block.header.prev_app_hash, &results);

        self.round.block = Some(block.clone());
        self.round.block_hash = block_hash;
        self.round.app_hash = app_hash;
        self.round.results = results;
        self.round.staged = true;
        self.round.phase = Phase::AwaitingCommit;

        tracing::info!(
            height = block.header.height,
            hash = %hex::encode(&block_hash[..8]),
            app_hash = %hex::encode(&app_hash[..8]),
            "ACKing proposal"
        );
        self.send_vote(block.header.height, block_hash, app_hash, true)
            .await;
    }

    /// Sign and emit our ACK/NACK over `(height, block_hash, app_hash)`.
    async fn send_vote(&mut self, height: i64, block_hash: Hash, app_hash: Hash, ack: bool) {
        let sign_bytes =
            AckPayload::sign_bytes(&self.config.chain_id, height, &block_hash, &app_hash, ack);
        let vote = AckPayload {
            height,
            block_hash,
            app_hash,
            ack,
            validator: self.config.keypair.public_bytes(),
            signature: self.config.keypair.sign(&sign_bytes),
        };
        let _ = self.out_tx.send(ConsensusOutput::BroadcastAck(vote)).await;
    }

    /// Handle a committed-block announcement.
    async fn handle_commit(&mut self, block: Block, app_hash: Hash) {
        if self.config.role == Role::Leader {
            return; // the leader committed at quorum
        }
        let block_hash = block.hash();
        if block.header.height < self.round.height {
            return; // stale announcement for an already-committed height
        }
        if !self.accept_commit(
            block.header.height,
            &block_hash,
            &block.header.proposer,
            &block.leader_sig,
        ) {
            return;
        }

        let results = if self.round.staged && self.round.block_hash == block_hash {
            // we executed this exact proposal; our app hash must agree
            if self.round.app_hash != app_hash {
                tracing::error!(
                    ours = %hex::encode(&self.round.app_hash[..8]),
                    theirs = %hex::encode(&app_hash[..8]),
                    "Commit app hash disagrees with local replay, dropping"
                );
                self.txapp.rollback_staged();
                self.round = RoundState::fresh(self.round.height);
                return;
            }
            self.txapp.commit_staged();
            self.round.staged = false;
            std::mem::take(&mut self.round.results)
        } else {
            // sentry, or we never saw the proposal: execute now
            if self.round.staged {
                // a different proposal was staged; discard it
                self.txapp.rollback_staged();
                self.round.staged = false;
            }
            if !block.verify_merkle_root() {
                tracing::debug!("Committed block merkle root mismatch, dropped");
                return;
            }
            self.txapp.checkpoint();
            let results = self.execute_block(&block);
            let computed = compute_app_hash(&block.header.prev_app_hash, &results);
            if computed != app_hash {
                tracing::error!(
                    computed = %hex::encode(&computed[..8]),
                    announced = %hex::encode(&app_hash[..8]),
                    "Commit app hash mismatch on replay, dropping"
                );
                self.txapp.rollback_staged();
                return;
            }
            self.txapp.commit_staged();
            results
        };

        self.persist_committed(&block, app_hash, &results);
        tracing::info!(
            height = block.header.height,
            hash = %hex::encode(&block_hash[..8]),
            "Committed block (announced)"
        );
        let _ = self
            .out_tx
            .send(ConsensusOutput::AnnounceCommit {
                block: block.clone(),
                app_hash,
            })
            .await;
        self.advance_round();
    }

    /// Handle a verified reset announcement: drop the current height's
    /// state and wait for a new proposal.
    async fn handle_reset(&mut self, height: i64, reason: String) {
        if height != self.round.height {
            return;
        }
        tracing::warn!(height, reason = %reason, "Consensus reset");
        if self.round.staged {
            self.txapp.rollback_staged();
        }
        self.round = RoundState::fresh(height);
    }

    // ── Shared ──

    /// Execute the block's transactions in proposer order.
    fn execute_block(&self, block: &Block) -> Vec<TxResult> {
        let ctx = BlockContext {
            height: block.header.height,
            timestamp: block.header.timestamp,
            proposer: block.header.proposer.clone(),
        };
        block
            .txns
            .iter()
            .map(|tx| self.txapp.execute(tx, &ctx))
            .collect()
    }

    /// Store block and results, purge its transactions from the mempool,
    /// re-check remaining pool entries, run end-of-block housekeeping.
    /// A storage write failure is fatal: it cancels the root context so
    /// the node shuts down rather than limp on with a corrupt archive.
    fn persist_committed(&self, block: &Block, app_hash: Hash, results: &[TxResult]) {
        let block_hash = block.hash();
        let stored = self
            .store
            .store(block, app_hash)
            .and_then(|()| self.store.store_results(&block_hash, results));
        if let Err(e) = stored {
            tracing::error!(error = %e, "FATAL: block store write failed, shutting down");
            match &self.shutdown {
                Some(ctx) => {
                    ctx.cancel();
                    return;
                }
                None => panic!("block store write failed: {}", e),
            }
        }

        let tx_hashes: Vec<Hash> = block.txns.iter().map(|tx| tx.hash()).collect();
        {
            let mut mempool = self.mempool.lock().expect("mempool lock poisoned");
            mempool.remove_committed(&tx_hashes);
            let marked = mempool.recheck(|identifier| self.txapp.account(identifier));
            if !marked.is_empty() {
                tracing::debug!(count = marked.len(), "Marked txs for rebroadcast");
            }
        }
        self.txapp.end_block(block.header.height);
    }

    /// `Committed(h)` transitions automatically to
    /// `AwaitingProposal(h + 1)`.
    fn advance_round(&mut self) {
        self.round.phase = Phase::Committed;
        let next = self.round.height + 1;
        self.round = RoundState::fresh(next);
    }

    /// ACK quorum: a majority of the full validator set, counted over
    /// non-leader votes.
    fn quorum(&self) -> usize {
        let n = self.validators.read().expect("validators lock poisoned").len();
        n / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Payload, Transaction, TxBody};
    use crate::engine::{DatasetEngine, MemAccountStore, Pricer};
    use crate::node::mempool::MempoolConfig;
    use crate::node::store::MemBlockStore;
    use crate::voting::Threshold;

    const CHAIN: &str = "kwil-test";

    struct Net {
        leader_kp: NodeKeypair,
        validator_kps: Vec<NodeKeypair>,
        validators: Arc<RwLock<HashMap<String, Validator>>>,
    }

    fn make_net(n_validators: usize) -> Net {
        let leader_kp = NodeKeypair::generate();
        let validator_kps: Vec<NodeKeypair> =
            (0..n_validators).map(|_| NodeKeypair::generate()).collect();
        let mut set = HashMap::new();
        set.insert(
            hex::encode(leader_kp.public_bytes()),
            Validator {
                pubkey: leader_kp.public_bytes(),
                power: 1,
            },
        );
        for kp in &validator_kps {
            set.insert(
                hex::encode(kp.public_bytes()),
                Validator {
                    pubkey: kp.public_bytes(),
                    power: 1,
                },
            );
        }
        Net {
            leader_kp,
            validator_kps,
            validators: Arc::new(RwLock::new(set)),
        }
    }

    struct TestNode {
        engine: ConsensusEngine,
        out_rx: mpsc::Receiver<ConsensusOutput>,
        store: Arc<MemBlockStore>,
        mempool: Arc<Mutex<Mempool>>,
    }

    fn make_node(net: &Net, role: Role, keypair: NodeKeypair) -> TestNode {
        let store = Arc::new(MemBlockStore::new());
        let mempool = Arc::new(Mutex::new(Mempool::new(MempoolConfig {
            gas_enabled: false,
            ..Default::default()
        })));
        let accounts = Arc::new(MemAccountStore::new());
        let txapp = Arc::new(TxApp::new(
            CHAIN.to_string(),
            Pricer::new(false),
            accounts,
            Arc::new(DatasetEngine::new()),
            net.validators.clone(),
            Threshold::default(),
            100,
        ));
        let config = ConsensusConfig {
            role,
            keypair,
            leader_pubkey: net.leader_kp.public_bytes(),
            chain_id: CHAIN.to_string(),
            propose_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(500),
            max_block_txs: 50,
            empty_blocks: true,
        };
        let (engine, _handle, out_rx) = ConsensusEngine::create(
            config,
            store.clone(),
            mempool.clone(),
            txapp,
            net.validators.clone(),
        );
        TestNode {
            engine,
            out_rx,
            store,
            mempool,
        }
    }

    fn make_tx(kp: &NodeKeypair, nonce: u64) -> Transaction {
        Transaction::signed_ed25519(
            kp,
            TxBody {
                description: "t".into(),
                payload: Payload::Transfer {
                    to: "dd".repeat(32),
                    amount: 0,
                },
                fee: 0,
                nonce,
                chain_id: CHAIN.into(),
            },
        )
    }

    fn drain_outputs(node: &mut TestNode) -> Vec<ConsensusOutput> {
        let mut outputs = vec![];
        while let Ok(out) = node.out_rx.try_recv() {
            outputs.push(out);
        }
        outputs
    }

    #[tokio::test]
    async fn leader_commit_round_with_quorum() {
        let net = make_net(2);
        let mut leader = make_node(&net, Role::Leader, net.leader_kp.clone());
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());
        let mut v2 = make_node(&net, Role::Validator, net.validator_kps[1].clone());

        // seed the leader's mempool
        let sender = NodeKeypair::generate();
        {
            let mut pool = leader.mempool.lock().unwrap();
            pool.insert(make_tx(&sender, 1), "s", None).unwrap();
        }

        leader.engine.try_propose().await;
        let outputs = drain_outputs(&mut leader);
        let block = match outputs.as_slice() {
            [ConsensusOutput::AnnounceProposal { block }] => block.clone(),
            other => panic!("expected proposal, got {:?}", other),
        };
        assert_eq!(block.header.height, 1);
        assert_eq!(leader.engine.phase(), Phase::AwaitingCommit);

        // both validators replay and ACK
        let mut acks = vec![];
        for v in [&mut v1, &mut v2] {
            v.engine
                .process(ConsensusInput::Proposal {
                    block: block.clone(),
                })
                .await;
            for out in drain_outputs(v) {
                if let ConsensusOutput::BroadcastAck(ack) = out {
                    assert!(ack.ack);
                    acks.push(ack);
                }
            }
        }
        assert_eq!(acks.len(), 2);

        // quorum for a 3-member set is 2
        leader
            .engine
            .process(ConsensusInput::Ack(acks[0].clone()))
            .await;
        assert_eq!(leader.store.best().0, 0); // one ack is not enough
        leader
            .engine
            .process(ConsensusInput::Ack(acks[1].clone()))
            .await;
        assert_eq!(leader.store.best().0, 1);

        let commit = drain_outputs(&mut leader)
            .into_iter()
            .find_map(|o| match o {
                ConsensusOutput::AnnounceCommit { block, app_hash } => Some((block, app_hash)),
                _ => None,
            })
            .expect("leader announces the commit");

        // validators commit on the announcement
        for v in [&mut v1, &mut v2] {
            v.engine
                .process(ConsensusInput::Commit {
                    block: commit.0.clone(),
                    app_hash: commit.1,
                })
                .await;
            assert_eq!(v.store.best().0, 1);
            assert_eq!(v.store.best().1, block.hash());
            assert_eq!(v.engine.height(), 2);
        }

        // the included tx left the leader's mempool
        assert!(leader.mempool.lock().unwrap().is_empty());
        assert_eq!(leader.engine.height(), 2);
    }

    #[tokio::test]
    async fn ack_timeout_resets_round() {
        let net = make_net(2);
        let mut leader = make_node(&net, Role::Leader, net.leader_kp.clone());

        leader.engine.try_propose().await;
        assert_eq!(leader.engine.phase(), Phase::AwaitingCommit);
        drain_outputs(&mut leader);

        // force the timeout watchdog
        leader.engine.round.proposed_at =
            Some(Instant::now() - Duration::from_secs(60));
        leader.engine.check_ack_timeout().await;

        assert_eq!(leader.engine.phase(), Phase::AwaitingProposal);
        assert_eq!(leader.engine.height(), 1);
        assert_eq!(leader.store.best().0, 0);
        let outputs = drain_outputs(&mut leader);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, ConsensusOutput::BroadcastReset(_))));
    }

    #[tokio::test]
    async fn single_ack_below_quorum_keeps_height() {
        let net = make_net(2);
        let mut leader = make_node(&net, Role::Leader, net.leader_kp.clone());
        let mut v2 = make_node(&net, Role::Validator, net.validator_kps[1].clone());

        leader.engine.try_propose().await;
        let block = match drain_outputs(&mut leader).pop().unwrap() {
            ConsensusOutput::AnnounceProposal { block } => block,
            other => panic!("unexpected {:?}", other),
        };

        v2.engine
            .process(ConsensusInput::Proposal { block })
            .await;
        let ack = drain_outputs(&mut v2)
            .into_iter()
            .find_map(|o| match o {
                ConsensusOutput::BroadcastAck(ack) => Some(ack),
                _ => None,
            })
            .unwrap();

        leader.engine.process(ConsensusInput::Ack(ack)).await;
        assert_eq!(leader.store.best().0, 0);
        assert_eq!(leader.engine.phase(), Phase::AwaitingCommit);
    }

    #[tokio::test]
    async fn equivocating_leader_triggers_reset() {
        let net = make_net(2);
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());

        // two distinct signed proposals at height 1
        let mut block_a = Block::build(1, [0u8; 32], [0u8; 32], now_ms(), net.leader_kp.public_bytes(), vec![]);
        block_a.sign(&net.leader_kp);
        let sender = NodeKeypair::generate();
        let mut block_b = Block::build(
            1,
            [0u8; 32],
            [0u8; 32],
            now_ms(),
            net.leader_kp.public_bytes(),
            vec![make_tx(&sender, 1)],
        );
        block_b.sign(&net.leader_kp);
        assert_ne!(block_a.hash(), block_b.hash());

        v1.engine
            .process(ConsensusInput::Proposal { block: block_a })
            .await;
        drain_outputs(&mut v1);

        v1.engine
            .process(ConsensusInput::Proposal { block: block_b })
            .await;
        let outputs = drain_outputs(&mut v1);
        let reset = outputs
            .iter()
            .find_map(|o| match o {
                ConsensusOutput::BroadcastReset(reset) => Some(reset),
                _ => None,
            })
            .expect("equivocation must broadcast a reset");
        assert_eq!(reset.height, 1);
        assert!(reset.reason.contains("equivocation"));
        assert_eq!(v1.store.best().0, 0);
        assert_eq!(v1.engine.phase(), Phase::AwaitingProposal);
    }

    #[tokio::test]
    async fn proposal_from_non_leader_dropped() {
        let net = make_net(2);
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());

        let impostor = NodeKeypair::generate();
        let mut block = Block::build(1, [0u8; 32], [0u8; 32], now_ms(), impostor.public_bytes(), vec![]);
        block.sign(&impostor);

        v1.engine
            .process(ConsensusInput::Proposal { block })
            .await;
        assert!(drain_outputs(&mut v1).is_empty());
        assert_eq!(v1.engine.phase(), Phase::AwaitingProposal);
    }

    #[tokio::test]
    async fn proposal_with_stale_timestamp_dropped() {
        let net = make_net(2);
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());

        let stale = now_ms() - crate::constants::PROPOSAL_TIMESTAMP_SKEW_MS - 60_000;
        let mut block = Block::build(1, [0u8; 32], [0u8; 32], stale, net.leader_kp.public_bytes(), vec![]);
        block.sign(&net.leader_kp);

        v1.engine
            .process(ConsensusInput::Proposal { block })
            .await;
        assert!(drain_outputs(&mut v1).is_empty());
    }

    #[tokio::test]
    async fn sentry_commits_without_acking() {
        let net = make_net(2);
        let mut leader = make_node(&net, Role::Leader, net.leader_kp.clone());
        let sentry_kp = NodeKeypair::generate();
        let mut sentry = make_node(&net, Role::Sentry, sentry_kp);

        leader.engine.try_propose().await;
        let block = match drain_outputs(&mut leader).pop().unwrap() {
            ConsensusOutput::AnnounceProposal { block } => block,
            other => panic!("unexpected {:?}", other),
        };

        sentry
            .engine
            .process(ConsensusInput::Proposal {
                block: block.clone(),
            })
            .await;
        // a sentry relays the proposal but never votes
        let outputs = drain_outputs(&mut sentry);
        assert!(outputs
            .iter()
            .all(|o| !matches!(o, ConsensusOutput::BroadcastAck(_))));

        let app_hash = compute_app_hash(&[0u8; 32], &[]);
        sentry
            .engine
            .process(ConsensusInput::Commit {
                block,
                app_hash,
            })
            .await;
        assert_eq!(sentry.store.best().0, 1);
    }

    #[tokio::test]
    async fn commit_with_wrong_app_hash_dropped() {
        let net = make_net(2);
        let sentry_kp = NodeKeypair::generate();
        let mut sentry = make_node(&net, Role::Sentry, sentry_kp);

        let mut block = Block::build(1, [0u8; 32], [0u8; 32], now_ms(), net.leader_kp.public_bytes(), vec![]);
        block.sign(&net.leader_kp);

        sentry
            .engine
            .process(ConsensusInput::Commit {
                block,
                app_hash: [0xAB; 32],
            })
            .await;
        assert_eq!(sentry.store.best().0, 0);
    }

    #[tokio::test]
    async fn reset_drops_round_state() {
        let net = make_net(2);
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());

        let mut block = Block::build(1, [0u8; 32], [0u8; 32], now_ms(), net.leader_kp.public_bytes(), vec![]);
        block.sign(&net.leader_kp);
        v1.engine
            .process(ConsensusInput::Proposal { block })
            .await;
        assert_eq!(v1.engine.phase(), Phase::AwaitingCommit);
        drain_outputs(&mut v1);

        v1.engine
            .process(ConsensusInput::Reset {
                height: 1,
                reason: "stuck".into(),
            })
            .await;
        assert_eq!(v1.engine.phase(), Phase::AwaitingProposal);
        assert_eq!(v1.engine.height(), 1);
        assert_eq!(v1.store.best().0, 0);
    }

    #[tokio::test]
    async fn broken_merkle_root_produces_nack() {
        let net = make_net(2);
        let mut v1 = make_node(&net, Role::Validator, net.validator_kps[0].clone());

        let sender = NodeKeypair::generate();
        let mut block = Block::build(
            1,
            [0u8; 32],
            [0u8; 32],
            now_ms(),
            net.leader_kp.public_bytes(),
            vec![make_tx(&sender, 1)],
        );
        // corrupt the transaction set after the root was committed
        block.txns.clear();
        block.sign(&net.leader_kp);

        v1.engine
            .process(ConsensusInput::Proposal {
                block: block.clone(),
            })
            .await;
        let nack = drain_outputs(&mut v1)
            .into_iter()
            .find_map(|o| match o {
                ConsensusOutput::BroadcastAck(ack) => Some(ack),
                _ => None,
            })
            .expect("merkle mismatch must answer with a vote");
        assert!(!nack.ack);
        assert_eq!(nack.block_hash, block.hash());
        assert_eq!(v1.store.best().0, 0);
    }

    #[tokio::test]
    async fn nack_quorum_resets_leader_round() {
        let net = make_net(2);
        let mut leader = make_node(&net, Role::Leader, net.leader_kp.clone());

        leader.engine.try_propose().await;
        let block = match drain_outputs(&mut leader).pop().unwrap() {
            ConsensusOutput::AnnounceProposal { block } => block,
            other => panic!("unexpected {:?}", other),
        };

        for kp in &net.validator_kps {
            let sign_bytes = AckPayload::sign_bytes(CHAIN, 1, &block.hash(), &[0u8; 32], false);
            leader
                .engine
                .process(ConsensusInput::Ack(AckPayload {
                    height: 1,
                    block_hash: block.hash(),
                    app_hash: [0u8; 32],
                    ack: false,
                    validator: kp.public_bytes(),
                    signature: kp.sign(&sign_bytes),
                }))
                .await;
        }

        assert_eq!(leader.engine.phase(), Phase::AwaitingProposal);
        assert_eq!(leader.store.best().0, 0);
        let outputs = drain_outputs(&mut leader);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, ConsensusOutput::BroadcastReset(_))));
    }

    #[tokio::test]
    async fn app_hash_deterministic() {
        let results = vec![
            TxResult::ok(5, "a".into(), vec![]),
            TxResult::err(crate::chain::tx_code::ENGINE_ERROR, "b"),
        ];
        let a = compute_app_hash(&[1u8; 32], &results);
        let b = compute_app_hash(&[1u8; 32], &results);
        assert_eq!(a, b);
        let c = compute_app_hash(&[2u8; 32], &results);
        assert_ne!(a, c);
    }
}
