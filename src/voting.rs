//! Voteable resolutions: validator joins, removals, and generic proposals.
//!
//! A resolution collects approvals from a board (the validator set at
//! creation time) until it crosses the configured threshold or its
//! expiration height passes. At most one pending join per candidate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Hash;

/// Default number of blocks a join request stays votable.
pub const DEFAULT_JOIN_EXPIRY_BLOCKS: i64 = 14_400;

#[derive(Clone, Debug, thiserror::Error)]
pub enum VoteError {
    #[error("resolution not found")]
    NotFound,
    #[error("voter not on the board")]
    NotOnBoard,
    #[error("resolution already concluded")]
    Concluded,
    #[error("duplicate pending resolution")]
    Duplicate,
}

/// What a resolution is deciding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolutionKind {
    /// Admit `candidate` with `power` into the validator set.
    ValidatorJoin { candidate: Vec<u8>, power: i64 },
    /// Remove `target` from the validator set.
    ValidatorRemove { target: Vec<u8> },
    /// Free-form payload interpreted by the application layer.
    Generic { body: Vec<u8> },
}

/// Lifecycle state reported for a resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolutionStatus {
    Pending { approvals: usize, needed: usize },
    Approved,
    Expired,
}

/// A pending resolution with its approval board.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resolution {
    pub id: Hash,
    pub kind: ResolutionKind,
    pub proposer: String,
    pub created_at: i64,
    pub expires_at: i64,
    /// Identifiers (hex pubkeys) eligible to vote, frozen at creation.
    pub board: Vec<String>,
    /// voter identifier -> approved
    pub approvals: HashMap<String, bool>,
}

impl Resolution {
    fn approval_count(&self) -> usize {
        self.approvals.values().filter(|v| **v).count()
    }
}

/// Approval threshold as a fraction of the board, default 2/3.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Threshold {
    pub num: u32,
    pub den: u32,
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold { num: 2, den: 3 }
    }
}

impl Threshold {
    /// Votes needed for a board of `board_len`: smallest n with
    /// `n * den >= board_len * num`.
    pub fn needed(&self, board_len: usize) -> usize {
        let num = self.num as usize;
        let den = self.den as usize;
        board_len * num / den + usize::from((board_len * num) % den != 0)
    }
}

/// The set of live resolutions.
#[derive(Clone, Debug, Default)]
pub struct VoteStore {
    pending: HashMap<Hash, Resolution>,
    threshold: Threshold,
}

/// Derive a resolution id. Validator membership resolutions are keyed by
/// their subject alone so votes from different validators aggregate on
/// one resolution; generic resolutions are proposer-scoped.
pub fn resolution_id(kind: &ResolutionKind, proposer: &str) -> Hash {
    let body = crate::serialize(kind).expect("resolution encoding cannot fail");
    match kind {
        ResolutionKind::ValidatorJoin { .. } | ResolutionKind::ValidatorRemove { .. } => {
            crate::hash_concat(&[b"kwil.resolution", &body])
        }
        ResolutionKind::Generic { .. } => {
            crate::hash_concat(&[b"kwil.resolution", &body, proposer.as_bytes()])
        }
    }
}

impl VoteStore {
    pub fn new(threshold: Threshold) -> Self {
        VoteStore {
            pending: HashMap::new(),
            threshold,
        }
    }

    /// Open a resolution. `board` is the current validator identifier set.
    pub fn create(
        &mut self,
        kind: ResolutionKind,
        proposer: String,
        board: Vec<String>,
        height: i64,
        expiry_blocks: i64,
    ) -> Result<Hash, VoteError> {
        let id = resolution_id(&kind, &proposer);
        if self.pending.contains_key(&id) {
            return Err(VoteError::Duplicate);
        }
        // one pending join per candidate
        if let ResolutionKind::ValidatorJoin { candidate, .. } = &kind {
            let exists = self.pending.values().any(|r| {
                matches!(&r.kind, ResolutionKind::ValidatorJoin { candidate: c, .. } if c == candidate)
            });
            if exists {
                return Err(VoteError::Duplicate);
            }
        }
        self.pending.insert(
            id,
            Resolution {
                id,
                kind,
                proposer,
                created_at: height,
                expires_at: height + expiry_blocks,
                board,
                approvals: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Record an approval. Returns the resolution when it just crossed the
    /// threshold; the caller applies its effect and it leaves the store.
    pub fn approve(&mut self, id: &Hash, voter: &str) -> Result<Option<Resolution>, VoteError> {
        let resolution = self.pending.get_mut(id).ok_or(VoteError::NotFound)?;
        if !resolution.board.iter().any(|b| b == voter) {
            return Err(VoteError::NotOnBoard);
        }
        resolution.approvals.insert(voter.to_string(), true);
        let needed = self.threshold.needed(resolution.board.len());
        if resolution.approval_count() >= needed {
            return Ok(self.pending.remove(id));
        }
        Ok(None)
    }

    /// Drop resolutions whose expiration height has passed; returns them.
    pub fn expire(&mut self, height: i64) -> Vec<Resolution> {
        let expired: Vec<Hash> = self
            .pending
            .values()
            .filter(|r| height > r.expires_at)
            .map(|r| r.id)
            .collect();
        expired
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect()
    }

    /// Status of a resolution at the given chain height.
    pub fn status(&self, id: &Hash, height: i64) -> Option<ResolutionStatus> {
        let resolution = self.pending.get(id)?;
        if height > resolution.expires_at {
            return Some(ResolutionStatus::Expired);
        }
        Some(ResolutionStatus::Pending {
            approvals: resolution.approval_count(),
            needed: self.threshold.needed(resolution.board.len()),
        })
    }

    /// All pending validator join requests, for the admin surface.
    pub fn pending_joins(&self) -> Vec<&Resolution> {
        self.pending
            .values()
            .filter(|r| matches!(r.kind, ResolutionKind::ValidatorJoin { .. }))
            .collect()
    }

    /// Find the pending join resolution for a candidate, if any.
    pub fn find_join(&self, candidate: &[u8]) -> Option<Hash> {
        self.pending
            .values()
            .find(|r| {
                matches!(&r.kind, ResolutionKind::ValidatorJoin { candidate: c, .. } if c == candidate)
            })
            .map(|r| r.id)
    }

    /// Find the pending removal resolution for a target, if any.
    pub fn find_removal(&self, target: &[u8]) -> Option<Hash> {
        self.pending
            .values()
            .find(|r| {
                matches!(&r.kind, ResolutionKind::ValidatorRemove { target: t } if t == target)
            })
            .map(|r| r.id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("v{}", i)).collect()
    }

    fn join_kind(seed: u8) -> ResolutionKind {
        ResolutionKind::ValidatorJoin {
            candidate: vec![seed; 32],
            power: 1,
        }
    }

    #[test]
    fn threshold_two_thirds() {
        let t = Threshold::default();
        assert_eq!(t.needed(3), 2);
        assert_eq!(t.needed(4), 3);
        assert_eq!(t.needed(6), 4);
        assert_eq!(t.needed(7), 5);
    }

    #[test]
    fn approval_crosses_threshold() {
        let mut store = VoteStore::new(Threshold::default());
        let id = store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();

        assert!(store.approve(&id, "v0").unwrap().is_none());
        let approved = store.approve(&id, "v1").unwrap();
        assert!(approved.is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn non_board_voter_rejected() {
        let mut store = VoteStore::new(Threshold::default());
        let id = store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();
        assert!(matches!(
            store.approve(&id, "stranger"),
            Err(VoteError::NotOnBoard)
        ));
    }

    #[test]
    fn duplicate_approval_counted_once() {
        let mut store = VoteStore::new(Threshold::default());
        let id = store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();
        store.approve(&id, "v0").unwrap();
        assert!(store.approve(&id, "v0").unwrap().is_none());
        match store.status(&id, 10).unwrap() {
            ResolutionStatus::Pending { approvals, needed } => {
                assert_eq!(approvals, 1);
                assert_eq!(needed, 2);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn duplicate_join_rejected() {
        let mut store = VoteStore::new(Threshold::default());
        store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();
        // same candidate from a different proposer still collides
        assert!(matches!(
            store.create(join_kind(1), "v1".into(), board(3), 10, 100),
            Err(VoteError::Duplicate)
        ));
    }

    #[test]
    fn expiry_removes_resolution() {
        let mut store = VoteStore::new(Threshold::default());
        let id = store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();
        assert_eq!(
            store.status(&id, 111).unwrap(),
            ResolutionStatus::Expired
        );
        assert!(store.expire(110).is_empty()); // boundary: expires_at == 110
        let expired = store.expire(111);
        assert_eq!(expired.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn pending_joins_filtered() {
        let mut store = VoteStore::new(Threshold::default());
        store
            .create(join_kind(1), "v0".into(), board(3), 10, 100)
            .unwrap();
        store
            .create(
                ResolutionKind::Generic { body: vec![1, 2] },
                "v0".into(),
                board(3),
                10,
                100,
            )
            .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.pending_joins().len(), 1);
    }
}
