//! Transaction application pipeline.
//!
//! For each transaction in a block: recover the sender through its named
//! authenticator, verify the chain-bound signature, enforce the strict
//! nonce, price the payload, then atomically debit the fee, bump the
//! nonce, and dispatch into the engine. Engine failures become a nonzero
//! `TxResult` code while the spend stands, so fees pay for failed work.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::chain::{tx_code, Account, Payload, Transaction, TxResult, Validator};
use crate::crypto::{AuthError, AuthRegistry};
use crate::engine::{AccountStore, EngineError, ExecutionEngine, Pricer};
use crate::voting::{resolution_id, Resolution, ResolutionKind, ResolutionStatus, VoteStore};
use crate::Hash;

/// Errors surfaced to submitters at admission time.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxAppError {
    #[error("wrong chain id: {0}")]
    WrongChain(String),
    #[error(transparent)]
    InvalidSignature(#[from] AuthError),
}

/// Execution context of the enclosing block.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub height: i64,
    pub timestamp: u64,
    pub proposer: Vec<u8>,
}

/// The application pipeline. Shared by the mempool admission path and the
/// consensus replay path.
pub struct TxApp {
    chain_id: String,
    auth: AuthRegistry,
    pricer: Pricer,
    accounts: Arc<dyn AccountStore>,
    engine: Arc<dyn ExecutionEngine>,
    resolutions: RwLock<VoteStore>,
    validators: Arc<RwLock<HashMap<String, Validator>>>,
    join_expiry_blocks: i64,
}

impl TxApp {
    pub fn new(
        chain_id: String,
        pricer: Pricer,
        accounts: Arc<dyn AccountStore>,
        engine: Arc<dyn ExecutionEngine>,
        validators: Arc<RwLock<HashMap<String, Validator>>>,
        threshold: crate::voting::Threshold,
        join_expiry_blocks: i64,
    ) -> Self {
        TxApp {
            chain_id,
            auth: AuthRegistry::with_defaults(),
            pricer,
            accounts,
            engine,
            resolutions: RwLock::new(VoteStore::new(threshold)),
            validators,
            join_expiry_blocks,
        }
    }

    /// Verify chain id and signature; returns the sender's account
    /// identifier. This runs at mempool admission and again on replay.
    pub fn verify(&self, tx: &Transaction) -> Result<String, TxAppError> {
        if tx.body.chain_id != self.chain_id {
            return Err(TxAppError::WrongChain(tx.body.chain_id.clone()));
        }
        let auth = self.auth.get(&tx.signature.sig_type)?;
        auth.verify(
            &tx.sender,
            &Transaction::sign_bytes(&tx.body),
            &tx.signature.sig,
        )?;
        Ok(auth.identifier(&tx.sender)?)
    }

    pub fn account(&self, identifier: &str) -> Option<Account> {
        self.accounts.get(identifier)
    }

    pub fn price(&self, tx: &Transaction) -> u128 {
        self.pricer.price(&tx.body.payload)
    }

    /// Apply one transaction. Never fails the caller; every outcome is a
    /// `TxResult`.
    pub fn execute(&self, tx: &Transaction, ctx: &BlockContext) -> TxResult {
        let identifier = match self.verify(tx) {
            Ok(identifier) => identifier,
            Err(TxAppError::WrongChain(chain)) => {
                return TxResult::err(tx_code::WRONG_CHAIN, format!("chain id {}", chain));
            }
            Err(TxAppError::InvalidSignature(e)) => {
                return TxResult::err(tx_code::INVALID_SIGNATURE, e.to_string());
            }
        };

        let account = self
            .accounts
            .get(&identifier)
            .unwrap_or_else(|| Account::new(identifier.clone()));
        if tx.body.nonce != account.nonce + 1 {
            return TxResult::err(
                tx_code::WRONG_NONCE,
                format!("nonce {}, account nonce {}", tx.body.nonce, account.nonce),
            );
        }

        let price = self.pricer.price(&tx.body.payload);
        if tx.body.fee < price {
            return TxResult::err(
                tx_code::INSUFFICIENT_FEE,
                format!("fee {} below price {}", tx.body.fee, price),
            );
        }

        // Debit and bump first; the spend stands whether or not the
        // dispatch below succeeds.
        if let Err(e) = self
            .accounts
            .spend_and_increment(&identifier, price, tx.body.nonce)
        {
            return TxResult::err(tx_code::INSUFFICIENT_BALANCE, e.to_string());
        }

        match self.dispatch(tx, &identifier, ctx) {
            Ok(mut result) => {
                result.gas_used = result.gas_used.max(price as i64);
                result
            }
            Err(e) => {
                let mut result = TxResult::err(tx_code::ENGINE_ERROR, e.to_string());
                result.gas_used = price as i64;
                result
            }
        }
    }

    /// The single dispatch site over payload kinds for execution.
    fn dispatch(
        &self,
        tx: &Transaction,
        identifier: &str,
        ctx: &BlockContext,
    ) -> Result<TxResult, EngineError> {
        match &tx.body.payload {
            Payload::DeploySchema { name, schema } => {
                let resp = self.engine.create_dataset(identifier, name, schema)?;
                Ok(TxResult::ok(resp.gas_used, resp.log, resp.events))
            }
            Payload::DropSchema { dbid } => {
                let resp = self.engine.drop_dataset(identifier, dbid)?;
                Ok(TxResult::ok(resp.gas_used, resp.log, resp.events))
            }
            Payload::ActionExecution { dbid, action, args } => {
                let resp = self.engine.execute(dbid, action, args, identifier)?;
                Ok(TxResult::ok(resp.gas_used, resp.log, resp.events))
            }
            Payload::ActionCall { dbid, action, args } => {
                let resp = self
                    .engine
                    .execute(dbid, action, std::slice::from_ref(args), identifier)?;
                Ok(TxResult::ok(resp.gas_used, resp.log, resp.events))
            }
            Payload::ValidatorJoin { power } => {
                let id = self
                    .resolutions
                    .write()
                    .expect("resolutions lock poisoned")
                    .create(
                        ResolutionKind::ValidatorJoin {
                            candidate: tx.sender.clone(),
                            power: *power,
                        },
                        identifier.to_string(),
                        self.board(),
                        ctx.height,
                        self.join_expiry_blocks,
                    )
                    .map_err(|e| EngineError::Execution(e.to_string()))?;
                Ok(TxResult::ok(
                    0,
                    "join requested".into(),
                    vec![format!("join_requested:{}", hex::encode(id))],
                ))
            }
            Payload::ValidatorApprove { candidate } => {
                let id = self
                    .resolutions
                    .read()
                    .expect("resolutions lock poisoned")
                    .find_join(candidate)
                    .ok_or_else(|| EngineError::Execution("no pending join".into()))?;
                self.approve_resolution(&id, identifier)
            }
            Payload::ValidatorLeave => {
                let removed = self
                    .validators
                    .write()
                    .expect("validators lock poisoned")
                    .remove(identifier);
                match removed {
                    Some(_) => Ok(TxResult::ok(
                        0,
                        "left validator set".into(),
                        vec![format!("validator_left:{}", identifier)],
                    )),
                    None => Err(EngineError::Execution("not a validator".into())),
                }
            }
            Payload::ValidatorRemove { target } => {
                let id = {
                    let mut resolutions =
                        self.resolutions.write().expect("resolutions lock poisoned");
                    match resolutions.find_removal(target) {
                        Some(id) => id,
                        None => resolutions
                            .create(
                                ResolutionKind::ValidatorRemove {
                                    target: target.clone(),
                                },
                                identifier.to_string(),
                                self.board(),
                                ctx.height,
                                self.join_expiry_blocks,
                            )
                            .map_err(|e| EngineError::Execution(e.to_string()))?,
                    }
                };
                self.approve_resolution(&id, identifier)
            }
            Payload::CreateResolution { body } => {
                let id = self
                    .resolutions
                    .write()
                    .expect("resolutions lock poisoned")
                    .create(
                        ResolutionKind::Generic { body: body.clone() },
                        identifier.to_string(),
                        self.board(),
                        ctx.height,
                        self.join_expiry_blocks,
                    )
                    .map_err(|e| EngineError::Execution(e.to_string()))?;
                Ok(TxResult::ok(
                    0,
                    "resolution created".into(),
                    vec![format!("resolution_created:{}", hex::encode(id))],
                ))
            }
            Payload::ApproveResolution { resolution_id } => {
                self.approve_resolution(resolution_id, identifier)
            }
            Payload::Transfer { to, amount } => {
                self.accounts.debit(identifier, *amount)?;
                self.accounts.credit(to, *amount);
                Ok(TxResult::ok(
                    0,
                    format!("transferred {} to {}", amount, to),
                    vec![],
                ))
            }
        }
    }

    /// Record an approval; when the threshold is crossed, apply the
    /// resolution's effect to the validator set.
    fn approve_resolution(&self, id: &Hash, voter: &str) -> Result<TxResult, EngineError> {
        let concluded = self
            .resolutions
            .write()
            .expect("resolutions lock poisoned")
            .approve(id, voter)
            .map_err(|e| EngineError::Execution(e.to_string()))?;
        match concluded {
            Some(resolution) => {
                let events = self.apply_resolution(&resolution);
                Ok(TxResult::ok(0, "resolution approved".into(), events))
            }
            None => Ok(TxResult::ok(0, "approval recorded".into(), vec![])),
        }
    }

    fn apply_resolution(&self, resolution: &Resolution) -> Vec<String> {
        match &resolution.kind {
            ResolutionKind::ValidatorJoin { candidate, power } => {
                let identifier = hex::encode(candidate);
                self.validators
                    .write()
                    .expect("validators lock poisoned")
                    .insert(
                        identifier.clone(),
                        Validator {
                            pubkey: candidate.clone(),
                            power: *power,
                        },
                    );
                tracing::info!(validator = %identifier, "Validator joined");
                vec![format!("validator_joined:{}", identifier)]
            }
            ResolutionKind::ValidatorRemove { target } => {
                let identifier = hex::encode(target);
                self.validators
                    .write()
                    .expect("validators lock poisoned")
                    .remove(&identifier);
                tracing::info!(validator = %identifier, "Validator removed");
                vec![format!("validator_removed:{}", identifier)]
            }
            ResolutionKind::Generic { .. } => {
                vec![format!("resolution_approved:{}", hex::encode(resolution.id))]
            }
        }
    }

    /// Open a staging window over accounts and engine state. Consensus
    /// replays a proposal inside it, then commits or rolls back.
    pub fn checkpoint(&self) {
        self.accounts.checkpoint();
        self.engine.checkpoint();
    }

    pub fn commit_staged(&self) {
        self.accounts.commit();
        self.engine.commit();
    }

    pub fn rollback_staged(&self) {
        self.accounts.rollback();
        self.engine.rollback();
    }

    /// End-of-block housekeeping: expire overdue resolutions.
    pub fn end_block(&self, height: i64) {
        let expired = self
            .resolutions
            .write()
            .expect("resolutions lock poisoned")
            .expire(height);
        for resolution in expired {
            tracing::info!(
                id = %hex::encode(resolution.id),
                "Resolution expired"
            );
        }
    }

    /// Current validator identifiers, the board for new resolutions.
    fn board(&self) -> Vec<String> {
        self.validators
            .read()
            .expect("validators lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn pending_joins(&self) -> Vec<Resolution> {
        self.resolutions
            .read()
            .expect("resolutions lock poisoned")
            .pending_joins()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn resolution_status(&self, id: &Hash, height: i64) -> Option<ResolutionStatus> {
        self.resolutions
            .read()
            .expect("resolutions lock poisoned")
            .status(id, height)
    }

    /// Derive the resolution id a `CreateResolution` payload would get,
    /// for clients that want to approve it later.
    pub fn generic_resolution_id(&self, body: &[u8], proposer: &str) -> Hash {
        resolution_id(
            &ResolutionKind::Generic {
                body: body.to_vec(),
            },
            proposer,
        )
    }
}
