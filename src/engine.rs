//! Execution engine and account store seams.
//!
//! The SQL engine proper is an external collaborator; the node consumes it
//! through the `ExecutionEngine` trait (create/drop dataset, execute). The
//! in-memory `DatasetEngine` and `MemAccountStore` here make the node
//! runnable and testable without the real engine, the same way the
//! original ships a memory-backed store for tests.
//!
//! Both seams support a single level of staging: `checkpoint` snapshots
//! current state, after which `commit` discards the snapshot and
//! `rollback` restores it. Consensus replays proposals inside such a
//! staging window.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::chain::{Account, Payload};

/// Errors from the execution engine and account store.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),
    #[error("dataset already exists: {0}")]
    DatasetExists(String),
    #[error("not the dataset owner")]
    NotOwner,
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u128, need: u128 },
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Outcome of an engine call for one transaction.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResponse {
    pub gas_used: i64,
    pub log: String,
    pub events: Vec<String>,
}

/// The downstream execution engine consumed by the application pipeline.
pub trait ExecutionEngine: Send + Sync {
    /// Deploy a schema; returns the new dataset's DBID.
    fn create_dataset(
        &self,
        owner: &str,
        name: &str,
        schema: &[u8],
    ) -> Result<ExecutionResponse, EngineError>;

    fn drop_dataset(&self, owner: &str, dbid: &str) -> Result<ExecutionResponse, EngineError>;

    fn execute(
        &self,
        dbid: &str,
        action: &str,
        args: &[Vec<String>],
        caller: &str,
    ) -> Result<ExecutionResponse, EngineError>;

    fn checkpoint(&self);
    fn commit(&self);
    fn rollback(&self);
}

/// Derive a dataset identifier from its owner and name.
pub fn dbid(owner: &str, name: &str) -> String {
    let digest = crate::hash_concat(&[owner.as_bytes(), name.as_bytes()]);
    hex::encode(&digest[..16])
}

#[derive(Clone, Debug)]
struct Dataset {
    owner: String,
    name: String,
    #[allow(dead_code)]
    schema: Vec<u8>,
}

/// In-memory dataset engine.
pub struct DatasetEngine {
    datasets: RwLock<HashMap<String, Dataset>>,
    staged: RwLock<Option<HashMap<String, Dataset>>>,
}

impl DatasetEngine {
    pub fn new() -> Self {
        DatasetEngine {
            datasets: RwLock::new(HashMap::new()),
            staged: RwLock::new(None),
        }
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.read().expect("engine lock poisoned").len()
    }
}

impl Default for DatasetEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine for DatasetEngine {
    fn create_dataset(
        &self,
        owner: &str,
        name: &str,
        schema: &[u8],
    ) -> Result<ExecutionResponse, EngineError> {
        let id = dbid(owner, name);
        let mut datasets = self.datasets.write().expect("engine lock poisoned");
        if datasets.contains_key(&id) {
            return Err(EngineError::DatasetExists(id));
        }
        datasets.insert(
            id.clone(),
            Dataset {
                owner: owner.to_string(),
                name: name.to_string(),
                schema: schema.to_vec(),
            },
        );
        Ok(ExecutionResponse {
            gas_used: 10 + schema.len() as i64 / 100,
            log: format!("deployed {}", id),
            events: vec![format!("dataset_created:{}", id)],
        })
    }

    fn drop_dataset(&self, owner: &str, dbid: &str) -> Result<ExecutionResponse, EngineError> {
        let mut datasets = self.datasets.write().expect("engine lock poisoned");
        let ds = datasets
            .get(dbid)
            .ok_or_else(|| EngineError::DatasetNotFound(dbid.to_string()))?;
        if ds.owner != owner {
            return Err(EngineError::NotOwner);
        }
        datasets.remove(dbid);
        Ok(ExecutionResponse {
            gas_used: 5,
            log: format!("dropped {}", dbid),
            events: vec![format!("dataset_dropped:{}", dbid)],
        })
    }

    fn execute(
        &self,
        dbid: &str,
        action: &str,
        args: &[Vec<String>],
        caller: &str,
    ) -> Result<ExecutionResponse, EngineError> {
        let datasets = self.datasets.read().expect("engine lock poisoned");
        let ds = datasets
            .get(dbid)
            .ok_or_else(|| EngineError::DatasetNotFound(dbid.to_string()))?;
        Ok(ExecutionResponse {
            gas_used: 2 + args.len() as i64,
            log: format!("{}.{} by {} ({} batches)", ds.name, action, caller, args.len()),
            events: vec![],
        })
    }

    fn checkpoint(&self) {
        let datasets = self.datasets.read().expect("engine lock poisoned");
        *self.staged.write().expect("engine lock poisoned") = Some(datasets.clone());
    }

    fn commit(&self) {
        *self.staged.write().expect("engine lock poisoned") = None;
    }

    fn rollback(&self) {
        if let Some(saved) = self.staged.write().expect("engine lock poisoned").take() {
            *self.datasets.write().expect("engine lock poisoned") = saved;
        }
    }
}

/// Read/write view over accounts, with the same staging discipline as the
/// engine.
pub trait AccountStore: Send + Sync {
    fn get(&self, identifier: &str) -> Option<Account>;

    /// Debit `amount` and advance the nonce to `nonce`. Creates the account
    /// when it does not exist and `amount` is zero (gasless networks).
    fn spend_and_increment(
        &self,
        identifier: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<(), EngineError>;

    /// Debit `amount` without touching the nonce (transfers).
    fn debit(&self, identifier: &str, amount: u128) -> Result<(), EngineError>;

    fn credit(&self, identifier: &str, amount: u128);

    fn checkpoint(&self);
    fn commit(&self);
    fn rollback(&self);
}

/// In-memory account store.
pub struct MemAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
    staged: RwLock<Option<HashMap<String, Account>>>,
}

impl MemAccountStore {
    pub fn new() -> Self {
        MemAccountStore {
            accounts: RwLock::new(HashMap::new()),
            staged: RwLock::new(None),
        }
    }

    /// Seed an account, for genesis allocations and tests.
    pub fn seed(&self, account: Account) {
        self.accounts
            .write()
            .expect("account lock poisoned")
            .insert(account.identifier.clone(), account);
    }
}

impl Default for MemAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemAccountStore {
    fn get(&self, identifier: &str) -> Option<Account> {
        self.accounts
            .read()
            .expect("account lock poisoned")
            .get(identifier)
            .cloned()
    }

    fn spend_and_increment(
        &self,
        identifier: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<(), EngineError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .entry(identifier.to_string())
            .or_insert_with(|| Account::new(identifier.to_string()));
        if account.balance < amount {
            return Err(EngineError::InsufficientBalance {
                have: account.balance,
                need: amount,
            });
        }
        account.balance -= amount;
        account.nonce = nonce;
        Ok(())
    }

    fn debit(&self, identifier: &str, amount: u128) -> Result<(), EngineError> {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .get_mut(identifier)
            .ok_or_else(|| EngineError::AccountNotFound(identifier.to_string()))?;
        if account.balance < amount {
            return Err(EngineError::InsufficientBalance {
                have: account.balance,
                need: amount,
            });
        }
        account.balance -= amount;
        Ok(())
    }

    fn credit(&self, identifier: &str, amount: u128) {
        let mut accounts = self.accounts.write().expect("account lock poisoned");
        let account = accounts
            .entry(identifier.to_string())
            .or_insert_with(|| Account::new(identifier.to_string()));
        account.balance = account.balance.saturating_add(amount);
    }

    fn checkpoint(&self) {
        let accounts = self.accounts.read().expect("account lock poisoned");
        *self.staged.write().expect("account lock poisoned") = Some(accounts.clone());
    }

    fn commit(&self) {
        *self.staged.write().expect("account lock poisoned") = None;
    }

    fn rollback(&self) {
        if let Some(saved) = self.staged.write().expect("account lock poisoned").take() {
            *self.accounts.write().expect("account lock poisoned") = saved;
        }
    }
}

/// Deterministic payload pricing. With gas disabled everything is free.
#[derive(Clone, Copy, Debug)]
pub struct Pricer {
    pub gas_enabled: bool,
}

impl Pricer {
    pub fn new(gas_enabled: bool) -> Self {
        Pricer { gas_enabled }
    }

    /// Price a payload. The single dispatch site over payload kinds for
    /// pricing.
    pub fn price(&self, payload: &Payload) -> u128 {
        if !self.gas_enabled {
            return 0;
        }
        match payload {
            Payload::DeploySchema { schema, .. } => 1_000 + schema.len() as u128,
            Payload::DropSchema { .. } => 100,
            Payload::ActionExecution { args, .. } => 50 + 10 * args.len() as u128,
            Payload::ActionCall { .. } => 10,
            Payload::ValidatorJoin { .. } => 10_000,
            Payload::ValidatorLeave => 10_000,
            Payload::ValidatorApprove { .. } => 10_000,
            Payload::ValidatorRemove { .. } => 10_000,
            Payload::CreateResolution { body } => 500 + body.len() as u128,
            Payload::ApproveResolution { .. } => 500,
            Payload::Transfer { .. } => 21,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbid_deterministic() {
        assert_eq!(dbid("alice", "db"), dbid("alice", "db"));
        assert_ne!(dbid("alice", "db"), dbid("bob", "db"));
    }

    #[test]
    fn create_execute_drop_dataset() {
        let engine = DatasetEngine::new();
        let resp = engine.create_dataset("alice", "mydb", b"schema").unwrap();
        assert!(resp.log.contains("deployed"));
        let id = dbid("alice", "mydb");

        let resp = engine
            .execute(&id, "insert_row", &[vec!["1".into()]], "alice")
            .unwrap();
        assert!(resp.gas_used > 0);

        assert!(matches!(
            engine.drop_dataset("mallory", &id),
            Err(EngineError::NotOwner)
        ));
        engine.drop_dataset("alice", &id).unwrap();
        assert!(matches!(
            engine.execute(&id, "insert_row", &[], "alice"),
            Err(EngineError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn duplicate_dataset_rejected() {
        let engine = DatasetEngine::new();
        engine.create_dataset("alice", "mydb", b"s").unwrap();
        assert!(matches!(
            engine.create_dataset("alice", "mydb", b"s"),
            Err(EngineError::DatasetExists(_))
        ));
    }

    #[test]
    fn engine_staging_rollback() {
        let engine = DatasetEngine::new();
        engine.create_dataset("alice", "keep", b"s").unwrap();
        engine.checkpoint();
        engine.create_dataset("alice", "discard", b"s").unwrap();
        assert_eq!(engine.dataset_count(), 2);
        engine.rollback();
        assert_eq!(engine.dataset_count(), 1);
    }

    #[test]
    fn engine_staging_commit() {
        let engine = DatasetEngine::new();
        engine.checkpoint();
        engine.create_dataset("alice", "kept", b"s").unwrap();
        engine.commit();
        engine.rollback(); // no snapshot left, must be a no-op
        assert_eq!(engine.dataset_count(), 1);
    }

    #[test]
    fn account_spend_and_increment() {
        let store = MemAccountStore::new();
        store.seed(Account {
            identifier: "alice".into(),
            balance: 100,
            nonce: 0,
        });
        store.spend_and_increment("alice", 30, 1).unwrap();
        let acct = store.get("alice").unwrap();
        assert_eq!(acct.balance, 70);
        assert_eq!(acct.nonce, 1);

        assert!(matches!(
            store.spend_and_increment("alice", 1_000, 2),
            Err(EngineError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn account_created_on_gasless_spend() {
        let store = MemAccountStore::new();
        store.spend_and_increment("newbie", 0, 1).unwrap();
        assert_eq!(store.get("newbie").unwrap().nonce, 1);
    }

    #[test]
    fn account_staging_rollback() {
        let store = MemAccountStore::new();
        store.seed(Account {
            identifier: "alice".into(),
            balance: 100,
            nonce: 0,
        });
        store.checkpoint();
        store.spend_and_increment("alice", 60, 1).unwrap();
        store.rollback();
        let acct = store.get("alice").unwrap();
        assert_eq!(acct.balance, 100);
        assert_eq!(acct.nonce, 0);
    }

    #[test]
    fn pricer_gas_disabled_is_free() {
        let pricer = Pricer::new(false);
        assert_eq!(
            pricer.price(&Payload::Transfer {
                to: "x".into(),
                amount: 1
            }),
            0
        );
    }

    #[test]
    fn pricer_covers_every_kind() {
        let pricer = Pricer::new(true);
        let payloads = vec![
            Payload::DeploySchema {
                name: "db".into(),
                schema: vec![0; 10],
            },
            Payload::DropSchema { dbid: "x".into() },
            Payload::ActionExecution {
                dbid: "x".into(),
                action: "a".into(),
                args: vec![vec![]],
            },
            Payload::ActionCall {
                dbid: "x".into(),
                action: "a".into(),
                args: vec![],
            },
            Payload::ValidatorJoin { power: 1 },
            Payload::ValidatorLeave,
            Payload::ValidatorApprove { candidate: vec![1] },
            Payload::ValidatorRemove { target: vec![1] },
            Payload::CreateResolution { body: vec![1] },
            Payload::ApproveResolution {
                resolution_id: [0u8; 32],
            },
            Payload::Transfer {
                to: "x".into(),
                amount: 1,
            },
        ];
        for p in payloads {
            assert!(pricer.price(&p) > 0, "kind {} priced at zero", p.kind());
        }
    }
}
