//! In-process store used by tests and local runs
//! One write lock covers each commit, so account and holding change together.

use super::{
    Account, BrokerageStore, ExecutionCommit, Holding, HoldingKey, HoldingWrite,
    HoldingsMaintenance, OrderRecord,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    // Write order is kept so scans and "latest record" lookups are stable.
    holdings: Vec<Holding>,
    orders: Vec<OrderRecord>,
    unique_holdings: bool,
}

impl MemoryState {
    fn latest_for(&self, key: &HoldingKey) -> Option<&Holding> {
        self.holdings
            .iter()
            .filter(|h| h.username == key.username && h.instrument == key.instrument)
            .max_by_key(|h| h.updated_at)
    }

    fn position_of(&self, id: Uuid) -> Option<usize> {
        self.holdings.iter().position(|h| h.id == id)
    }

    fn check_version(&self, id: Uuid, expected: i64) -> StoreResult<usize> {
        let idx = self
            .position_of(id)
            .ok_or_else(|| StoreError::Conflict(format!("holding {} no longer exists", id)))?;
        let found = self.holdings[idx].version;
        if found != expected {
            return Err(StoreError::Conflict(format!(
                "holding {} is at version {}, expected {}",
                id, found, expected
            )));
        }
        Ok(idx)
    }
}

enum PlannedWrite {
    Push(Holding),
    Replace(usize, Holding),
    Remove(usize),
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account; account creation belongs to the signup flow.
    pub async fn insert_account(&self, username: &str, balance: Decimal) -> Account {
        let account = Account {
            username: username.to_string(),
            balance,
            version: 0,
        };
        self.state
            .write()
            .await
            .accounts
            .insert(account.username.clone(), account.clone());
        account
    }

    /// Load a holding record as-is, duplicates included, the way legacy data
    /// arrives. Rejected only once the uniqueness constraint is installed.
    pub async fn seed_holding(&self, holding: Holding) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.unique_holdings && state.latest_for(&holding.key()).is_some() {
            return Err(StoreError::Conflict(format!(
                "holding for {} already exists",
                holding.key()
            )));
        }
        state.holdings.push(holding);
        Ok(())
    }

    pub async fn account(&self, username: &str) -> Option<Account> {
        self.state.read().await.accounts.get(username).cloned()
    }

    pub async fn holdings_for(&self, key: &HoldingKey) -> Vec<Holding> {
        self.state
            .read()
            .await
            .holdings
            .iter()
            .filter(|h| h.username == key.username && h.instrument == key.instrument)
            .cloned()
            .collect()
    }

    pub async fn orders(&self) -> Vec<OrderRecord> {
        self.state.read().await.orders.clone()
    }

    pub async fn has_unique_constraint(&self) -> bool {
        self.state.read().await.unique_holdings
    }
}

#[async_trait]
impl BrokerageStore for MemoryStore {
    async fn find_account(&self, username: &str) -> StoreResult<Option<Account>> {
        Ok(self.state.read().await.accounts.get(username).cloned())
    }

    async fn find_holding(&self, key: &HoldingKey) -> StoreResult<Option<Holding>> {
        Ok(self.state.read().await.latest_for(key).cloned())
    }

    async fn list_holdings(&self, username: &str) -> StoreResult<Vec<Holding>> {
        Ok(self
            .state
            .read()
            .await
            .holdings
            .iter()
            .filter(|h| h.username == username)
            .cloned()
            .collect())
    }

    async fn commit_execution(&self, commit: &ExecutionCommit) -> StoreResult<()> {
        let mut state = self.state.write().await;

        // Validate everything first; nothing is written on a conflict.
        let current = state
            .accounts
            .get(&commit.account.username)
            .ok_or_else(|| {
                StoreError::Conflict(format!("account {} no longer exists", commit.account.username))
            })?;
        if current.version != commit.expected_account_version {
            return Err(StoreError::Conflict(format!(
                "account {} is at version {}, expected {}",
                current.username, current.version, commit.expected_account_version
            )));
        }

        let planned = match &commit.holding {
            HoldingWrite::Insert(holding) => {
                if state.latest_for(&holding.key()).is_some() {
                    return Err(StoreError::Conflict(format!(
                        "holding for {} already exists",
                        holding.key()
                    )));
                }
                PlannedWrite::Push(holding.clone())
            }
            HoldingWrite::Update {
                holding,
                expected_version,
            } => PlannedWrite::Replace(
                state.check_version(holding.id, *expected_version)?,
                holding.clone(),
            ),
            HoldingWrite::Delete {
                id,
                expected_version,
            } => PlannedWrite::Remove(state.check_version(*id, *expected_version)?),
        };

        match planned {
            PlannedWrite::Push(holding) => state.holdings.push(holding),
            PlannedWrite::Replace(idx, holding) => state.holdings[idx] = holding,
            PlannedWrite::Remove(idx) => {
                state.holdings.remove(idx);
            }
        }
        state
            .accounts
            .insert(commit.account.username.clone(), commit.account.clone());
        Ok(())
    }

    async fn append_order(&self, record: &OrderRecord) -> StoreResult<()> {
        self.state.write().await.orders.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl HoldingsMaintenance for MemoryStore {
    async fn scan_holdings(&self) -> StoreResult<Vec<Holding>> {
        Ok(self.state.read().await.holdings.clone())
    }

    async fn merge_holdings(
        &self,
        survivor: &Holding,
        expected_survivor_version: i64,
        removed: &[(Uuid, i64)],
    ) -> StoreResult<usize> {
        let mut state = self.state.write().await;

        let survivor_idx = state.check_version(survivor.id, expected_survivor_version)?;
        for (id, version) in removed {
            state.check_version(*id, *version)?;
        }

        state.holdings[survivor_idx] = survivor.clone();
        let doomed: HashSet<Uuid> = removed.iter().map(|(id, _)| *id).collect();
        let before = state.holdings.len();
        state.holdings.retain(|h| !doomed.contains(&h.id));
        Ok(before - state.holdings.len())
    }

    async fn install_unique_constraint(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let mut seen = HashSet::new();
        for holding in &state.holdings {
            if !seen.insert(holding.key()) {
                return Err(StoreError::Conflict(format!(
                    "duplicate holdings remain for {}",
                    holding.key()
                )));
            }
        }
        state.unique_holdings = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn holding(username: &str, instrument: &str, qty: Decimal, version: i64) -> Holding {
        Holding {
            id: Uuid::new_v4(),
            username: username.to_string(),
            instrument: instrument.to_string(),
            quantity: qty,
            average_cost: dec!(10),
            last_price: dec!(10),
            net_change: "+0".into(),
            day_change: "+0".into(),
            version,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_holding_prefers_latest_duplicate() {
        let store = MemoryStore::new();
        let mut older = holding("alice", "AAPL", dec!(1), 0);
        older.updated_at = Utc::now() - Duration::seconds(30);
        let newer = holding("alice", "AAPL", dec!(2), 0);

        store.seed_holding(newer.clone()).await.unwrap();
        store.seed_holding(older).await.unwrap();

        let found = store
            .find_holding(&HoldingKey::new("alice", "AAPL"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_holding_without_touching_account() {
        let store = MemoryStore::new();
        let account = store.insert_account("bob", dec!(1000)).await;
        let existing = holding("bob", "X", dec!(5), 3);
        store.seed_holding(existing.clone()).await.unwrap();

        let mut debited = account.clone();
        debited.balance = dec!(900);
        debited.version = 1;

        let commit = ExecutionCommit {
            account: debited,
            expected_account_version: 0,
            holding: HoldingWrite::Update {
                holding: Holding { version: 2, ..existing },
                expected_version: 1,
            },
        };

        let err = store.commit_execution(&commit).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.account("bob").await.unwrap().balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_insert_conflicts_when_key_exists() {
        let store = MemoryStore::new();
        store.insert_account("carol", dec!(100)).await;
        store.seed_holding(holding("carol", "Y", dec!(1), 0)).await.unwrap();

        let commit = ExecutionCommit {
            account: Account {
                username: "carol".into(),
                balance: dec!(90),
                version: 1,
            },
            expected_account_version: 0,
            holding: HoldingWrite::Insert(holding("carol", "Y", dec!(1), 0)),
        };

        assert!(matches!(
            store.commit_execution(&commit).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unique_constraint_refuses_duplicates() {
        let store = MemoryStore::new();
        store.seed_holding(holding("dave", "Z", dec!(1), 0)).await.unwrap();
        store.seed_holding(holding("dave", "Z", dec!(2), 0)).await.unwrap();

        assert!(store.install_unique_constraint().await.is_err());
        assert!(!store.has_unique_constraint().await);
    }
}
