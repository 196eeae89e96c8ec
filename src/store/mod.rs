//! Storage contracts for accounts, holdings and the order log
//! Engines only talk to these traits; `memory` and `postgres` implement them.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Default display value for the pass-through change fields.
pub const FLAT_CHANGE: &str = "+0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub username: String,
    pub balance: Decimal,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldingKey {
    pub username: String,
    pub instrument: String,
}

impl HoldingKey {
    pub fn new(username: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            instrument: instrument.into(),
        }
    }
}

impl fmt::Display for HoldingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.instrument)
    }
}

/// One user's position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub id: Uuid,
    pub username: String,
    pub instrument: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub last_price: Decimal,
    pub net_change: String,
    pub day_change: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(self.username.clone(), self.instrument.clone())
    }

    /// `average_cost * quantity`; `None` past the `Decimal` range.
    pub fn invested_value(&self) -> Option<Decimal> {
        self.average_cost.checked_mul(self.quantity)
    }

    pub fn current_value(&self) -> Option<Decimal> {
        self.last_price.checked_mul(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized side: {0:?}")]
pub struct ParseSideError(pub String);

impl FromStr for Side {
    type Err = ParseSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(ParseSideError(other.to_string())),
        }
    }
}

/// Immutable audit entry, one per accepted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: Uuid,
    pub username: String,
    pub instrument: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub side: Side,
    pub created_at: DateTime<Utc>,
}

/// The holding half of an execution commit
#[derive(Debug, Clone)]
pub enum HoldingWrite {
    /// Create a record; fails with a conflict if one already exists for the key.
    Insert(Holding),
    Update { holding: Holding, expected_version: i64 },
    Delete { id: Uuid, expected_version: i64 },
}

/// Everything one order writes, applied as a single atomic unit
#[derive(Debug, Clone)]
pub struct ExecutionCommit {
    pub account: Account,
    pub expected_account_version: i64,
    pub holding: HoldingWrite,
}

/// Online path used by the execution engine
#[async_trait]
pub trait BrokerageStore: Send + Sync {
    async fn find_account(&self, username: &str) -> StoreResult<Option<Account>>;

    /// When legacy duplicates exist the most recently written record is returned.
    async fn find_holding(&self, key: &HoldingKey) -> StoreResult<Option<Holding>>;

    async fn list_holdings(&self, username: &str) -> StoreResult<Vec<Holding>>;

    /// Apply the account write and the holding write together, or neither.
    ///
    /// Versions are checked before anything is written; a mismatch returns
    /// `StoreError::Conflict`. Records are stored with the version the caller
    /// set on them.
    async fn commit_execution(&self, commit: &ExecutionCommit) -> StoreResult<()>;

    async fn append_order(&self, record: &OrderRecord) -> StoreResult<()>;
}

/// Offline path used by the reconciliation job
#[async_trait]
pub trait HoldingsMaintenance: Send + Sync {
    /// Every holding record, in the order the store wrote them.
    async fn scan_holdings(&self) -> StoreResult<Vec<Holding>>;

    /// Overwrite the survivor and delete `removed` in one atomic unit.
    ///
    /// `removed` pairs each record id with the version seen by the scan.
    /// Returns the number of deleted records. Fails with a conflict if any
    /// record changed or disappeared since it was scanned.
    async fn merge_holdings(
        &self,
        survivor: &Holding,
        expected_survivor_version: i64,
        removed: &[(Uuid, i64)],
    ) -> StoreResult<usize>;

    async fn install_unique_constraint(&self) -> StoreResult<()>;
}
