//! PostgreSQL store
//! Account and holding writes for one order share a single transaction.

use super::{
    Account, BrokerageStore, ExecutionCommit, Holding, HoldingKey, HoldingWrite,
    HoldingsMaintenance, OrderRecord,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const HOLDING_COLUMNS: &str = "id, username, instrument, quantity, average_cost, last_price, \
     net_change, day_change, version, updated_at";

pub const UNIQUE_HOLDING_INDEX: &str = "holdings_username_instrument_key";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if missing. The holdings uniqueness index is left to
    /// reconciliation, since legacy data may still hold duplicates.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS accounts (
                   username TEXT PRIMARY KEY,
                   balance NUMERIC NOT NULL CHECK (balance >= 0),
                   version BIGINT NOT NULL DEFAULT 0
               )"#,
            r#"CREATE TABLE IF NOT EXISTS holdings (
                   id UUID PRIMARY KEY,
                   username TEXT NOT NULL,
                   instrument TEXT NOT NULL,
                   quantity NUMERIC NOT NULL,
                   average_cost NUMERIC NOT NULL,
                   last_price NUMERIC NOT NULL,
                   net_change TEXT NOT NULL DEFAULT '+0',
                   day_change TEXT NOT NULL DEFAULT '+0',
                   version BIGINT NOT NULL DEFAULT 0,
                   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                   updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
               )"#,
            r#"CREATE INDEX IF NOT EXISTS holdings_username_idx ON holdings (username)"#,
            r#"CREATE TABLE IF NOT EXISTS orders (
                   id UUID PRIMARY KEY,
                   username TEXT NOT NULL,
                   instrument TEXT NOT NULL,
                   quantity NUMERIC NOT NULL,
                   price NUMERIC NOT NULL,
                   side TEXT NOT NULL,
                   created_at TIMESTAMPTZ NOT NULL
               )"#,
            r#"CREATE INDEX IF NOT EXISTS orders_created_at_idx ON orders (created_at)"#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Schema ensured");
        Ok(())
    }

    async fn write_holding(
        tx: &mut Transaction<'_, Postgres>,
        write: &HoldingWrite,
    ) -> StoreResult<()> {
        match write {
            HoldingWrite::Insert(h) => {
                // Without the unique index a concurrent insert could slip in,
                // so the existence check runs inside the same statement.
                let inserted = sqlx::query(
                    r#"INSERT INTO holdings (id, username, instrument, quantity, average_cost,
                                             last_price, net_change, day_change, version, updated_at)
                       SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
                       WHERE NOT EXISTS (
                           SELECT 1 FROM holdings WHERE username = $2 AND instrument = $3
                       )"#,
                )
                .bind(h.id)
                .bind(&h.username)
                .bind(&h.instrument)
                .bind(h.quantity)
                .bind(h.average_cost)
                .bind(h.last_price)
                .bind(&h.net_change)
                .bind(&h.day_change)
                .bind(h.version)
                .bind(h.updated_at)
                .execute(&mut **tx)
                .await?;

                if inserted.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!(
                        "holding for {} already exists",
                        h.key()
                    )));
                }
            }
            HoldingWrite::Update {
                holding: h,
                expected_version,
            } => {
                let updated = sqlx::query(
                    r#"UPDATE holdings
                       SET quantity = $2, average_cost = $3, last_price = $4,
                           net_change = $5, day_change = $6, version = $7, updated_at = $8
                       WHERE id = $1 AND version = $9"#,
                )
                .bind(h.id)
                .bind(h.quantity)
                .bind(h.average_cost)
                .bind(h.last_price)
                .bind(&h.net_change)
                .bind(&h.day_change)
                .bind(h.version)
                .bind(h.updated_at)
                .bind(expected_version)
                .execute(&mut **tx)
                .await?;

                if updated.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!(
                        "holding {} changed since it was read",
                        h.id
                    )));
                }
            }
            HoldingWrite::Delete {
                id,
                expected_version,
            } => {
                let deleted = sqlx::query("DELETE FROM holdings WHERE id = $1 AND version = $2")
                    .bind(id)
                    .bind(expected_version)
                    .execute(&mut **tx)
                    .await?;

                if deleted.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!(
                        "holding {} changed since it was read",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerageStore for PgStore {
    async fn find_account(&self, username: &str) -> StoreResult<Option<Account>> {
        let account: Option<Account> =
            sqlx::query_as("SELECT username, balance, version FROM accounts WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    async fn find_holding(&self, key: &HoldingKey) -> StoreResult<Option<Holding>> {
        let holding: Option<Holding> = sqlx::query_as(&format!(
            "SELECT {} FROM holdings WHERE username = $1 AND instrument = $2 \
             ORDER BY updated_at DESC, created_at DESC LIMIT 1",
            HOLDING_COLUMNS
        ))
        .bind(&key.username)
        .bind(&key.instrument)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holding)
    }

    async fn list_holdings(&self, username: &str) -> StoreResult<Vec<Holding>> {
        let holdings: Vec<Holding> = sqlx::query_as(&format!(
            "SELECT {} FROM holdings WHERE username = $1 ORDER BY created_at",
            HOLDING_COLUMNS
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(holdings)
    }

    async fn commit_execution(&self, commit: &ExecutionCommit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE accounts SET balance = $2, version = $3
               WHERE username = $1 AND version = $4"#,
        )
        .bind(&commit.account.username)
        .bind(commit.account.balance)
        .bind(commit.account.version)
        .bind(commit.expected_account_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return Err(StoreError::Conflict(format!(
                "account {} changed since it was read",
                commit.account.username
            )));
        }

        Self::write_holding(&mut tx, &commit.holding).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_order(&self, record: &OrderRecord) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO orders (id, username, instrument, quantity, price, side, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(record.id)
        .bind(&record.username)
        .bind(&record.instrument)
        .bind(record.quantity)
        .bind(record.price)
        .bind(record.side.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HoldingsMaintenance for PgStore {
    async fn scan_holdings(&self) -> StoreResult<Vec<Holding>> {
        let holdings: Vec<Holding> = sqlx::query_as(&format!(
            "SELECT {} FROM holdings ORDER BY created_at, id",
            HOLDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(holdings)
    }

    async fn merge_holdings(
        &self,
        survivor: &Holding,
        expected_survivor_version: i64,
        removed: &[(Uuid, i64)],
    ) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;

        Self::write_holding(
            &mut tx,
            &HoldingWrite::Update {
                holding: survivor.clone(),
                expected_version: expected_survivor_version,
            },
        )
        .await?;

        for (id, version) in removed {
            Self::write_holding(
                &mut tx,
                &HoldingWrite::Delete {
                    id: *id,
                    expected_version: *version,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(removed.len())
    }

    async fn install_unique_constraint(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON holdings (username, instrument)",
            UNIQUE_HOLDING_INDEX
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
