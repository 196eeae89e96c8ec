//! Order Execution Engine
//! Applies one BUY/SELL to the user's balance and holding as an atomic unit,
//! serialized per (username, instrument) and retried on write conflicts.

use crate::engine::holding_book::{apply_buy, apply_sell, Overflow};
use crate::engine::key_lock::KeyLock;
use crate::engine::portfolio::PortfolioSummary;
use crate::error::ExecutionError;
use crate::observability::metrics::get_metrics;
use crate::resilience::{with_retry_if, RetryConfig};
use crate::store::{
    Account, BrokerageStore, ExecutionCommit, Holding, HoldingKey, HoldingWrite, OrderRecord, Side,
};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// =====================================================
// ORDER REQUEST (wire form, unvalidated)
// =====================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub username: String,
    #[serde(alias = "name")]
    pub instrument: String,
    #[serde(alias = "qty")]
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(alias = "mode")]
    pub side: String,
}

impl OrderRequest {
    pub fn validate(self) -> Result<Order, ExecutionError> {
        Order::try_from(self)
    }
}

// =====================================================
// VALIDATED ORDER
// =====================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub username: String,
    pub instrument: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub side: Side,
}

impl Order {
    pub fn new(
        username: impl Into<String>,
        instrument: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        side: Side,
    ) -> Result<Self, ExecutionError> {
        let username = username.into();
        let instrument = instrument.into();

        if username.trim().is_empty() {
            return Err(ExecutionError::InvalidOrder("username is required".into()));
        }
        if instrument.trim().is_empty() {
            return Err(ExecutionError::InvalidOrder("instrument is required".into()));
        }
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        if price <= Decimal::ZERO {
            return Err(ExecutionError::InvalidOrder(format!(
                "price must be positive, got {}",
                price
            )));
        }

        let order = Self {
            username,
            instrument,
            quantity,
            price,
            side,
        };
        order.notional()?;
        Ok(order)
    }

    pub fn key(&self) -> HoldingKey {
        HoldingKey::new(self.username.clone(), self.instrument.clone())
    }

    /// `price * quantity`, rejected when it leaves the `Decimal` range.
    pub fn notional(&self) -> Result<Decimal, ExecutionError> {
        self.price
            .checked_mul(self.quantity)
            .ok_or_else(|| order_overflow(Overflow))
    }
}

fn order_overflow(_: Overflow) -> ExecutionError {
    ExecutionError::InvalidOrder("order value overflows".into())
}

impl TryFrom<OrderRequest> for Order {
    type Error = ExecutionError;

    fn try_from(req: OrderRequest) -> Result<Self, Self::Error> {
        let side = req
            .side
            .parse::<Side>()
            .map_err(|e| ExecutionError::InvalidOrder(e.to_string()))?;
        Order::new(req.username, req.instrument, req.quantity, req.price, side)
    }
}

// =====================================================
// EXECUTION RESULT
// =====================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub order: OrderRecord,
    /// `None` when a SELL closed the position.
    pub updated_holding: Option<Holding>,
    /// `None` when the order committed but the summary could not be read back.
    pub portfolio_summary: Option<PortfolioSummary>,
    /// False when the order committed but its audit record could not be appended.
    pub audit_logged: bool,
}

// =====================================================
// EXECUTION ENGINE
// =====================================================

pub struct ExecutionEngine {
    store: Arc<dyn BrokerageStore>,
    locks: Arc<dyn KeyLock>,
    retry: RetryConfig,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn BrokerageStore>, locks: Arc<dyn KeyLock>) -> Self {
        Self {
            store,
            locks,
            retry: RetryConfig::for_conflicts(3),
        }
    }

    pub fn with_conflict_retries(mut self, max_attempts: u32) -> Self {
        self.retry = RetryConfig::for_conflicts(max_attempts);
        self
    }

    /// Validate a wire request, then execute it
    pub async fn submit(&self, request: OrderRequest) -> Result<ExecutionResult, ExecutionError> {
        match request.validate() {
            Ok(order) => self.execute(order).await,
            Err(e) => {
                record_rejection(&e);
                Err(e)
            }
        }
    }

    #[instrument(
        skip(self, order),
        fields(username = %order.username, instrument = %order.instrument, side = %order.side)
    )]
    pub async fn execute(&self, order: Order) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        let key = order.key();

        // Held across read, commit and summary so same-key orders never interleave.
        let _permit = self.locks.acquire(&key).await;

        let engine = self;
        let order_ref = &order;
        let key_ref = &key;
        let applied = with_retry_if(
            "execute_order",
            &self.retry,
            ExecutionError::is_retryable,
            move || engine.apply(order_ref, key_ref),
        )
        .await;

        let (account, updated_holding) = match applied {
            Ok(applied) => applied,
            Err(e) => {
                record_rejection(&e);
                debug!(error = %e, "Order rejected");
                return Err(e);
            }
        };

        let record = OrderRecord {
            id: Uuid::new_v4(),
            username: order.username.clone(),
            instrument: order.instrument.clone(),
            quantity: order.quantity,
            price: order.price,
            side: order.side,
            created_at: Utc::now(),
        };

        let audit_logged = match self.store.append_order(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(order_id = %record.id, error = %e, "Order committed but audit append failed");
                if let Some(metrics) = get_metrics() {
                    metrics.audit_append_failures_total.inc();
                }
                false
            }
        };

        let summary = match self.store.list_holdings(&order.username).await {
            Ok(holdings) => {
                PortfolioSummary::from_holdings(account.balance, &holdings).map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        let portfolio_summary = match summary {
            Ok(summary) => Some(summary),
            Err(reason) => {
                warn!(order_id = %record.id, error = %reason, "Order committed but portfolio summary unavailable");
                None
            }
        };

        if let Some(metrics) = get_metrics() {
            metrics
                .orders_executed_total
                .with_label_values(&[order.side.as_str()])
                .inc();
            metrics
                .order_execution_duration
                .with_label_values(&[order.side.as_str()])
                .observe(start.elapsed().as_secs_f64());
            if updated_holding.is_none() {
                metrics.holdings_closed_total.inc();
            }
        }

        let holding_quantity = updated_holding
            .as_ref()
            .map(|h| h.quantity)
            .unwrap_or_default();
        info!(
            order_id = %record.id,
            quantity = %order.quantity,
            price = %order.price,
            balance = %account.balance,
            holding_quantity = %holding_quantity,
            "Order executed"
        );

        Ok(ExecutionResult {
            order: record,
            updated_holding,
            portfolio_summary,
            audit_logged,
        })
    }

    /// One read-modify-write attempt. Nothing is written unless every check passes.
    async fn apply(
        &self,
        order: &Order,
        key: &HoldingKey,
    ) -> Result<(Account, Option<Holding>), ExecutionError> {
        let account = self
            .store
            .find_account(&order.username)
            .await?
            .ok_or_else(|| ExecutionError::AccountNotFound(order.username.clone()))?;

        let existing = self.store.find_holding(key).await?;
        let now = Utc::now();

        let (balance, write, updated) = match order.side {
            Side::Buy => {
                let cost = order.notional()?;
                if account.balance < cost {
                    return Err(ExecutionError::InsufficientBalance {
                        required: cost,
                        available: account.balance,
                    });
                }

                let next = apply_buy(existing.as_ref(), key, order.quantity, order.price, now)
                    .map_err(order_overflow)?;
                let write = match &existing {
                    Some(old) => HoldingWrite::Update {
                        holding: next.clone(),
                        expected_version: old.version,
                    },
                    None => HoldingWrite::Insert(next.clone()),
                };
                (account.balance - cost, write, Some(next))
            }
            Side::Sell => {
                let next = apply_sell(existing.as_ref(), order.quantity, order.price, now)?;
                let old = existing.ok_or(ExecutionError::InsufficientHoldings {
                    requested: order.quantity,
                    held: Decimal::ZERO,
                })?;
                let write = match &next {
                    Some(holding) => HoldingWrite::Update {
                        holding: holding.clone(),
                        expected_version: old.version,
                    },
                    None => HoldingWrite::Delete {
                        id: old.id,
                        expected_version: old.version,
                    },
                };
                let balance = account
                    .balance
                    .checked_add(order.notional()?)
                    .ok_or_else(|| order_overflow(Overflow))?;
                (balance, write, next)
            }
        };

        let commit = ExecutionCommit {
            expected_account_version: account.version,
            account: Account {
                balance,
                version: account.version + 1,
                ..account
            },
            holding: write,
        };

        self.store.commit_execution(&commit).await?;
        Ok((commit.account, updated))
    }

    /// Current valuation of one user's account
    pub async fn portfolio_summary(&self, username: &str) -> Result<PortfolioSummary, ExecutionError> {
        let account = self
            .store
            .find_account(username)
            .await?
            .ok_or_else(|| ExecutionError::AccountNotFound(username.to_string()))?;
        let holdings = self.store.list_holdings(username).await?;
        PortfolioSummary::from_holdings(account.balance, &holdings).map_err(|e| {
            ExecutionError::StorageFailure(format!("holdings of {} cannot be valued: {}", username, e))
        })
    }
}

fn record_rejection(err: &ExecutionError) {
    if let Some(metrics) = get_metrics() {
        metrics
            .orders_rejected_total
            .with_label_values(&[err.code()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: &str, quantity: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            username: "alice".into(),
            instrument: "X".into(),
            quantity,
            price,
            side: side.into(),
        }
    }

    #[test]
    fn test_valid_request_converts() {
        let order = Order::try_from(request("BUY", dec!(1), dec!(10))).unwrap();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.notional().unwrap(), dec!(10));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let err = Order::try_from(request("BUY", dec!(0), dec!(10))).unwrap_err();
        assert_eq!(err.code(), "invalid_order");
    }

    #[test]
    fn test_negative_price_rejected() {
        let err = Order::try_from(request("SELL", dec!(1), dec!(-5))).unwrap_err();
        assert_eq!(err.code(), "invalid_order");
    }

    #[test]
    fn test_overflowing_notional_rejected() {
        let big = Decimal::from(100_000_000_000_000_000u64);
        let err = Order::try_from(request("BUY", big, big)).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidOrder(msg) if msg.contains("overflows")));
    }

    #[test]
    fn test_lowercase_side_rejected() {
        let err = Order::try_from(request("buy", dec!(1), dec!(5))).unwrap_err();
        assert_eq!(err.code(), "invalid_order");
    }

    #[test]
    fn test_unknown_side_rejected() {
        let err = Order::try_from(request("SHORT", dec!(1), dec!(5))).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidOrder(_)));
    }

    #[test]
    fn test_request_accepts_legacy_field_names() {
        let req: OrderRequest = serde_json::from_str(
            r#"{"username":"alice","name":"X","qty":2,"price":"12.5","mode":"BUY"}"#,
        )
        .unwrap();
        let order = Order::try_from(req).unwrap();
        assert_eq!(order.quantity, dec!(2));
        assert_eq!(order.price, dec!(12.5));
    }
}
