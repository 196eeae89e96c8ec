//! Brokerage Core
//! Order execution against per-user cash balances and holdings, plus
//! reconciliation of duplicate holding records.

pub mod config;
pub mod engine;
pub mod error;
pub mod nats_handler;
pub mod observability;
pub mod resilience;
pub mod store;

pub use engine::{ExecutionEngine, ExecutionResult, Order, OrderRequest, Reconciler};
pub use error::{ExecutionError, StoreError};
