//! Trading Engine Module
//! Order execution, holding arithmetic, and duplicate-holding reconciliation

pub mod holding_book;
pub mod key_lock;
pub mod order_executor;
pub mod portfolio;
pub mod reconciler;

pub use key_lock::{KeyLock, KeyPermit, LocalKeyLock};
pub use order_executor::{ExecutionEngine, ExecutionResult, Order, OrderRequest};
pub use portfolio::PortfolioSummary;
pub use reconciler::{GroupFailure, ReconciliationReport, Reconciler};
