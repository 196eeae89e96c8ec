//! NATS Message Handler
//! Decodes order submissions, summary queries and reconcile requests,
//! hands them to the core, and replies with JSON

use crate::engine::{ExecutionEngine, OrderRequest, Reconciler};
use crate::error::ExecutionError;
use crate::observability::metrics::get_metrics;

use async_nats::Client;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SUBJECT_ORDER_SUBMIT: &str = "orders.submit";
pub const SUBJECT_PORTFOLIO_SUMMARY: &str = "portfolio.summary";
pub const SUBJECT_RECONCILE: &str = "holdings.reconcile";

// =====================================================
// REPLY ENVELOPE
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Reply<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl<T> Reply<T> {
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ReplyError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

impl<T> From<Result<T, ExecutionError>> for Reply<T> {
    fn from(result: Result<T, ExecutionError>) -> Self {
        match result {
            Ok(value) => Reply::ok(value),
            Err(e) => Reply::fail(e.code(), e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    username: String,
}

// =====================================================
// NATS SUBSCRIBER
// =====================================================

#[derive(Clone)]
pub struct NatsSubscriber {
    client: Client,
    engine: Arc<ExecutionEngine>,
    reconciler: Arc<Reconciler>,
}

impl NatsSubscriber {
    pub fn new(client: Client, engine: Arc<ExecutionEngine>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            client,
            engine,
            reconciler,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut order_sub = self.client.subscribe(SUBJECT_ORDER_SUBMIT).await?;
        let mut summary_sub = self.client.subscribe(SUBJECT_PORTFOLIO_SUMMARY).await?;
        let mut reconcile_sub = self.client.subscribe(SUBJECT_RECONCILE).await?;

        tracing::info!("NATS subscriber running");

        loop {
            tokio::select! {
                Some(msg) = order_sub.next() => {
                    count_message(SUBJECT_ORDER_SUBMIT);
                    // Each order runs on its own task; the engine serializes same-key orders.
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_order_submit(msg).await });
                }
                Some(msg) = summary_sub.next() => {
                    count_message(SUBJECT_PORTFOLIO_SUMMARY);
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_summary_query(msg).await });
                }
                Some(msg) = reconcile_sub.next() => {
                    count_message(SUBJECT_RECONCILE);
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_reconcile(msg).await });
                }
                else => {
                    tracing::warn!("All NATS subscriptions closed");
                    return Ok(());
                }
            }
        }
    }

    // =====================================================
    // ORDER SUBMIT
    // =====================================================

    async fn handle_order_submit(&self, msg: async_nats::Message) {
        let response = match serde_json::from_slice::<OrderRequest>(&msg.payload) {
            Ok(request) => Reply::from(self.engine.submit(request).await),
            Err(e) => Reply::fail("invalid_order", format!("Invalid payload: {}", e)),
        };
        if let (Some(reply), Some(payload)) = (msg.reply, encode_reply(&response)) {
            if let Err(e) = self.client.publish(reply, payload.into()).await {
                tracing::error!(error = %e, "Failed to publish reply");
            }
        }
    }

    // =====================================================
    // PORTFOLIO SUMMARY
    // =====================================================

    async fn handle_summary_query(&self, msg: async_nats::Message) {
        let response = match serde_json::from_slice::<SummaryQuery>(&msg.payload) {
            Ok(query) => Reply::from(self.engine.portfolio_summary(&query.username).await),
            Err(e) => Reply::fail("invalid_request", format!("Invalid payload: {}", e)),
        };
        if let (Some(reply), Some(payload)) = (msg.reply, encode_reply(&response)) {
            if let Err(e) = self.client.publish(reply, payload.into()).await {
                tracing::error!(error = %e, "Failed to publish reply");
            }
        }
    }

    // =====================================================
    // RECONCILE
    // =====================================================

    async fn handle_reconcile(&self, msg: async_nats::Message) {
        let response = match self.reconciler.run().await {
            Ok(report) => Reply::ok(report),
            Err(e) => Reply::fail("storage_failure", e.to_string()),
        };
        if let (Some(reply), Some(payload)) = (msg.reply, encode_reply(&response)) {
            if let Err(e) = self.client.publish(reply, payload.into()).await {
                tracing::error!(error = %e, "Failed to publish reply");
            }
        }
    }
}

/// Encode a reply; an unencodable reply is logged and dropped.
fn encode_reply<T: Serialize>(response: &Reply<T>) -> Option<Vec<u8>> {
    match serde_json::to_vec(response) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode reply");
            None
        }
    }
}

fn count_message(subject: &str) {
    if let Some(metrics) = get_metrics() {
        metrics
            .nats_messages_received
            .with_label_values(&[subject])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_reply_carries_code_and_message() {
        let reply: Reply<()> = Err(ExecutionError::InsufficientBalance {
            required: dec!(500),
            available: dec!(100),
        })
        .into();

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "insufficient_balance");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_ok_reply_omits_error() {
        let json = serde_json::to_value(Reply::ok(42)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["result"], 42);
        assert!(json.get("error").is_none());
    }
}
