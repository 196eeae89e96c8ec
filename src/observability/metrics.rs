//! Prometheus Metrics for the brokerage core
//! Order execution, reconciliation, and retry counters

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub struct Metrics {
    pub orders_executed_total: CounterVec,
    pub orders_rejected_total: CounterVec,
    pub order_execution_duration: HistogramVec,
    pub holdings_closed_total: IntCounter,
    pub reconcile_groups_merged_total: IntCounter,
    pub reconcile_records_deleted_total: IntCounter,
    pub reconcile_group_failures_total: IntCounter,
    pub unique_constraint_installed: Gauge,
    pub audit_append_failures_total: IntCounter,
    pub db_pool_connections: GaugeVec,
    pub nats_messages_received: CounterVec,
    pub retry_attempts_total: CounterVec,
}

static METRICS: OnceCell<Metrics> = OnceCell::new();

/// Initialize metrics. Calling it again is a no-op.
pub fn init_metrics(service_name: &str) -> anyhow::Result<()> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let orders_executed_total = CounterVec::new(
        Opts::new("orders_executed_total", "Orders executed")
            .namespace("brokerage")
            .const_label("service", service_name),
        &["side"],
    )?;

    let orders_rejected_total = CounterVec::new(
        Opts::new("orders_rejected_total", "Orders rejected")
            .namespace("brokerage")
            .const_label("service", service_name),
        &["reason"],
    )?;

    let order_execution_duration = HistogramVec::new(
        HistogramOpts::new(
            "order_execution_duration_seconds",
            "Order execution latency in seconds",
        )
        .namespace("brokerage")
        .const_label("service", service_name)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["side"],
    )?;

    let holdings_closed_total = IntCounter::new(
        "brokerage_holdings_closed_total",
        "Holdings deleted because a SELL brought them to zero",
    )?;

    let reconcile_groups_merged_total = IntCounter::new(
        "brokerage_reconcile_groups_merged_total",
        "Duplicate holding groups merged by reconciliation",
    )?;

    let reconcile_records_deleted_total = IntCounter::new(
        "brokerage_reconcile_records_deleted_total",
        "Duplicate holding records deleted by reconciliation",
    )?;

    let reconcile_group_failures_total = IntCounter::new(
        "brokerage_reconcile_group_failures_total",
        "Duplicate groups that failed to merge",
    )?;

    let unique_constraint_installed = Gauge::new(
        "brokerage_holdings_unique_constraint",
        "Whether the holdings uniqueness constraint is installed (1) or not (0)",
    )?;

    let audit_append_failures_total = IntCounter::new(
        "brokerage_audit_append_failures_total",
        "Order log appends that failed after a committed execution",
    )?;

    let db_pool_connections = GaugeVec::new(
        Opts::new("brokerage_db_pool_connections", "Database pool connections"),
        &["state"], // active, idle
    )?;

    let nats_messages_received = CounterVec::new(
        Opts::new("brokerage_nats_messages_received_total", "NATS messages received"),
        &["subject"],
    )?;

    let retry_attempts_total = CounterVec::new(
        Opts::new("brokerage_retry_attempts_total", "Retry attempts"),
        &["operation", "outcome"],
    )?;

    REGISTRY.register(Box::new(orders_executed_total.clone()))?;
    REGISTRY.register(Box::new(orders_rejected_total.clone()))?;
    REGISTRY.register(Box::new(order_execution_duration.clone()))?;
    REGISTRY.register(Box::new(holdings_closed_total.clone()))?;
    REGISTRY.register(Box::new(reconcile_groups_merged_total.clone()))?;
    REGISTRY.register(Box::new(reconcile_records_deleted_total.clone()))?;
    REGISTRY.register(Box::new(reconcile_group_failures_total.clone()))?;
    REGISTRY.register(Box::new(unique_constraint_installed.clone()))?;
    REGISTRY.register(Box::new(audit_append_failures_total.clone()))?;
    REGISTRY.register(Box::new(db_pool_connections.clone()))?;
    REGISTRY.register(Box::new(nats_messages_received.clone()))?;
    REGISTRY.register(Box::new(retry_attempts_total.clone()))?;

    let _ = METRICS.set(Metrics {
        orders_executed_total,
        orders_rejected_total,
        order_execution_duration,
        holdings_closed_total,
        reconcile_groups_merged_total,
        reconcile_records_deleted_total,
        reconcile_group_failures_total,
        unique_constraint_installed,
        audit_append_failures_total,
        db_pool_connections,
        nats_messages_received,
        retry_attempts_total,
    });

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Metrics instance, if `init_metrics` has run
pub fn get_metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
