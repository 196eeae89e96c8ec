//! Holdings Reconciliation
//! Merges duplicate (username, instrument) records into one, then installs
//! the uniqueness constraint. Safe to re-run; a second pass is a no-op.

use crate::engine::holding_book::plan_merge;
use crate::engine::key_lock::KeyLock;
use crate::observability::metrics::get_metrics;
use crate::store::{Holding, HoldingKey, HoldingsMaintenance};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFailure {
    pub username: String,
    pub instrument: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub groups_inspected: usize,
    pub groups_merged: usize,
    pub records_deleted: usize,
    pub constraint_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<GroupFailure>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.constraint_installed
    }
}

pub struct Reconciler {
    store: Arc<dyn HoldingsMaintenance>,
    locks: Arc<dyn KeyLock>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn HoldingsMaintenance>, locks: Arc<dyn KeyLock>) -> Self {
        Self { store, locks }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> anyhow::Result<ReconciliationReport> {
        let snapshot = self.store.scan_holdings().await?;
        let groups = group_by_key(snapshot);

        let mut report = ReconciliationReport {
            groups_inspected: groups.len(),
            ..Default::default()
        };

        let duplicates: Vec<_> = groups
            .into_iter()
            .filter(|(_, records)| records.len() > 1)
            .collect();
        info!(
            groups = report.groups_inspected,
            duplicate_groups = duplicates.len(),
            "Scanned holdings"
        );

        for (key, records) in duplicates {
            match self.merge_group(&key, &records).await {
                Ok(deleted) => {
                    report.groups_merged += 1;
                    report.records_deleted += deleted;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to merge duplicate holdings");
                    if let Some(metrics) = get_metrics() {
                        metrics.reconcile_group_failures_total.inc();
                    }
                    report.failures.push(GroupFailure {
                        username: key.username,
                        instrument: key.instrument,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Best-effort hardening; merged groups stay merged either way.
        match self.store.install_unique_constraint().await {
            Ok(()) => {
                report.constraint_installed = true;
                info!("Unique constraint on (username, instrument) installed");
            }
            Err(e) => {
                warn!(error = %e, "Could not install unique constraint on holdings");
                report.constraint_error = Some(e.to_string());
            }
        }

        if let Some(metrics) = get_metrics() {
            metrics
                .reconcile_groups_merged_total
                .inc_by(report.groups_merged as u64);
            metrics
                .reconcile_records_deleted_total
                .inc_by(report.records_deleted as u64);
            metrics
                .unique_constraint_installed
                .set(if report.constraint_installed { 1.0 } else { 0.0 });
        }

        info!(
            groups_inspected = report.groups_inspected,
            groups_merged = report.groups_merged,
            records_deleted = report.records_deleted,
            constraint_installed = report.constraint_installed,
            failures = report.failures.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn merge_group(&self, key: &HoldingKey, records: &[Holding]) -> anyhow::Result<usize> {
        let Some(plan) = plan_merge(records)? else {
            return Ok(0);
        };

        let _permit = self.locks.acquire(key).await;
        let deleted = self
            .store
            .merge_holdings(&plan.survivor, plan.expected_survivor_version, &plan.removed)
            .await?;

        info!(
            key = %key,
            kept = %plan.survivor.id,
            deleted = deleted,
            quantity = %plan.survivor.quantity,
            average_cost = %plan.survivor.average_cost,
            "Merged duplicate holdings"
        );
        Ok(deleted)
    }
}

/// Group records by key, preserving scan order inside each group
fn group_by_key(records: Vec<Holding>) -> BTreeMap<HoldingKey, Vec<Holding>> {
    let mut groups: BTreeMap<HoldingKey, Vec<Holding>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record);
    }
    groups
}
