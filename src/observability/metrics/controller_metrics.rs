//! # Controller Metrics
//!
//! Metrics for the reconcile loop and the work it drives: installs, owner
//! references, ops-runner objects and finalization.

use crate::observability::metrics::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec};
use std::sync::LazyLock;

// Reconciliation metrics
static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_reconciliations_total",
        "Qliksense reconcile passes started",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_reconciliation_errors_total",
        "Qliksense reconcile passes that returned an error",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "qliksense_reconciliation_duration_seconds",
            "Wall time of one Qliksense reconcile pass",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "qliksense_requeues_total",
            "Qliksense requeues scheduled, by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

// Work driven by reconciliation
static INSTALLS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_installs_total",
        "Total number of manifest installs applied to the cluster",
    )
    .expect("Failed to create INSTALLS_TOTAL metric - this should never happen")
});

static OWNER_REFERENCES_SET_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_owner_references_set_total",
        "Total number of owner references added to tracked resources",
    )
    .expect("Failed to create OWNER_REFERENCES_SET_TOTAL metric - this should never happen")
});

static OPS_RUNNER_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "qliksense_ops_runner_operations_total",
            "Total number of writes to ops-runner Jobs and CronJobs",
        ),
        &["operation"],
    )
    .expect("Failed to create OPS_RUNNER_OPERATIONS_TOTAL metric - this should never happen")
});

static FINALIZATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_finalizations_total",
        "Total number of completed finalizations",
    )
    .expect("Failed to create FINALIZATIONS_TOTAL metric - this should never happen")
});

/// Register controller metrics with the registry
pub(crate) fn register_controller_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INSTALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OWNER_REFERENCES_SET_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OPS_RUNNER_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FINALIZATIONS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_installs() {
    INSTALLS_TOTAL.inc();
}

pub fn increment_owner_references_set(count: usize) {
    OWNER_REFERENCES_SET_TOTAL.inc_by(count as u64);
}

pub fn increment_ops_runner_operations(operation: &str) {
    OPS_RUNNER_OPERATIONS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn increment_finalizations() {
    FINALIZATIONS_TOTAL.inc();
}
