//! # Processing Metrics
//!
//! Metrics for the external tools and the build service: git clones, kustomize
//! builds and `/kuz` requests.

use crate::observability::metrics::REGISTRY;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec};
use std::sync::LazyLock;

// Git operations
static GIT_CLONE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_git_clone_total",
        "Repository checkouts attempted for git-mode resources",
    )
    .expect("Failed to create GIT_CLONE_TOTAL metric - this should never happen")
});

static GIT_CLONE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "qliksense_git_clone_duration_seconds",
            "Wall time of clone plus checkout",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("Failed to create GIT_CLONE_DURATION metric - this should never happen")
});

static GIT_CLONE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_git_clone_errors_total",
        "Repository checkouts that failed",
    )
    .expect("Failed to create GIT_CLONE_ERRORS_TOTAL metric - this should never happen")
});

// Kustomize builds
static KUSTOMIZE_BUILD_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_kustomize_build_total",
        "kustomize build invocations",
    )
    .expect("Failed to create KUSTOMIZE_BUILD_TOTAL metric - this should never happen")
});

static KUSTOMIZE_BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "qliksense_kustomize_build_duration_seconds",
            "Wall time of one kustomize build",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create KUSTOMIZE_BUILD_DURATION metric - this should never happen")
});

static KUSTOMIZE_BUILD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "qliksense_kustomize_build_errors_total",
        "kustomize build invocations that failed",
    )
    .expect("Failed to create KUSTOMIZE_BUILD_ERRORS_TOTAL metric - this should never happen")
});

// Build service
static BUILD_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "qliksense_build_requests_total",
            "/kuz requests, by result",
        ),
        &["result"],
    )
    .expect("Failed to create BUILD_REQUESTS_TOTAL metric - this should never happen")
});

/// Register processing metrics with the registry
pub(crate) fn register_processing_metrics() -> Result<()> {
    REGISTRY.register(Box::new(GIT_CLONE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GIT_CLONE_DURATION.clone()))?;
    REGISTRY.register(Box::new(GIT_CLONE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KUSTOMIZE_BUILD_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KUSTOMIZE_BUILD_DURATION.clone()))?;
    REGISTRY.register(Box::new(KUSTOMIZE_BUILD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BUILD_REQUESTS_TOTAL.clone()))?;
    Ok(())
}

/// Record a finished clone attempt
pub fn observe_git_clone_duration(duration: f64) {
    GIT_CLONE_TOTAL.inc();
    GIT_CLONE_DURATION.observe(duration);
}

pub fn increment_git_clone_errors() {
    GIT_CLONE_ERRORS_TOTAL.inc();
}

/// Record a finished build attempt
pub fn observe_kustomize_build_duration(duration: f64) {
    KUSTOMIZE_BUILD_TOTAL.inc();
    KUSTOMIZE_BUILD_DURATION.observe(duration);
}

pub fn increment_kustomize_build_errors() {
    KUSTOMIZE_BUILD_ERRORS_TOTAL.inc();
}

pub fn increment_build_requests(result: &str) {
    BUILD_REQUESTS_TOTAL.with_label_values(&[result]).inc();
}
