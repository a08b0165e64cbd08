//! # Metrics Module
//!
//! Prometheus metrics for monitoring the operator, organized by responsibility.
//! Every family lives in one process-wide [`REGISTRY`] served on `/metrics`.
//!
//! ## Sub-modules
//!
//! - `controller_metrics` - Reconciliations, requeues, installs, ownership, ops runner, finalization
//! - `processing_metrics` - Git clones, kustomize builds and build service requests

pub mod controller_metrics;
pub mod processing_metrics;

pub use controller_metrics::*;
pub use processing_metrics::*;

use anyhow::{anyhow, Result};
use prometheus::Registry;
use std::sync::{LazyLock, Mutex};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Register the `qliksense_*` families with [`REGISTRY`]
///
/// Later calls are no-ops, so the server and tests may both call it.
#[allow(
    clippy::missing_errors_doc,
    reason = "Fails only when a family name collides"
)]
pub fn register_metrics() -> Result<()> {
    static REGISTERED: Mutex<bool> = Mutex::new(false);
    let mut registered = REGISTERED
        .lock()
        .map_err(|e| anyhow!("Metrics registration lock poisoned: {e}"))?;
    if *registered {
        return Ok(());
    }
    register_controller_metrics()?;
    register_processing_metrics()?;
    *registered = true;
    Ok(())
}
