//! # Reconciler Types
//!
//! The controller context shared by every reconciliation and its error type.

use crate::config::OperatorConfig;
use crate::constants::{BACKOFF_MAX_MINUTES, BACKOFF_MIN_MINUTES};
use crate::controller::acquisition::{GitCliSource, ManifestSource};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::cluster::{ClusterClient, KubeCluster};
use crate::controller::install::{KubectlApplier, ManifestApplier, ManifestBuilder};
use crate::controller::kustomize::KustomizeBuilder;
use crate::controller::opsrunner::RunnerPodSettings;
use crate::controller::registry::InstanceRegistry;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Error surfaced to the controller runtime
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("Reconciliation failed: {0:#}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// Per-resource retry state used by the error policy
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(BACKOFF_MIN_MINUTES, BACKOFF_MAX_MINUTES),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconciler context
pub struct Reconciler {
    pub cluster: Arc<dyn ClusterClient>,
    pub registry: InstanceRegistry,
    pub builder: Arc<dyn ManifestBuilder>,
    pub applier: Arc<dyn ManifestApplier>,
    pub config: OperatorConfig,
    pub runner_settings: RunnerPodSettings,
    /// Keyed by `namespace/name`
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        source: Arc<dyn ManifestSource>,
        builder: Arc<dyn ManifestBuilder>,
        applier: Arc<dyn ManifestApplier>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            cluster,
            registry: InstanceRegistry::new(source),
            builder,
            applier,
            runner_settings: RunnerPodSettings::from_config(&config),
            config,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: live cluster, git CLI, kustomize and kubectl
    pub fn from_client(client: Client, config: OperatorConfig) -> Self {
        let source = Arc::new(GitCliSource::new(config.workdir.clone()));
        Self::new(
            Arc::new(KubeCluster::new(client)),
            source,
            Arc::new(KustomizeBuilder::default()),
            Arc::new(KubectlApplier),
            config,
        )
    }

    /// Forget the error history of a resource after it reconciled cleanly
    pub fn reset_backoff(&self, resource_key: &str) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                states.remove(resource_key);
            }
            Err(e) => warn!("Failed to lock backoff_states: {}", e),
        }
    }

    /// Consecutive errors recorded for a resource
    pub fn error_count(&self, resource_key: &str) -> u32 {
        self.backoff_states
            .lock()
            .ok()
            .and_then(|states| states.get(resource_key).map(|s| s.error_count))
            .unwrap_or(0)
    }
}
