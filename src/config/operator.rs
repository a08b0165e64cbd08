//! # Operator Configuration
//!
//! Identity of the operator, scratch storage, finalization bounds, ops-runner pod
//! defaults and the dynamic kinds reconciled besides the built-in ones.

use crate::constants::*;
use crate::controller::cluster::ResourceKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Bounds of the pod drain wait during finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationConfig {
    /// Give up waiting for pods after this long
    pub max_wait: Duration,
    /// Interval between pod counts
    pub poll_interval: Duration,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(DEFAULT_MAX_DELETION_WAIT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_DELETION_POLL_INTERVAL_MS),
        }
    }
}

/// Pod spec defaults for the ops-runner job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsRunnerConfig {
    pub image_pull_policy: String,
    pub restart_policy: String,
}

impl Default for OpsRunnerConfig {
    fn default() -> Self {
        Self {
            image_pull_policy: DEFAULT_IMAGE_PULL_POLICY.to_string(),
            restart_policy: DEFAULT_RESTART_POLICY.to_string(),
        }
    }
}

/// Operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Name of the operator deployment; the build service is `<name>-kuztomize`
    pub operator_name: String,
    /// Namespace the operator runs in
    pub operator_namespace: String,
    /// Name of the operator pod, from the downward API
    pub pod_name: Option<String>,
    /// Port of the build callback service, passed to ops-runner pods
    pub build_service_port: u16,
    /// Root under which manifests are cloned
    pub workdir: PathBuf,
    /// Custom resource kinds reconciled through the dynamic client
    pub dynamic_resources: Vec<ResourceKind>,
    pub finalization: FinalizationConfig,
    pub ops_runner: OpsRunnerConfig,
    /// Create/update the build service Service object at startup
    pub register_build_service: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(super::env_string)
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let dynamic_resources = match lookup("DYNAMIC_RESOURCES") {
            Some(value) => ResourceKind::parse_list(&value).unwrap_or_else(|e| {
                warn!(
                    "Invalid DYNAMIC_RESOURCES '{}': {:#}, using defaults",
                    value, e
                );
                default_dynamic_resources()
            }),
            None => default_dynamic_resources(),
        };

        Self {
            operator_name: lookup("OPERATOR_NAME")
                .unwrap_or_else(|| DEFAULT_OPERATOR_NAME.to_string()),
            operator_namespace: lookup("OPERATOR_NAMESPACE")
                .or_else(|| lookup("POD_NAMESPACE"))
                .unwrap_or_else(|| DEFAULT_OPERATOR_NAMESPACE.to_string()),
            pod_name: lookup("POD_NAME").filter(|v| !v.trim().is_empty()),
            build_service_port: lookup("KUZ_SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUILD_SERVICE_PORT),
            workdir: lookup("QLIK_WORKDIR").map_or_else(std::env::temp_dir, PathBuf::from),
            dynamic_resources,
            finalization: FinalizationConfig {
                max_wait: Duration::from_secs(parsed(
                    "MAX_DELETION_WAIT_SECONDS",
                    DEFAULT_MAX_DELETION_WAIT_SECS,
                )),
                poll_interval: Duration::from_millis(
                    parsed("DELETION_POLL_INTERVAL_MS", DEFAULT_DELETION_POLL_INTERVAL_MS).max(1),
                ),
            },
            ops_runner: OpsRunnerConfig {
                image_pull_policy: lookup("DEBUG_OPS_RUNNER_CONTAINER_IMAGE_PULL_POLICY")
                    .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string()),
                restart_policy: lookup("DEBUG_OPS_RUNNER_POD_SPEC_RESTART_POLICY")
                    .unwrap_or_else(|| DEFAULT_RESTART_POLICY.to_string()),
            },
            register_build_service: lookup("REGISTER_BUILD_SERVICE")
                .map_or(true, |v| crate::crd::is_truthy(&v)),
        }
    }

    /// Name of the Service fronting the build callback
    pub fn build_service_name(&self) -> String {
        format!("{}{}", self.operator_name, BUILD_SERVICE_NAME_SUFFIX)
    }
}

fn default_dynamic_resources() -> Vec<ResourceKind> {
    ResourceKind::parse_list(DEFAULT_DYNAMIC_RESOURCES).unwrap_or_default()
}
