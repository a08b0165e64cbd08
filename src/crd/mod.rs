//! # Custom Resource Definitions
//!
//! CRD types for the Qliksense operator.
//!
//! The `Qliksense` resource declares one Qlik Sense installation: where its
//! manifests come from, which overlay values to patch in, and whether an
//! ops-runner job keeps the installation in sync with a watched branch.

mod status;

pub use status::*;

use crate::constants::{
    DEFAULT_PROFILE, DEFAULT_VERSION, QLIKSENSE_FINALIZER, VERSION_LABEL,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Qliksense Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: qlik.com/v1
/// kind: Qliksense
/// metadata:
///   name: qlik-default
///   labels:
///     version: v1.0.0
/// spec:
///   profile: manifests/docker-desktop
///   git:
///     repository: https://github.com/qlik-oss/qliksense-k8s
///   opsRunner:
///     enabled: "yes"
///     schedule: "*/10 * * * *"
///     watchBranch: master
///     image: qlik-docker-oss.bintray.io/qliksense-repo-watcher
///   secrets:
///     - secretKey: mongoDbUri
///       values:
///         qix-sessions: mongodb://qlik-default-mongodb:27017/qliksense
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Qliksense",
    group = "qlik.com",
    version = "v1",
    namespaced,
    status = "QliksenseStatus",
    shortname = "qs",
    printcolumn = r#"{"name":"Profile", "type":"string", "jsonPath":".spec.profile"}, {"name":"OpsRunner", "type":"string", "jsonPath":".spec.opsRunner.enabled"}, {"name":"Error", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Error\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QliksenseSpec {
    /// Profile directory relative to the manifests root, e.g. `manifests/docker-desktop`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile: String,
    /// Local manifests root (CLI mode mounts it, git mode fills it in)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manifests_root: String,
    /// Storage class override for persistent volumes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,
    /// Private registry the ops-runner image is pulled from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_registry: String,
    /// One-shot key rotation request ("yes"/"no"), cleared after install
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rotate_keys: String,
    /// Whether keys are generated during the build
    #[serde(default)]
    pub generate_keys: bool,
    /// Git source of the manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    /// Ops-runner job descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_runner: Option<OpsRunnerSpec>,
    /// ConfigMap overlay values per service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigEntry>,
    /// Secret overlay values per service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretEntry>,
}

/// Git repository holding the manifests
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Ops-runner descriptor
///
/// `enabled` is a string for compatibility with existing manifests; see [`is_truthy`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpsRunnerSpec {
    #[serde(default)]
    pub enabled: String,
    /// Cron schedule; empty means a one-shot Job
    #[serde(default)]
    pub schedule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub watch_branch: String,
    #[serde(default)]
    pub image: String,
}

/// ConfigMap value for one data key, keyed by service name
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub data_key: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Secret value for one secret key, keyed by service name
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    pub secret_key: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Interpret a string flag from the CR.
///
/// Manifests in the wild use both `"yes"` and `"true"`, so `yes`, `true`, `on` and `1`
/// (case-insensitive, surrounding whitespace ignored) all count as set.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1"
    )
}

impl QliksenseSpec {
    /// Profile directory relative to the manifests root
    pub fn profile_dir(&self) -> &str {
        if self.profile.trim().is_empty() {
            DEFAULT_PROFILE
        } else {
            self.profile.trim()
        }
    }

    /// Whether the next render must replace existing key material
    pub fn rotate_keys_requested(&self) -> bool {
        is_truthy(&self.rotate_keys)
    }
}

impl Qliksense {
    /// Manifest version from the `version` label, used as git ref and directory name
    pub fn version(&self) -> &str {
        self.labels()
            .get(VERSION_LABEL)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_VERSION)
    }

    /// Git repository URL when the CR is in git mode
    pub fn git_repository(&self) -> Option<&str> {
        self.spec
            .git
            .as_ref()
            .map(|g| g.repository.trim())
            .filter(|r| !r.is_empty())
    }

    pub fn ops_runner_enabled(&self) -> bool {
        self.spec
            .ops_runner
            .as_ref()
            .is_some_and(|o| is_truthy(&o.enabled))
    }

    pub fn rotate_keys_requested(&self) -> bool {
        self.spec.rotate_keys_requested()
    }

    /// Profile directory relative to the manifests root
    pub fn profile_dir(&self) -> &str {
        self.spec.profile_dir()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == QLIKSENSE_FINALIZER)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Conditions currently persisted on the resource
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Render the CR as the YAML handed to the ops runner.
    ///
    /// Only identity, labels and spec are included so the output is stable across
    /// status updates and resource version bumps.
    pub fn to_runner_yaml(&self) -> anyhow::Result<String> {
        let doc = serde_json::json!({
            "apiVersion": "qlik.com/v1",
            "kind": "Qliksense",
            "metadata": {
                "name": self.name_any(),
                "namespace": self.namespace(),
                "labels": self.labels(),
            },
            "spec": self.spec,
        });
        Ok(serde_yaml::to_string(&doc)?)
    }
}
