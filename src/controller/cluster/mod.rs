//! # Cluster Access
//!
//! Capability traits the reconciler talks to the API server through.
//!
//! - [`DynamicResources`] - list, set owner and bulk delete for any kind, typed or
//!   discovered at runtime, parameterized by a [`ResourceKind`] descriptor
//! - [`ClusterClient`] - the Qliksense resource itself and the ops-runner Job/CronJob
//!
//! [`KubeCluster`] implements both over a `kube::Client`. Tests substitute an
//! in-memory implementation.

mod kube_client;

pub use kube_client::KubeCluster;

use crate::crd::{Qliksense, QliksenseStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::Resource;
use std::fmt;

/// Error returned by cluster operations, classified the way the reconciler reacts to it
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Object (or its kind) does not exist
    #[error("{0} not found")]
    NotFound(String),
    /// Create raced with another writer
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Optimistic concurrency failure on update
    #[error("conflict writing {0}")]
    Conflict(String),
    #[error("failed to encode {0}: {1}")]
    Encoding(String, #[source] serde_json::Error),
    #[error("kubernetes API error on {0}: {1}")]
    Api(String, #[source] kube::Error),
}

impl ClusterError {
    /// Classify a kube error against the object it concerns
    pub fn from_kube(err: kube::Error, target: impl Into<String>) -> Self {
        let target = target.into();
        match &err {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(target),
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    Self::AlreadyExists(target)
                } else {
                    Self::Conflict(target)
                }
            }
            _ => Self::Api(target, err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Result alias for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Descriptor of a resource kind: group, version, kind and plural name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    /// Descriptor of a compiled-in kind
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        }
    }

    /// Parse `group/version/Kind/plural`. The core group is written as an empty
    /// segment (`/v1/Pod/pods`) or omitted (`v1/Pod/pods`).
    pub fn parse(descriptor: &str) -> Result<Self> {
        let parts: Vec<&str> = descriptor.trim().split('/').collect();
        let (group, version, kind, plural) = match parts.as_slice() {
            [group, version, kind, plural] => (*group, *version, *kind, *plural),
            [version, kind, plural] => ("", *version, *kind, *plural),
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid resource descriptor '{descriptor}', expected group/version/Kind/plural"
                ))
            }
        };
        if version.is_empty() || kind.is_empty() || plural.is_empty() {
            return Err(anyhow::anyhow!(
                "Invalid resource descriptor '{descriptor}', version, kind and plural are required"
            ));
        }
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        })
    }

    /// Parse a comma separated list of descriptors, ignoring blanks
    pub fn parse_list(descriptors: &str) -> Result<Vec<Self>> {
        descriptors
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| Self::parse(d).with_context(|| format!("Failed to parse '{d}'")))
            .collect()
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&self.group, &self.version, &self.kind),
            &self.plural,
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.plural, self.version)
        } else {
            write!(f, "{}.{}/{}", self.plural, self.group, self.version)
        }
    }
}

/// Generic capabilities over any kind
#[async_trait]
pub trait DynamicResources: Send + Sync {
    /// List objects of `kind` in `namespace` matching `label_selector`
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<DynamicObject>>;

    /// Append `owner` to the object's owner references and persist it
    async fn set_owner(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
        owner: OwnerReference,
    ) -> ClusterResult<()>;

    /// Delete every object of `kind` in `namespace` matching `label_selector`
    async fn delete_all(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
        grace_period_secs: u32,
    ) -> ClusterResult<()>;
}

/// Typed operations used by the reconcile loop and the ops-runner manager
#[async_trait]
pub trait ClusterClient: DynamicResources {
    async fn get_qliksense(&self, namespace: &str, name: &str)
        -> ClusterResult<Option<Qliksense>>;

    /// Full update of the resource (metadata and spec), guarded by resource version
    async fn replace_qliksense(&self, qliksense: &Qliksense) -> ClusterResult<Qliksense>;

    async fn patch_qliksense_status(
        &self,
        namespace: &str,
        name: &str,
        status: &QliksenseStatus,
    ) -> ClusterResult<()>;

    async fn get_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<CronJob>>;
    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>>;
    async fn create_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()>;
    async fn create_job(&self, job: &Job) -> ClusterResult<()>;
    async fn replace_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()>;
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<()>;
    async fn delete_job(&self, namespace: &str, name: &str) -> ClusterResult<()>;
}

/// Label selector matching everything owned by the named CR
pub fn tracking_selector(cr_name: &str) -> String {
    format!("{}={}", crate::constants::TRACKING_LABEL, cr_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn test_resource_kind_of_typed() {
        let deployment = ResourceKind::of::<Deployment>();
        assert_eq!(deployment.group, "apps");
        assert_eq!(deployment.plural, "deployments");
        assert_eq!(deployment.api_version(), "apps/v1");

        let pod = ResourceKind::of::<Pod>();
        assert_eq!(pod.api_version(), "v1");
        assert_eq!(pod.to_string(), "pods/v1");
    }

    #[test]
    fn test_parse_descriptor() {
        let engine = ResourceKind::parse("qixmanager.qlik.com/v1/Engine/engines").unwrap();
        assert_eq!(engine.group, "qixmanager.qlik.com");
        assert_eq!(engine.kind, "Engine");
        assert_eq!(engine.to_string(), "engines.qixmanager.qlik.com/v1");
        assert_eq!(engine.api_resource().api_version, "qixmanager.qlik.com/v1");

        let core = ResourceKind::parse("v1/ConfigMap/configmaps").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core, ResourceKind::parse("/v1/ConfigMap/configmaps").unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ResourceKind::parse("engines").is_err());
        assert!(ResourceKind::parse("a/b/c/d/e").is_err());
        assert!(ResourceKind::parse("group//Kind/plural").is_err());
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        let kinds = ResourceKind::parse_list(
            " qixmanager.qlik.com/v1/Engine/engines, ,autoscaling/v2/HorizontalPodAutoscaler/horizontalpodautoscalers,",
        )
        .unwrap();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[1].plural, "horizontalpodautoscalers");
    }

    #[test]
    fn test_tracking_selector() {
        assert_eq!(tracking_selector("qlik-default"), "release=qlik-default");
    }
}
