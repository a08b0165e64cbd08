//! # Operator Owner
//!
//! Finds the object that ultimately owns the operator pod, usually its
//! Deployment, so objects the operator creates for itself are garbage collected
//! with it. The walk follows controller references upwards from the pod; a pod
//! without a controller owns the objects itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersion;
use kube::{discovery, Client, Resource, ResourceExt};
use tracing::debug;

/// Owner chains longer than this are treated as cycles
const MAX_OWNER_DEPTH: usize = 10;

/// An object in the owner chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    /// Reference to the object itself
    pub reference: OwnerReference,
    /// Its controller, if any
    pub controller: Option<OwnerReference>,
}

/// Read access to objects of any kind in the operator namespace
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn link(&self, api_version: &str, kind: &str, name: &str) -> Result<ChainLink>;
}

/// Walk from the operator pod to the top of its controller chain
pub async fn resolve_operator_owner(
    lookup: &dyn OwnerLookup,
    pod_name: &str,
) -> Result<OwnerReference> {
    let mut current = lookup.link("v1", "Pod", pod_name).await?;
    for _ in 0..MAX_OWNER_DEPTH {
        let Some(parent) = current.controller else {
            let mut owner = current.reference;
            owner.controller = Some(true);
            owner.block_owner_deletion = Some(true);
            return Ok(owner);
        };
        debug!(
            "{} {} is controlled by {} {}",
            current.reference.kind, current.reference.name, parent.kind, parent.name
        );
        current = lookup
            .link(&parent.api_version, &parent.kind, &parent.name)
            .await?;
    }
    anyhow::bail!("Owner chain of pod {pod_name} is deeper than {MAX_OWNER_DEPTH}")
}

/// [`OwnerLookup`] through API discovery and the dynamic client
#[derive(Clone)]
pub struct KubeOwnerLookup {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeOwnerLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeOwnerLookup")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeOwnerLookup {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn link(&self, api_version: &str, kind: &str, name: &str) -> Result<ChainLink> {
        let gvk = api_version
            .parse::<GroupVersion>()
            .with_context(|| format!("Invalid apiVersion '{api_version}'"))?
            .with_kind(kind);
        let (resource, _) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("Failed to discover {api_version}/{kind}"))?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);
        let object = api
            .get(name)
            .await
            .with_context(|| format!("Failed to get {kind} {}/{name}", self.namespace))?;

        let reference = object
            .controller_owner_ref(&resource)
            .with_context(|| format!("{kind} {name} has no uid"))?;
        let controller = object
            .owner_references()
            .iter()
            .find(|r| r.controller == Some(true))
            .cloned();
        Ok(ChainLink {
            reference,
            controller,
        })
    }
}
