//! # Kubernetes Client Implementation
//!
//! [`ClusterClient`] and [`DynamicResources`] over `kube::Api`.

use super::{ClusterClient, ClusterError, ClusterResult, DynamicResources, ResourceKind};
use crate::constants::FIELD_MANAGER;
use crate::crd::{Qliksense, QliksenseStatus};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Cluster access backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dynamic_api(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn target(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind} {namespace}/{name}")
}

#[async_trait]
impl DynamicResources for KubeCluster {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<DynamicObject>> {
        let list = self
            .dynamic_api(kind, namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| ClusterError::from_kube(e, kind.to_string()))?;
        Ok(list.items)
    }

    async fn set_owner(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
        owner: OwnerReference,
    ) -> ClusterResult<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        let mut owner_references = object.owner_references().to_vec();
        owner_references.push(owner);

        // resourceVersion makes the merge patch fail on a concurrent write
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": object.resource_version(),
                "ownerReferences": owner_references,
            }
        });
        debug!("Setting owner reference on {} {}/{}", kind, namespace, name);
        self.dynamic_api(kind, &namespace)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, target(&kind.kind, &namespace, &name)))?;
        Ok(())
    }

    async fn delete_all(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
        grace_period_secs: u32,
    ) -> ClusterResult<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period_secs),
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        self.dynamic_api(kind, namespace)
            .delete_collection(&params, &ListParams::default().labels(label_selector))
            .await
            .map_err(|e| ClusterError::from_kube(e, kind.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_qliksense(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Qliksense>> {
        Api::<Qliksense>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Qliksense", namespace, name)))
    }

    async fn replace_qliksense(&self, qliksense: &Qliksense) -> ClusterResult<Qliksense> {
        let name = qliksense.name_any();
        let namespace = qliksense.namespace().unwrap_or_default();
        Api::<Qliksense>::namespaced(self.client.clone(), &namespace)
            .replace(&name, &PostParams::default(), qliksense)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Qliksense", &namespace, &name)))
    }

    async fn patch_qliksense_status(
        &self,
        namespace: &str,
        name: &str,
        status: &QliksenseStatus,
    ) -> ClusterResult<()> {
        let patch = serde_json::json!({ "status": status });
        Api::<Qliksense>::namespaced(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Qliksense", namespace, name)))?;
        Ok(())
    }

    async fn get_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<CronJob>> {
        Api::<CronJob>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("CronJob", namespace, name)))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>> {
        Api::<Job>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Job", namespace, name)))
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()> {
        let namespace = cron_job.namespace().unwrap_or_default();
        Api::<CronJob>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), cron_job)
            .await
            .map_err(|e| {
                ClusterError::from_kube(e, target("CronJob", &namespace, &cron_job.name_any()))
            })?;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> ClusterResult<()> {
        let namespace = job.namespace().unwrap_or_default();
        Api::<Job>::namespaced(self.client.clone(), &namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Job", &namespace, &job.name_any())))?;
        Ok(())
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()> {
        let name = cron_job.name_any();
        let namespace = cron_job.namespace().unwrap_or_default();
        Api::<CronJob>::namespaced(self.client.clone(), &namespace)
            .replace(&name, &PostParams::default(), cron_job)
            .await
            .map_err(|e| ClusterError::from_kube(e, target("CronJob", &namespace, &name)))?;
        Ok(())
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        Api::<CronJob>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| ClusterError::from_kube(e, target("CronJob", namespace, name)))?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        Api::<Job>::namespaced(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| ClusterError::from_kube(e, target("Job", namespace, name)))?;
        Ok(())
    }
}
