//! # Owner Reconciler
//!
//! Parents every object carrying a CR's tracking label to that CR so the
//! garbage collector removes it with the CR.
//!
//! Objects already owned by the CR are left alone, which makes a second pass
//! over an unchanged cluster write nothing. Objects controlled by something else
//! are never taken over.

use crate::controller::cluster::{tracking_selector, DynamicResources, ResourceKind};
use crate::crd::Qliksense;
use crate::observability;
use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

/// Built-in kinds the operator parents
pub fn owned_kinds() -> Vec<ResourceKind> {
    vec![
        ResourceKind::of::<Service>(),
        ResourceKind::of::<Deployment>(),
        ResourceKind::of::<StatefulSet>(),
        ResourceKind::of::<ConfigMap>(),
        ResourceKind::of::<Secret>(),
        ResourceKind::of::<PersistentVolumeClaim>(),
        ResourceKind::of::<CronJob>(),
        ResourceKind::of::<ServiceAccount>(),
        ResourceKind::of::<Role>(),
        ResourceKind::of::<RoleBinding>(),
        ResourceKind::of::<NetworkPolicy>(),
        ResourceKind::of::<Ingress>(),
    ]
}

/// What to do with one listed object
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ownership {
    /// Already points at the CR
    Owned,
    /// Controlled by another owner (uid given)
    Foreign(String),
    Missing,
}

fn ownership(object: &DynamicObject, owner_uid: &str) -> Ownership {
    let refs = object.owner_references();
    if refs.iter().any(|r| r.uid == owner_uid) {
        return Ownership::Owned;
    }
    match refs.iter().find(|r| r.controller == Some(true)) {
        Some(controller) => Ownership::Foreign(controller.uid.clone()),
        None => Ownership::Missing,
    }
}

/// Set the CR as controller owner of everything it tracks across `owned_kinds()`
/// and `dynamic_kinds`. Returns the number of objects written.
///
/// A dynamic kind whose CRD is not installed is skipped. Any other failure stops
/// the pass and is returned.
pub async fn reconcile_owners<C>(
    cluster: &C,
    qliksense: &Qliksense,
    dynamic_kinds: &[ResourceKind],
) -> Result<usize>
where
    C: DynamicResources + ?Sized,
{
    let name = qliksense.name_any();
    let namespace = qliksense.namespace().unwrap_or_default();
    let owner: OwnerReference = qliksense
        .controller_owner_ref(&())
        .with_context(|| format!("Qliksense {name} has no uid to own resources"))?;
    let selector = tracking_selector(&name);

    let builtin = owned_kinds();
    let mut updated = 0;

    for kind in builtin.iter().chain(dynamic_kinds) {
        let is_dynamic = !builtin.contains(kind);
        let objects = match cluster.list(kind, &namespace, &selector).await {
            Ok(objects) => objects,
            Err(e) if is_dynamic && e.is_not_found() => {
                debug!("{} is not installed in the cluster, skipping", kind);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to list {kind}")),
        };

        for object in &objects {
            match ownership(object, &owner.uid) {
                Ownership::Owned => {}
                Ownership::Foreign(uid) => {
                    warn!(
                        "{} {}/{} is controlled by {}, not taking ownership",
                        kind.kind,
                        namespace,
                        object.name_any(),
                        uid
                    );
                }
                Ownership::Missing => {
                    cluster
                        .set_owner(kind, object, owner.clone())
                        .await
                        .with_context(|| {
                            format!("Failed to set owner of {} {}", kind.kind, object.name_any())
                        })?;
                    debug!("Set owner of {} {}/{}", kind.kind, namespace, object.name_any());
                    updated += 1;
                }
            }
        }
    }

    if updated > 0 {
        info!("Set {} owner reference(s) to {}", updated, name);
        observability::metrics::increment_owner_references_set(updated);
    }
    Ok(updated)
}
