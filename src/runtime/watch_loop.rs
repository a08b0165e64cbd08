//! # Watch Loop
//!
//! Runs the Qliksense controller until a shutdown signal arrives.
//!
//! Besides the Qliksense resources themselves the controller watches:
//!
//! - ops-runner Jobs and CronJobs, through their controller owner reference
//! - objects carrying the `release` label, mapped back to the CR of that name

use crate::constants::TRACKING_LABEL;
use crate::controller::reconciler::{reconcile, Reconciler};
use crate::controller::server::ServerState;
use crate::crd::Qliksense;
use crate::runtime::error_policy::handle_reconciliation_error;
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher::Config as WatcherConfig;
use kube_runtime::Controller;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Map a tracked object to the Qliksense named by its `release` label
pub fn release_ref<K>(object: K) -> Option<ObjectRef<Qliksense>>
where
    K: Resource,
{
    let release = object.labels().get(TRACKING_LABEL)?;
    if release.is_empty() {
        return None;
    }
    let namespace = object.namespace()?;
    Some(ObjectRef::new(release).within(&namespace))
}

fn tracked() -> WatcherConfig {
    WatcherConfig::default().labels(TRACKING_LABEL)
}

/// Run the controller until SIGINT/SIGTERM
pub async fn run_watch_loop(
    qliksenses: Api<Qliksense>,
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<()> {
    info!("Watching Qliksense resources in all namespaces");

    Controller::new(qliksenses, WatcherConfig::default())
        .owns(Api::<Job>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<CronJob>::all(client.clone()), WatcherConfig::default())
        .watches(Api::<Deployment>::all(client.clone()), tracked(), release_ref)
        .watches(Api::<StatefulSet>::all(client.clone()), tracked(), release_ref)
        .watches(Api::<Service>::all(client.clone()), tracked(), release_ref)
        .watches(Api::<ConfigMap>::all(client.clone()), tracked(), release_ref)
        .watches(Api::<Secret>::all(client.clone()), tracked(), release_ref)
        .watches(Api::<Ingress>::all(client), tracked(), release_ref)
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => debug!("Reconciled {}: {:?}", object, action),
                Err(e) => warn!("Controller error: {}", e),
            }
        })
        .await;

    server_state.is_ready.store(false, Ordering::Relaxed);
    info!("Controller stopped");
    Ok(())
}
