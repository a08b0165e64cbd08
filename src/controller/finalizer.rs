//! # Finalization
//!
//! Teardown of a Qliksense installation before its CR is released.
//!
//! Every step is best effort: failures are logged and the sequence continues, so
//! a broken cluster never keeps the CR from being deleted. The only wait is the
//! pod drain, bounded by [`FinalizationConfig::max_wait`].

use crate::config::FinalizationConfig;
use crate::constants::DELETE_GRACE_PERIOD_SECS;
use crate::controller::cluster::{tracking_selector, DynamicResources, ResourceKind};
use crate::controller::registry::InstanceRegistry;
use crate::crd::Qliksense;
use crate::observability;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Result of a finalization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationOutcome {
    /// All tracked pods were gone before the deadline
    pub drained: bool,
    pub waited: Duration,
}

/// Kinds bulk-deleted during teardown, in order. Pods come last.
pub fn teardown_kinds(dynamic_kinds: &[ResourceKind]) -> Vec<ResourceKind> {
    let mut kinds = vec![
        ResourceKind::of::<Deployment>(),
        ResourceKind::of::<StatefulSet>(),
        ResourceKind::of::<CronJob>(),
        ResourceKind::of::<Job>(),
    ];
    kinds.extend(dynamic_kinds.iter().cloned());
    kinds.push(ResourceKind::of::<Pod>());
    kinds
}

/// Tear down everything tracked by `qliksense` and wait for its pods to drain
pub async fn finalize<C>(
    cluster: &C,
    registry: &InstanceRegistry,
    qliksense: &Qliksense,
    dynamic_kinds: &[ResourceKind],
    config: &FinalizationConfig,
) -> FinalizationOutcome
where
    C: DynamicResources + ?Sized,
{
    let name = qliksense.name_any();
    let namespace = qliksense.namespace().unwrap_or_default();
    let span = info_span!(
        "qliksense.finalize",
        resource.name = %name,
        resource.namespace = %namespace
    );

    async {
        info!("Finalizing {}", name);
        if registry.remove(&name).await.is_some() {
            info!("Removed manifests of {}", name);
        }

        let selector = tracking_selector(&name);
        for kind in teardown_kinds(dynamic_kinds) {
            match cluster
                .delete_all(&kind, &namespace, &selector, DELETE_GRACE_PERIOD_SECS)
                .await
            {
                Ok(()) => debug!("Deleted {} with {}", kind, selector),
                Err(e) if e.is_not_found() => debug!("{} is not installed, nothing to delete", kind),
                Err(e) => warn!("Failed to delete {}: {}, continuing", kind, e),
            }
        }

        let outcome = wait_for_pods(cluster, &namespace, &selector, config).await;
        if outcome.drained {
            info!("Finalized {} after {:?}", name, outcome.waited);
        } else {
            warn!(
                "Pods of {} still present after {:?}, finalizing anyway",
                name, outcome.waited
            );
        }
        observability::metrics::increment_finalizations();
        outcome
    }
    .instrument(span)
    .await
}

async fn wait_for_pods<C>(
    cluster: &C,
    namespace: &str,
    selector: &str,
    config: &FinalizationConfig,
) -> FinalizationOutcome
where
    C: DynamicResources + ?Sized,
{
    let pods = ResourceKind::of::<Pod>();
    let start = Instant::now();
    let deadline = start + config.max_wait;

    loop {
        match cluster.list(&pods, namespace, selector).await {
            Ok(remaining) if remaining.is_empty() => {
                return FinalizationOutcome {
                    drained: true,
                    waited: start.elapsed(),
                };
            }
            Ok(remaining) => {
                info!("Waiting for {} pod(s) to terminate", remaining.len());
            }
            Err(e) => warn!("Failed to list pods: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            return FinalizationOutcome {
                drained: false,
                waited: start.elapsed(),
            };
        }
        tokio::time::sleep(config.poll_interval.min(deadline - now)).await;
    }
}
