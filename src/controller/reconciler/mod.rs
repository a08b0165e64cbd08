//! # Reconciler
//!
//! Drives one Qliksense resource towards its declared state.
//!
//! A reconciliation re-reads the resource, then:
//!
//! 1. Marks it `Initialized` (once)
//! 2. Finalizes it when it is being deleted and carries our finalizer
//! 3. Installs its manifests when it is in git mode and nothing is installed yet
//! 4. Converges the ops-runner Job/CronJob
//! 5. Takes ownership of every tracked object
//! 6. Adds the finalizer
//!
//! Every step is idempotent, so a reconciliation interrupted by an error is simply
//! retried from the top. Condition changes are collected and written once.

mod status;
mod types;

pub use status::StatusTracker;
pub use types::{BackoffState, Reconciler, ReconcilerError};

use crate::constants::{DEFAULT_RESYNC_INTERVAL_SECS, QLIKSENSE_FINALIZER};
use crate::controller::{finalizer, install, opsrunner, owner};
use crate::crd::condition_types::{CLI_MODE, ERROR, GIT_MODE, INITIALIZED, OPS_RUNNER_MODE};
use crate::crd::{Condition, Qliksense};
use crate::observability;
use anyhow::{Context, Result};
use kube_runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Reconcile entry point handed to the controller runtime
pub async fn reconcile(
    qliksense: Arc<Qliksense>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = qliksense.name_any();
    let namespace = qliksense.namespace().unwrap_or_default();
    let span = info_span!(
        "reconcile",
        resource.name = %name,
        resource.namespace = %namespace
    );

    async move {
        let start = Instant::now();
        observability::metrics::increment_reconciliations();

        let result = reconcile_named(&ctx, &namespace, &name).await;
        observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        match result {
            Ok(action) => {
                ctx.reset_backoff(&format!("{namespace}/{name}"));
                Ok(action)
            }
            Err(e) => Err(ReconcilerError::ReconciliationFailed(e)),
        }
    }
    .instrument(span)
    .await
}

async fn reconcile_named(ctx: &Reconciler, namespace: &str, name: &str) -> Result<Action> {
    // The cached object may be stale; act on what the API server has now
    let Some(qliksense) = ctx
        .cluster
        .get_qliksense(namespace, name)
        .await
        .with_context(|| format!("Failed to get Qliksense {namespace}/{name}"))?
    else {
        debug!("Qliksense {}/{} no longer exists", namespace, name);
        return Ok(Action::await_change());
    };

    let mut tracker = StatusTracker::new(&qliksense);
    tracker.ensure(Condition::new(INITIALIZED, true).with_reason("Initialized"));

    if qliksense.is_being_deleted() {
        if qliksense.has_finalizer() {
            // Last chance to write status; the CR goes away with the finalizer
            tracker.persist(ctx.cluster.as_ref(), &qliksense).await?;
            finalize(ctx, &qliksense).await?;
        } else {
            debug!("{} is being deleted without our finalizer, nothing to do", name);
        }
        return Ok(Action::await_change());
    }

    match reconcile_live(ctx, qliksense.clone(), &mut tracker).await {
        Ok(qliksense) => {
            tracker.remove(ERROR);
            // Replace is guarded by resource version, so it goes before the status patch
            let qliksense = ensure_finalizer(ctx, qliksense).await?;
            tracker.persist(ctx.cluster.as_ref(), &qliksense).await?;
            debug!(
                "Reconciled {}, next resync in {}s",
                name, DEFAULT_RESYNC_INTERVAL_SECS
            );
            Ok(Action::requeue(Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS)))
        }
        Err(e) => {
            tracker.set(
                Condition::new(ERROR, true)
                    .with_reason("ReconcileFailed")
                    .with_message(format!("{e:#}")),
            );
            if let Err(status_err) = tracker.persist(ctx.cluster.as_ref(), &qliksense).await {
                warn!("Failed to record error condition on {}: {:#}", name, status_err);
            }
            Err(e)
        }
    }
}

/// Steps 3 to 5 on a live resource. Returns the latest copy of the resource.
async fn reconcile_live(
    ctx: &Reconciler,
    mut qliksense: Qliksense,
    tracker: &mut StatusTracker,
) -> Result<Qliksense> {
    let name = qliksense.name_any();

    if let Some(repository) = qliksense.git_repository() {
        debug!("{} is in git mode ({})", name, repository);
        let entry = ctx.registry.get_or_create(&qliksense).await?;

        if !install::is_installed(ctx.cluster.as_ref(), &qliksense).await? {
            install::install(ctx.builder.as_ref(), ctx.applier.as_ref(), &entry, &qliksense)
                .await?;
            qliksense = clear_rotate_keys(ctx, qliksense).await?;
        }

        tracker.set(Condition::new(GIT_MODE, true).with_reason("GitRepository"));
        tracker.remove(CLI_MODE);
    } else {
        tracker.set(Condition::new(CLI_MODE, true).with_reason("NoGitRepository"));
        tracker.remove(GIT_MODE);
    }

    let kind = opsrunner::converge(ctx.cluster.as_ref(), &qliksense, &ctx.runner_settings).await?;
    if qliksense.ops_runner_enabled() {
        tracker.set(Condition::new(OPS_RUNNER_MODE, true).with_reason(kind.to_string()));
    } else {
        tracker.remove(OPS_RUNNER_MODE);
    }

    let updated =
        owner::reconcile_owners(ctx.cluster.as_ref(), &qliksense, &ctx.config.dynamic_resources)
            .await?;
    if updated > 0 {
        info!("Set owner reference on {} objects of {}", updated, name);
    }

    Ok(qliksense)
}

/// Rotation is one-shot: once the install consumed the request it is reset
async fn clear_rotate_keys(ctx: &Reconciler, mut qliksense: Qliksense) -> Result<Qliksense> {
    if qliksense.spec.rotate_keys.is_empty() || qliksense.spec.rotate_keys == "no" {
        return Ok(qliksense);
    }
    qliksense.spec.rotate_keys = "no".to_string();
    ctx.cluster
        .replace_qliksense(&qliksense)
        .await
        .context("Failed to clear rotateKeys")
}

async fn ensure_finalizer(ctx: &Reconciler, mut qliksense: Qliksense) -> Result<Qliksense> {
    if qliksense.has_finalizer() {
        return Ok(qliksense);
    }
    qliksense
        .finalizers_mut()
        .push(QLIKSENSE_FINALIZER.to_string());
    let updated = ctx
        .cluster
        .replace_qliksense(&qliksense)
        .await
        .context("Failed to add finalizer")?;
    info!("Added finalizer to {}", qliksense.name_any());
    Ok(updated)
}

async fn finalize(ctx: &Reconciler, qliksense: &Qliksense) -> Result<()> {
    let name = qliksense.name_any();
    // Bounded; stuck pods do not keep the finalizer in place
    finalizer::finalize(
        ctx.cluster.as_ref(),
        &ctx.registry,
        qliksense,
        &ctx.config.dynamic_resources,
        &ctx.config.finalization,
    )
    .await;

    // The status patch and the cleanup moved the resource version on
    let namespace = qliksense.namespace().unwrap_or_default();
    let Some(mut updated) = ctx
        .cluster
        .get_qliksense(&namespace, &name)
        .await
        .with_context(|| format!("Failed to get Qliksense {namespace}/{name}"))?
    else {
        return Ok(());
    };
    updated
        .finalizers_mut()
        .retain(|f| f != QLIKSENSE_FINALIZER);
    match ctx.cluster.replace_qliksense(&updated).await {
        Ok(_) => {
            info!("Removed finalizer from {}", name);
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e).context("Failed to remove finalizer"),
    }
}
