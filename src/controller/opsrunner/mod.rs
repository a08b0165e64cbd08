//! # Ops-Runner Lifecycle
//!
//! Keeps at most one ops-runner object per CR in the shape its `opsRunner` block asks for:
//!
//! | `enabled` | `schedule` | object     |
//! |-----------|------------|------------|
//! | falsy     | any        | none       |
//! | truthy    | empty      | `Job`      |
//! | truthy    | non-empty  | `CronJob`  |
//!
//! A kind change deletes the old object before the new one is created. Updates
//! are written only when the operator-owned fields actually differ. A Job's pod
//! template cannot be changed in place, so a drifted Job is deleted and created
//! again.

pub mod spec;

pub use spec::{desired_cron_job, desired_job, runner_name, RunnerPodSettings};

use crate::controller::cluster::{ClusterClient, ClusterError};
use crate::crd::Qliksense;
use crate::observability;
use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::ResourceExt;
use std::fmt;
use tracing::{debug, info};

/// Kind of ops-runner object a CR requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsRunnerKind {
    None,
    OneShot,
    Scheduled,
}

impl fmt::Display for OpsRunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::OneShot => "Job",
            Self::Scheduled => "CronJob",
        })
    }
}

/// Required kind for an `enabled` flag and a schedule
pub fn required_kind(enabled: bool, schedule: &str) -> OpsRunnerKind {
    match (enabled, schedule.trim().is_empty()) {
        (false, _) => OpsRunnerKind::None,
        (true, true) => OpsRunnerKind::OneShot,
        (true, false) => OpsRunnerKind::Scheduled,
    }
}

impl OpsRunnerKind {
    pub fn for_qliksense(qliksense: &Qliksense) -> Self {
        let schedule = qliksense
            .spec
            .ops_runner
            .as_ref()
            .map(|o| o.schedule.as_str())
            .unwrap_or_default();
        required_kind(qliksense.ops_runner_enabled(), schedule)
    }
}

/// The ops-runner object currently in the cluster
#[derive(Debug, Clone, PartialEq)]
pub enum OpsRunnerJob {
    None,
    OneShot(Job),
    Scheduled(CronJob),
}

impl OpsRunnerJob {
    pub fn kind(&self) -> OpsRunnerKind {
        match self {
            Self::None => OpsRunnerKind::None,
            Self::OneShot(_) => OpsRunnerKind::OneShot,
            Self::Scheduled(_) => OpsRunnerKind::Scheduled,
        }
    }
}

/// Look up the CronJob first, then the Job
pub async fn current_job<C>(cluster: &C, namespace: &str, cr_name: &str) -> Result<OpsRunnerJob>
where
    C: ClusterClient + ?Sized,
{
    let name = runner_name(cr_name);
    if let Some(cron_job) = cluster
        .get_cron_job(namespace, &name)
        .await
        .context("Failed to fetch ops-runner CronJob")?
    {
        return Ok(OpsRunnerJob::Scheduled(cron_job));
    }
    if let Some(job) = cluster
        .get_job(namespace, &name)
        .await
        .context("Failed to fetch ops-runner Job")?
    {
        return Ok(OpsRunnerJob::OneShot(job));
    }
    Ok(OpsRunnerJob::None)
}

/// Delete the current object. An object that is already gone counts as deleted.
async fn delete_current<C>(cluster: &C, namespace: &str, current: &OpsRunnerJob) -> Result<()>
where
    C: ClusterClient + ?Sized,
{
    let result = match current {
        OpsRunnerJob::None => return Ok(()),
        OpsRunnerJob::Scheduled(cron_job) => {
            info!("Deleting ops-runner CronJob {}", cron_job.name_any());
            cluster.delete_cron_job(namespace, &cron_job.name_any()).await
        }
        OpsRunnerJob::OneShot(job) => {
            info!("Deleting ops-runner Job {}", job.name_any());
            cluster.delete_job(namespace, &job.name_any()).await
        }
    };
    match result {
        Ok(()) => {
            observability::metrics::increment_ops_runner_operations("delete");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e).context("Failed to delete ops-runner object"),
    }
}

/// Create the required object. Losing a create race is not an error.
async fn create<C>(
    cluster: &C,
    kind: OpsRunnerKind,
    qliksense: &Qliksense,
    settings: &RunnerPodSettings,
) -> Result<()>
where
    C: ClusterClient + ?Sized,
{
    let result = match kind {
        OpsRunnerKind::None => return Ok(()),
        OpsRunnerKind::Scheduled => {
            cluster
                .create_cron_job(&desired_cron_job(qliksense, settings)?)
                .await
        }
        OpsRunnerKind::OneShot => cluster.create_job(&desired_job(qliksense, settings)?).await,
    };
    match result {
        Ok(()) => {
            info!(
                "Created ops-runner {} {}",
                kind,
                runner_name(&qliksense.name_any())
            );
            observability::metrics::increment_ops_runner_operations("create");
            Ok(())
        }
        Err(ClusterError::AlreadyExists(target)) => {
            info!("{} already exists", target);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to create ops-runner {kind}")),
    }
}

/// Bring the existing object in line with the CR, writing only when it drifted
async fn update<C>(
    cluster: &C,
    current: &OpsRunnerJob,
    qliksense: &Qliksense,
    settings: &RunnerPodSettings,
) -> Result<()>
where
    C: ClusterClient + ?Sized,
{
    match current {
        OpsRunnerJob::None => Ok(()),
        OpsRunnerJob::Scheduled(existing) => {
            let mut updated = existing.clone();
            spec::apply_to_cron_job(&mut updated, qliksense, settings)?;
            if updated == *existing {
                debug!("Ops-runner CronJob is up to date");
                return Ok(());
            }
            info!("Updating ops-runner CronJob {}", existing.name_any());
            cluster
                .replace_cron_job(&updated)
                .await
                .context("Failed to update ops-runner CronJob")?;
            observability::metrics::increment_ops_runner_operations("update");
            Ok(())
        }
        OpsRunnerJob::OneShot(existing) => {
            let mut updated = existing.clone();
            spec::apply_to_job(&mut updated, qliksense, settings)?;
            if updated == *existing {
                debug!("Ops-runner Job is up to date");
                return Ok(());
            }
            info!(
                "Ops-runner Job {} drifted, recreating it",
                existing.name_any()
            );
            let namespace = qliksense.namespace().unwrap_or_default();
            delete_current(cluster, &namespace, current).await?;
            create(cluster, OpsRunnerKind::OneShot, qliksense, settings).await
        }
    }
}

/// Converge the ops-runner object of `qliksense` and return the kind now required
pub async fn converge<C>(
    cluster: &C,
    qliksense: &Qliksense,
    settings: &RunnerPodSettings,
) -> Result<OpsRunnerKind>
where
    C: ClusterClient + ?Sized,
{
    let namespace = qliksense.namespace().unwrap_or_default();
    let required = OpsRunnerKind::for_qliksense(qliksense);
    let mut current = current_job(cluster, &namespace, &qliksense.name_any()).await?;
    debug!(
        "Ops-runner current kind: {}, required kind: {}",
        current.kind(),
        required
    );

    if current.kind() != required {
        delete_current(cluster, &namespace, &current).await?;
        current = OpsRunnerJob::None;
    }

    match current {
        OpsRunnerJob::None => create(cluster, required, qliksense, settings).await?,
        _ => update(cluster, &current, qliksense, settings).await?,
    }
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_kind() {
        assert_eq!(required_kind(false, ""), OpsRunnerKind::None);
        assert_eq!(required_kind(false, "*/5 * * * *"), OpsRunnerKind::None);
        assert_eq!(required_kind(true, ""), OpsRunnerKind::OneShot);
        assert_eq!(required_kind(true, "   "), OpsRunnerKind::OneShot);
        assert_eq!(required_kind(true, "*/5 * * * *"), OpsRunnerKind::Scheduled);
    }

    #[test]
    fn test_kind_for_qliksense() {
        use crate::crd::{OpsRunnerSpec, QliksenseSpec};

        let mut q = Qliksense::new("qlik-default", QliksenseSpec::default());
        assert_eq!(OpsRunnerKind::for_qliksense(&q), OpsRunnerKind::None);

        q.spec.ops_runner = Some(OpsRunnerSpec {
            enabled: "true".to_string(),
            schedule: "0 * * * *".to_string(),
            ..OpsRunnerSpec::default()
        });
        assert_eq!(OpsRunnerKind::for_qliksense(&q), OpsRunnerKind::Scheduled);

        q.spec.ops_runner = Some(OpsRunnerSpec {
            enabled: "no".to_string(),
            schedule: "0 * * * *".to_string(),
            ..OpsRunnerSpec::default()
        });
        assert_eq!(OpsRunnerKind::for_qliksense(&q), OpsRunnerKind::None);
    }

    #[test]
    fn test_job_kind() {
        assert_eq!(OpsRunnerJob::None.kind(), OpsRunnerKind::None);
        assert_eq!(OpsRunnerJob::OneShot(Job::default()).kind(), OpsRunnerKind::OneShot);
        assert_eq!(
            OpsRunnerJob::Scheduled(CronJob::default()).kind(),
            OpsRunnerKind::Scheduled
        );
    }
}
