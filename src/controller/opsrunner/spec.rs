//! # Ops-Runner Object Construction
//!
//! Deterministic construction of the ops-runner Job/CronJob from a CR.
//!
//! The `apply_*` functions write only the fields the operator owns into an
//! object, leaving everything else (server defaults, extra labels, extra env
//! vars) untouched. Desired objects are built by applying onto an empty object;
//! updates apply onto a copy of the live object and compare.

use crate::config::OperatorConfig;
use crate::constants::{
    ENV_OPERATOR_SERVICE_NAME, ENV_OPERATOR_SERVICE_PORT, ENV_YAML_CONF, OPS_RUNNER_NAME_SUFFIX,
    PULL_SECRET_NAME, TRACKING_LABEL,
};
use crate::crd::Qliksense;
use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Pod settings that come from operator configuration rather than the CR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerPodSettings {
    pub image_pull_policy: String,
    pub restart_policy: String,
    /// Service the runner calls back to for manifest builds
    pub operator_service_name: String,
    pub operator_service_port: u16,
}

impl RunnerPodSettings {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            image_pull_policy: config.ops_runner.image_pull_policy.clone(),
            restart_policy: config.ops_runner.restart_policy.clone(),
            operator_service_name: config.build_service_name(),
            operator_service_port: config.build_service_port,
        }
    }
}

/// Name of the ops-runner object (and its container) for a CR
pub fn runner_name(cr_name: &str) -> String {
    format!("{cr_name}{OPS_RUNNER_NAME_SUFFIX}")
}

/// Point `image` at `registry`, keeping only its last path segment
///
/// `qlik-docker-oss.bintray.io/qliksense-repo-watcher:v1` with registry
/// `registry.example.com/qlik` becomes `registry.example.com/qlik/qliksense-repo-watcher:v1`.
pub fn rewrite_image_registry(image: &str, registry: &str) -> String {
    let name_and_tag = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{}", registry.trim_end_matches('/'), name_and_tag)
}

/// Merge `desired` into `env` by name: values of present vars are replaced,
/// missing vars are appended, other vars are kept.
pub fn merge_env(env: &mut Vec<EnvVar>, desired: Vec<EnvVar>) {
    for var in desired {
        match env.iter_mut().find(|present| present.name == var.name) {
            Some(present) => {
                present.value = var.value;
                present.value_from = var.value_from;
            }
            None => env.push(var),
        }
    }
}

/// Environment contract of the runner container
pub fn desired_env(qliksense: &Qliksense, settings: &RunnerPodSettings) -> Result<Vec<EnvVar>> {
    let yaml_conf = qliksense
        .to_runner_yaml()
        .context("Failed to render Qliksense as YAML")?;
    Ok(vec![
        env_var(ENV_YAML_CONF, yaml_conf),
        env_var(ENV_OPERATOR_SERVICE_NAME, settings.operator_service_name.clone()),
        env_var(ENV_OPERATOR_SERVICE_PORT, settings.operator_service_port.to_string()),
    ])
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

/// Write the runner container and pod-level settings into `pod_spec`
pub fn apply_pod_spec(
    pod_spec: &mut PodSpec,
    qliksense: &Qliksense,
    settings: &RunnerPodSettings,
) -> Result<()> {
    let env = desired_env(qliksense, settings)?;
    let image = qliksense
        .spec
        .ops_runner
        .as_ref()
        .map(|o| o.image.clone())
        .unwrap_or_default();

    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container::default());
    }
    let container = &mut pod_spec.containers[0];
    container.name = runner_name(&qliksense.name_any());
    container.image = Some(image);
    container.image_pull_policy = Some(settings.image_pull_policy.clone());
    merge_env(container.env.get_or_insert_with(Vec::new), env);
    pod_spec.restart_policy = Some(settings.restart_policy.clone());

    let registry = qliksense.spec.image_registry.trim();
    if !registry.is_empty() {
        let container = &mut pod_spec.containers[0];
        if let Some(image) = container.image.as_deref().filter(|i| !i.is_empty()) {
            container.image = Some(rewrite_image_registry(image, registry));
            pod_spec.image_pull_secrets = Some(vec![LocalObjectReference {
                name: PULL_SECRET_NAME.to_string(),
            }]);
        }
    }
    Ok(())
}

/// Identity, tracking label and controller owner reference
pub fn apply_metadata(meta: &mut ObjectMeta, qliksense: &Qliksense) -> Result<()> {
    let name = qliksense.name_any();
    meta.name = Some(runner_name(&name));
    meta.namespace = qliksense.namespace();
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(TRACKING_LABEL.to_string(), name.clone());

    let owner = qliksense
        .controller_owner_ref(&())
        .with_context(|| format!("Qliksense {name} has no uid to own the ops runner"))?;
    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == owner.uid) {
        owners.push(owner);
    }
    Ok(())
}

/// Label pods so they are selected by the tracking label during teardown
fn apply_pod_labels(meta: &mut Option<ObjectMeta>, qliksense: &Qliksense) {
    meta.get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(TRACKING_LABEL.to_string(), qliksense.name_any());
}

fn apply_job_spec(job_spec: &mut JobSpec, qliksense: &Qliksense, settings: &RunnerPodSettings) -> Result<()> {
    apply_pod_labels(&mut job_spec.template.metadata, qliksense);
    apply_pod_spec(
        job_spec.template.spec.get_or_insert_with(PodSpec::default),
        qliksense,
        settings,
    )
}

pub fn apply_to_cron_job(
    cron_job: &mut CronJob,
    qliksense: &Qliksense,
    settings: &RunnerPodSettings,
) -> Result<()> {
    apply_metadata(&mut cron_job.metadata, qliksense)?;
    let schedule = qliksense
        .spec
        .ops_runner
        .as_ref()
        .map(|o| o.schedule.clone())
        .unwrap_or_default();
    let spec = cron_job.spec.get_or_insert_with(CronJobSpec::default);
    spec.schedule = schedule;
    apply_job_spec(
        spec.job_template.spec.get_or_insert_with(JobSpec::default),
        qliksense,
        settings,
    )
}

pub fn apply_to_job(job: &mut Job, qliksense: &Qliksense, settings: &RunnerPodSettings) -> Result<()> {
    apply_metadata(&mut job.metadata, qliksense)?;
    apply_job_spec(
        job.spec.get_or_insert_with(JobSpec::default),
        qliksense,
        settings,
    )
}

pub fn desired_cron_job(qliksense: &Qliksense, settings: &RunnerPodSettings) -> Result<CronJob> {
    let mut cron_job = CronJob::default();
    apply_to_cron_job(&mut cron_job, qliksense, settings)?;
    Ok(cron_job)
}

pub fn desired_job(qliksense: &Qliksense, settings: &RunnerPodSettings) -> Result<Job> {
    let mut job = Job::default();
    apply_to_job(&mut job, qliksense, settings)?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{OpsRunnerSpec, QliksenseSpec};

    fn settings() -> RunnerPodSettings {
        RunnerPodSettings {
            image_pull_policy: "Always".to_string(),
            restart_policy: "OnFailure".to_string(),
            operator_service_name: "qliksense-operator-kuztomize".to_string(),
            operator_service_port: 7000,
        }
    }

    fn qliksense(schedule: &str, registry: &str) -> Qliksense {
        let mut q = Qliksense::new(
            "qlik-default",
            QliksenseSpec {
                image_registry: registry.to_string(),
                ops_runner: Some(OpsRunnerSpec {
                    enabled: "yes".to_string(),
                    schedule: schedule.to_string(),
                    watch_branch: "master".to_string(),
                    image: "qlik-docker-oss.bintray.io/qliksense-repo-watcher:v1".to_string(),
                }),
                ..QliksenseSpec::default()
            },
        );
        q.metadata.namespace = Some("default".to_string());
        q.metadata.uid = Some("0b5c7c41-uid".to_string());
        q
    }

    fn container(pod: &PodSpec) -> &Container {
        &pod.containers[0]
    }

    fn env_value<'a>(pod: &'a PodSpec, name: &str) -> Option<&'a str> {
        container(pod)
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn test_rewrite_image_registry() {
        assert_eq!(
            rewrite_image_registry("qlik-docker-oss.bintray.io/qliksense-repo-watcher:v1", "my.registry/qlik"),
            "my.registry/qlik/qliksense-repo-watcher:v1"
        );
        assert_eq!(rewrite_image_registry("runner:latest", "my.registry/"), "my.registry/runner:latest");
    }

    #[test]
    fn test_merge_env_replaces_and_appends() {
        let mut env = vec![
            EnvVar {
                name: "KEEP".to_string(),
                value: Some("1".to_string()),
                value_from: None,
            },
            EnvVar {
                name: ENV_YAML_CONF.to_string(),
                value: Some("old".to_string()),
                value_from: None,
            },
        ];
        merge_env(
            &mut env,
            vec![env_var(ENV_YAML_CONF, "new".to_string()), env_var("ADDED", "2".to_string())],
        );
        let pairs: Vec<_> = env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(pairs, vec![("KEEP", "1"), (ENV_YAML_CONF, "new"), ("ADDED", "2")]);
    }

    #[test]
    fn test_desired_cron_job() {
        let q = qliksense("*/10 * * * *", "");
        let cron_job = desired_cron_job(&q, &settings()).unwrap();

        assert_eq!(cron_job.metadata.name.as_deref(), Some("qlik-default-ops-runner"));
        assert_eq!(cron_job.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(cron_job.labels()["release"], "qlik-default");
        let owners = cron_job.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "0b5c7c41-uid");
        assert_eq!(owners[0].controller, Some(true));

        let spec = cron_job.spec.as_ref().unwrap();
        assert_eq!(spec.schedule, "*/10 * * * *");
        let template = &spec.job_template.spec.as_ref().unwrap().template;
        assert_eq!(
            template.metadata.as_ref().unwrap().labels.as_ref().unwrap()["release"],
            "qlik-default"
        );
        let pod = template.spec.as_ref().unwrap();
        assert_eq!(container(pod).name, "qlik-default-ops-runner");
        assert_eq!(
            container(pod).image.as_deref(),
            Some("qlik-docker-oss.bintray.io/qliksense-repo-watcher:v1")
        );
        assert_eq!(container(pod).image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert!(pod.image_pull_secrets.is_none());
        assert_eq!(
            env_value(pod, ENV_OPERATOR_SERVICE_NAME),
            Some("qliksense-operator-kuztomize")
        );
        assert_eq!(env_value(pod, ENV_OPERATOR_SERVICE_PORT), Some("7000"));
        assert!(env_value(pod, ENV_YAML_CONF).unwrap().contains("qlik-default"));
    }

    #[test]
    fn test_desired_job_with_image_registry() {
        let q = qliksense("", "my.registry/qlik");
        let job = desired_job(&q, &settings()).unwrap();
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            container(pod).image.as_deref(),
            Some("my.registry/qlik/qliksense-repo-watcher:v1")
        );
        let secrets = pod.image_pull_secrets.as_ref().unwrap();
        assert_eq!(secrets[0].name, "artifactory-docker-secret");
    }

    #[test]
    fn test_apply_is_stable_on_desired_object() {
        let q = qliksense("*/5 * * * *", "my.registry");
        let desired = desired_cron_job(&q, &settings()).unwrap();
        let mut again = desired.clone();
        apply_to_cron_job(&mut again, &q, &settings()).unwrap();
        assert_eq!(again, desired);
    }

    #[test]
    fn test_apply_keeps_foreign_fields() {
        let q = qliksense("", "");
        let mut job = desired_job(&q, &settings()).unwrap();
        job.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "qlik".to_string());
        let pod = job.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.dns_policy = Some("ClusterFirst".to_string());

        let before = job.clone();
        apply_to_job(&mut job, &q, &settings()).unwrap();
        assert_eq!(job, before);
    }

    #[test]
    fn test_missing_uid_is_an_error() {
        let mut q = qliksense("", "");
        q.metadata.uid = None;
        assert!(desired_job(&q, &settings()).is_err());
    }
}
