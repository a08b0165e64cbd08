//! In-memory stand-ins for the cluster, the manifest source, the builder and the
//! applier, shared by the integration tests.

#![allow(dead_code, reason = "Each test binary uses a different subset")]

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use serde_json::json;
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use qliksense_operator::config::{FinalizationConfig, OperatorConfig};
use qliksense_operator::controller::acquisition::ManifestSource;
use qliksense_operator::controller::cluster::{
    ClusterClient, ClusterError, ClusterResult, DynamicResources, ResourceKind,
};
use qliksense_operator::controller::install::{ManifestApplier, ManifestBuilder};
use qliksense_operator::controller::kustomize::{ejson, write_overlay_patches, KeyGenerator};
use qliksense_operator::controller::reconciler::Reconciler;
use qliksense_operator::crd::{GitSource, OpsRunnerSpec, Qliksense, QliksenseSpec, QliksenseStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "qlik";

/// Write counters, one per mutating call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Writes {
    pub set_owner: usize,
    pub delete_all: usize,
    pub qliksense_replaces: usize,
    pub status_patches: usize,
    pub cron_job_creates: usize,
    pub cron_job_replaces: usize,
    pub cron_job_deletes: usize,
    pub job_creates: usize,
    pub job_deletes: usize,
}

impl Writes {
    pub fn total(&self) -> usize {
        self.set_owner
            + self.delete_all
            + self.qliksense_replaces
            + self.status_patches
            + self.cron_job_creates
            + self.cron_job_replaces
            + self.cron_job_deletes
            + self.job_creates
            + self.job_deletes
    }
}

type Key = (String, String);

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKind, Vec<DynamicObject>>,
    missing_kinds: HashSet<ResourceKind>,
    qliksenses: HashMap<Key, Qliksense>,
    cron_jobs: HashMap<Key, CronJob>,
    jobs: HashMap<Key, Job>,
    writes: Writes,
    fail_set_owner: bool,
    sticky_pods: bool,
    lose_create_races: bool,
    resource_version: u64,
    last_status: Option<QliksenseStatus>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory cluster
///
/// Qliksense replaces are guarded by resource version the way the API server
/// guards them, and the status is only writable through the status patch.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(object: &DynamicObject, namespace: &str, selector: &str) -> bool {
    if object.namespace().as_deref() != Some(namespace) {
        return false;
    }
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => object.labels().get(k).is_some_and(|value| value == v),
        None => object.labels().contains_key(term),
    })
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Writes {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn reset_writes(&self) {
        self.state.lock().unwrap().writes = Writes::default();
    }

    pub fn insert_qliksense(&self, mut qliksense: Qliksense) {
        let mut state = self.state.lock().unwrap();
        qliksense.metadata.resource_version = Some(state.next_version());
        let k = key(&qliksense.namespace().unwrap_or_default(), &qliksense.name_any());
        state.qliksenses.insert(k, qliksense);
    }

    pub fn qliksense(&self, name: &str) -> Option<Qliksense> {
        self.state.lock().unwrap().qliksenses.get(&key(NAMESPACE, name)).cloned()
    }

    /// Mark the CR deleted the way the API server does when finalizers are present
    pub fn mark_deleted(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(q) = state.qliksenses.get_mut(&key(NAMESPACE, name)) {
            let deleted_at: Time = serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
            q.metadata.deletion_timestamp = Some(deleted_at);
            q.metadata.resource_version = Some(version);
        }
    }

    pub fn insert_object(&self, kind: &ResourceKind, object: DynamicObject) {
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(kind.clone())
            .or_default()
            .push(object);
    }

    pub fn objects(&self, kind: &ResourceKind) -> Vec<DynamicObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the kind behave as if its CRD were not installed
    pub fn remove_kind(&self, kind: &ResourceKind) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(kind);
        state.missing_kinds.insert(kind.clone());
    }

    /// Drop every object of the kind, as an uninstall would
    pub fn clear_objects(&self, kind: &ResourceKind) {
        self.state.lock().unwrap().objects.remove(kind);
    }

    /// Status carried by the most recent status patch
    pub fn last_status_patch(&self) -> Option<QliksenseStatus> {
        self.state.lock().unwrap().last_status.clone()
    }

    pub fn fail_set_owner(&self, fail: bool) {
        self.state.lock().unwrap().fail_set_owner = fail;
    }

    /// Creates fail with AlreadyExists as if another writer got there first
    pub fn lose_create_races(&self, lose: bool) {
        self.state.lock().unwrap().lose_create_races = lose;
    }

    /// Pods survive bulk deletion
    pub fn sticky_pods(&self, sticky: bool) {
        self.state.lock().unwrap().sticky_pods = sticky;
    }

    pub fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.state.lock().unwrap().cron_jobs.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn insert_cron_job(&self, cron_job: CronJob) {
        let k = key(&cron_job.namespace().unwrap_or_default(), &cron_job.name_any());
        self.state.lock().unwrap().cron_jobs.insert(k, cron_job);
    }

    pub fn insert_job(&self, job: Job) {
        let k = key(&job.namespace().unwrap_or_default(), &job.name_any());
        self.state.lock().unwrap().jobs.insert(k, job);
    }
}

#[async_trait]
impl DynamicResources for FakeCluster {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<DynamicObject>> {
        let state = self.state.lock().unwrap();
        if state.missing_kinds.contains(kind) {
            return Err(ClusterError::NotFound(kind.to_string()));
        }
        Ok(state
            .objects
            .get(kind)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| matches_selector(o, namespace, label_selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_owner(
        &self,
        kind: &ResourceKind,
        object: &DynamicObject,
        owner: OwnerReference,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_set_owner {
            return Err(ClusterError::Conflict(object.name_any()));
        }
        let stored = state
            .objects
            .get_mut(kind)
            .and_then(|objects| {
                objects.iter_mut().find(|o| {
                    o.name_any() == object.name_any() && o.namespace() == object.namespace()
                })
            })
            .ok_or_else(|| ClusterError::NotFound(object.name_any()))?;
        stored.owner_references_mut().push(owner);
        state.writes.set_owner += 1;
        Ok(())
    }

    async fn delete_all(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        label_selector: &str,
        _grace_period_secs: u32,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.missing_kinds.contains(kind) {
            return Err(ClusterError::NotFound(kind.to_string()));
        }
        state.writes.delete_all += 1;
        if state.sticky_pods && *kind == ResourceKind::of::<Pod>() {
            return Ok(());
        }
        if let Some(objects) = state.objects.get_mut(kind) {
            objects.retain(|o| !matches_selector(o, namespace, label_selector));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_qliksense(&self, namespace: &str, name: &str) -> ClusterResult<Option<Qliksense>> {
        Ok(self.state.lock().unwrap().qliksenses.get(&key(namespace, name)).cloned())
    }

    async fn replace_qliksense(&self, qliksense: &Qliksense) -> ClusterResult<Qliksense> {
        let mut state = self.state.lock().unwrap();
        let k = key(&qliksense.namespace().unwrap_or_default(), &qliksense.name_any());
        let Some(stored) = state.qliksenses.get(&k).cloned() else {
            return Err(ClusterError::NotFound(qliksense.name_any()));
        };
        if stored.metadata.resource_version != qliksense.metadata.resource_version {
            return Err(ClusterError::Conflict(qliksense.name_any()));
        }
        state.writes.qliksense_replaces += 1;

        let mut updated = qliksense.clone();
        updated.status = stored.status;
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.qliksenses.remove(&k);
            return Ok(updated);
        }
        updated.metadata.resource_version = Some(state.next_version());
        state.qliksenses.insert(k, updated.clone());
        Ok(updated)
    }

    async fn patch_qliksense_status(
        &self,
        namespace: &str,
        name: &str,
        status: &QliksenseStatus,
    ) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let stored = state
            .qliksenses
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        state.writes.status_patches += 1;
        state.last_status = Some(status.clone());
        Ok(())
    }

    async fn get_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<CronJob>> {
        Ok(self.state.lock().unwrap().cron_jobs.get(&key(namespace, name)).cloned())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>> {
        Ok(self.state.lock().unwrap().jobs.get(&key(namespace, name)).cloned())
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        let k = key(&cron_job.namespace().unwrap_or_default(), &cron_job.name_any());
        if state.lose_create_races || state.cron_jobs.contains_key(&k) {
            return Err(ClusterError::AlreadyExists(cron_job.name_any()));
        }
        state.cron_jobs.insert(k, cron_job.clone());
        state.writes.cron_job_creates += 1;
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        let k = key(&job.namespace().unwrap_or_default(), &job.name_any());
        if state.lose_create_races || state.jobs.contains_key(&k) {
            return Err(ClusterError::AlreadyExists(job.name_any()));
        }
        state.jobs.insert(k, job.clone());
        state.writes.job_creates += 1;
        Ok(())
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        let k = key(&cron_job.namespace().unwrap_or_default(), &cron_job.name_any());
        if !state.cron_jobs.contains_key(&k) {
            return Err(ClusterError::NotFound(cron_job.name_any()));
        }
        state.cron_jobs.insert(k, cron_job.clone());
        state.writes.cron_job_replaces += 1;
        Ok(())
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .cron_jobs
            .remove(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        state.writes.cron_job_deletes += 1;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .remove(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        state.writes.job_deletes += 1;
        Ok(())
    }
}

/// Manifest source that creates an empty tree per CR and version
pub struct FakeSource {
    root: tempfile::TempDir,
    pub acquisitions: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: tempfile::tempdir().unwrap(),
            acquisitions: AtomicUsize::new(0),
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for FakeSource {
    async fn acquire(&self, cr_name: &str, version: &str, _git: &GitSource) -> Result<PathBuf> {
        let path = self.root.path().join(cr_name).join(version);
        std::fs::create_dir_all(&path)?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }
}

/// Builder returning a fixed document and recording the profile it was asked for
///
/// With a key generator it also writes the overlay patches into a tree seeded
/// with key templates, and records the `rotateKeys` it saw together with the
/// resulting key patch of [`KEY_SERVICE`], once per build.
#[derive(Default)]
pub struct FakeBuilder {
    pub profiles: Mutex<Vec<String>>,
    pub fail: bool,
    keys: Option<Arc<dyn KeyGenerator>>,
    pub key_patches: Mutex<Vec<(String, String)>>,
}

pub const KEY_SERVICE: &str = "edge-auth";

impl FakeBuilder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_keys(keys: Arc<dyn KeyGenerator>) -> Self {
        Self {
            keys: Some(keys),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.profiles.lock().unwrap().len()
    }

    pub fn key_patches(&self) -> Vec<(String, String)> {
        self.key_patches.lock().unwrap().clone()
    }
}

/// Key templates the way the manifests ship them, encrypting for `public_key`
pub fn seed_key_templates(manifest_root: &Path, public_key: &str) -> Result<()> {
    let templates = manifest_root.join(".operator/templates/keys");
    std::fs::create_dir_all(templates.join("service_secrets"))?;
    std::fs::create_dir_all(templates.join("keys_configs"))?;
    let files = [
        ("services.yaml", format!("- name: {KEY_SERVICE}\n")),
        (
            "service_secrets/kustomization.yaml",
            "resources:\n  - selectivepatch.yaml\n".to_string(),
        ),
        (
            "service_secrets/eprivate_key.json.tmpl",
            format!(
                "{{\"_public_key\": \"{public_key}\", \"private_key\": \"{{{{.PrivateKey}}}}\", \"kid\": \"{{{{.Kid}}}}\"}}\n"
            ),
        ),
        (
            "service_secrets/selectivepatch.yaml.tmpl",
            "metadata:\n  name: {{.Name}}-component-secrets-operator\n".to_string(),
        ),
        (
            "keys_configs/kustomization.yaml",
            "resources:\n  - selectivepatch.yaml\n".to_string(),
        ),
        ("keys_configs/gomplate.yaml", "kind: Gomplate\n".to_string()),
        (
            "keys_configs/ejwks.json.tmpl",
            format!(
                "{{\"_public_key\": \"{public_key}\"{{{{range .}}}}, \"{{{{.Name}}}}\": \"{{{{.JWKS}}}}\"{{{{end}}}}}}\n"
            ),
        ),
        (
            "keys_configs/selectivepatch.yaml.tmpl",
            "data:\n{{range .}}  qlik.api.internal-{{.Name}}: x\n{{end}}".to_string(),
        ),
    ];
    for (path, contents) in files {
        std::fs::write(templates.join(path), contents)?;
    }
    Ok(())
}

#[async_trait]
impl ManifestBuilder for FakeBuilder {
    async fn build(&self, spec: &QliksenseSpec, manifest_root: &Path, profile: &str) -> Result<String> {
        self.profiles.lock().unwrap().push(profile.to_string());
        if self.fail {
            anyhow::bail!("kustomize build failed");
        }
        anyhow::ensure!(manifest_root.exists(), "manifest root does not exist");
        if let Some(keys) = &self.keys {
            let templates = manifest_root.join(".operator/templates/keys");
            if !templates.exists() {
                seed_key_templates(manifest_root, &ejson::generate_keypair().public)?;
            }
            write_overlay_patches(spec, manifest_root, keys.as_ref())?;
            let key_patch = manifest_root
                .join(".operator/secrets")
                .join(KEY_SERVICE)
                .join("eprivate_key.json");
            let contents = std::fs::read_to_string(key_patch).unwrap_or_default();
            self.key_patches
                .lock()
                .unwrap()
                .push((spec.rotate_keys.clone(), contents));
        }
        Ok(format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: generated\n  annotations:\n    profile: {profile}\n    storageClass: '{}'\n",
            spec.storage_class_name
        ))
    }
}

/// Applier that records the manifests and makes the install marker appear
pub struct FakeApplier {
    cluster: Arc<FakeCluster>,
    pub applied: Mutex<Vec<String>>,
}

impl FakeApplier {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl ManifestApplier for FakeApplier {
    async fn apply(&self, manifests: &str) -> Result<()> {
        self.applied.lock().unwrap().push(manifests.to_string());
        let releases: Vec<String> = self
            .cluster
            .state
            .lock()
            .unwrap()
            .qliksenses
            .values()
            .map(ResourceExt::name_any)
            .collect();
        for release in releases {
            self.cluster
                .insert_object(&engine_kind(), tracked_object(&engine_kind(), "engine", &release));
        }
        Ok(())
    }
}

pub fn engine_kind() -> ResourceKind {
    ResourceKind::parse("qixmanager.qlik.com/v1/Engine/engines").unwrap()
}

/// Object of `kind` in [`NAMESPACE`] labelled `release=<release>`
pub fn tracked_object(kind: &ResourceKind, name: &str, release: &str) -> DynamicObject {
    let mut object = DynamicObject::new(name, &kind.api_resource()).within(NAMESPACE);
    object.metadata.labels = Some(BTreeMap::from([(
        "release".to_string(),
        release.to_string(),
    )]));
    object
}

/// A CR as the API server would return it: uid set, no status yet
pub fn qliksense(name: &str, spec: QliksenseSpec) -> Qliksense {
    let mut q = Qliksense::new(name, spec);
    q.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("uid-{name}")),
        ..ObjectMeta::default()
    };
    q
}

pub fn ops_runner(enabled: &str, schedule: &str) -> Option<OpsRunnerSpec> {
    Some(OpsRunnerSpec {
        enabled: enabled.to_string(),
        schedule: schedule.to_string(),
        watch_branch: "master".to_string(),
        image: "qlik-docker-oss.bintray.io/qliksense-repo-watcher".to_string(),
    })
}

pub fn git() -> Option<GitSource> {
    Some(GitSource {
        repository: "https://github.com/qlik-oss/qliksense-k8s".to_string(),
        ..GitSource::default()
    })
}

pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        dynamic_resources: vec![engine_kind()],
        finalization: FinalizationConfig {
            max_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        },
        ..OperatorConfig::default()
    }
}

/// Everything a reconcile test needs, wired together
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub source: Arc<FakeSource>,
    pub builder: Arc<FakeBuilder>,
    pub applier: Arc<FakeApplier>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_builder(FakeBuilder::default())
    }

    pub fn with_builder(builder: FakeBuilder) -> Self {
        let cluster = FakeCluster::new();
        let source = FakeSource::new();
        let builder = Arc::new(builder);
        let applier = Arc::new(FakeApplier::new(Arc::clone(&cluster)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::clone(&source) as Arc<dyn ManifestSource>,
            Arc::clone(&builder) as Arc<dyn ManifestBuilder>,
            Arc::clone(&applier) as Arc<dyn ManifestApplier>,
            test_config(),
        ));
        Self {
            cluster,
            source,
            builder,
            applier,
            reconciler,
        }
    }

    /// Reconcile the stored CR once
    pub async fn reconcile(&self, name: &str) -> Result<kube_runtime::controller::Action, qliksense_operator::ReconcilerError> {
        let trigger = Arc::new(qliksense(name, QliksenseSpec::default()));
        qliksense_operator::reconcile(trigger, Arc::clone(&self.reconciler)).await
    }
}
