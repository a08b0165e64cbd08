//! # Instance Registry
//!
//! Per-CR cache of the locally materialized manifest tree and the spec it was
//! acquired for. Owned by the [`Reconciler`](crate::controller::reconciler::Reconciler);
//! distinct CRs access it concurrently through a reader/writer lock.

use crate::controller::acquisition::ManifestSource;
use crate::crd::{Qliksense, QliksenseSpec};
use anyhow::{Context, Result};
use kube::ResourceExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One registered Qliksense instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEntry {
    /// Root of the manifest tree on local storage
    pub manifest_root: PathBuf,
    /// Version (git ref) the tree was checked out at
    pub version: String,
    /// Spec snapshot from the most recent reconciliation
    pub spec: QliksenseSpec,
}

/// Synchronized map from CR name to its [`InstanceEntry`]
pub struct InstanceRegistry {
    entries: RwLock<HashMap<String, InstanceEntry>>,
    source: Arc<dyn ManifestSource>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry").finish_non_exhaustive()
    }
}

impl InstanceRegistry {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source,
        }
    }

    /// Return the entry for this CR, acquiring the manifest tree when it is missing,
    /// was removed from disk, or was checked out at a different version.
    pub async fn get_or_create(&self, qliksense: &Qliksense) -> Result<InstanceEntry> {
        let name = qliksense.name_any();
        let version = qliksense.version().to_string();

        let stale_root = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&name) {
                Some(entry) if entry.version == version && entry.manifest_root.exists() => {
                    entry.spec = qliksense.spec.clone();
                    return Ok(entry.clone());
                }
                Some(entry) if entry.version != version => Some(entry.manifest_root.clone()),
                Some(entry) => {
                    warn!(
                        "Manifest root {} for {} disappeared, acquiring again",
                        entry.manifest_root.display(),
                        name
                    );
                    None
                }
                None => None,
            }
        };

        let git = qliksense
            .spec
            .git
            .as_ref()
            .filter(|g| !g.repository.trim().is_empty())
            .with_context(|| format!("Qliksense {name} has no git repository to acquire"))?;

        let manifest_root = self
            .source
            .acquire(&name, &version, git)
            .await
            .with_context(|| format!("Failed to acquire manifests for {name} at {version}"))?;

        if let Some(stale_root) = stale_root.filter(|root| *root != manifest_root) {
            info!(
                "Version of {} changed, removing previous manifests at {}",
                name,
                stale_root.display()
            );
            remove_tree(&stale_root).await;
        }

        let entry = InstanceEntry {
            manifest_root,
            version,
            spec: qliksense.spec.clone(),
        };
        self.entries.write().await.insert(name, entry.clone());
        Ok(entry)
    }

    pub async fn get(&self, name: &str) -> Option<InstanceEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Drop the entry and free its manifest tree. Unknown names are a no-op.
    pub async fn remove(&self, name: &str) -> Option<InstanceEntry> {
        let removed = self.entries.write().await.remove(name);
        if let Some(entry) = &removed {
            remove_tree(&entry.manifest_root).await;
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

async fn remove_tree(root: &std::path::Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove manifests at {}: {}", root.display(), e),
    }
}
