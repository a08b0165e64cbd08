//! # Install Pipeline
//!
//! Renders a CR's manifest tree and applies the result to the cluster.
//!
//! Installation happens once per CR lifetime. Whether it already happened is read
//! from the cluster: an engine object carrying the CR's tracking label means the
//! manifests were applied.

mod kubectl;

pub use kubectl::KubectlApplier;

use crate::constants::INSTALL_MARKER_RESOURCE;
use crate::controller::cluster::{tracking_selector, DynamicResources, ResourceKind};
use crate::controller::registry::InstanceEntry;
use crate::crd::{Qliksense, QliksenseSpec};
use crate::observability;
use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use std::path::Path;
use tracing::{debug, info, info_span, Instrument};

/// Renders a manifest tree into a multi-document YAML stream
#[async_trait]
pub trait ManifestBuilder: Send + Sync {
    async fn build(&self, spec: &QliksenseSpec, manifest_root: &Path, profile: &str) -> Result<String>;
}

/// Applies rendered manifests to the cluster
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    async fn apply(&self, manifests: &str) -> Result<()>;
}

/// Whether the CR's manifests have been applied.
///
/// A missing engines CRD means nothing was installed yet. Any other API error is
/// returned so the reconciliation is retried instead of installing twice.
pub async fn is_installed<C>(cluster: &C, qliksense: &Qliksense) -> Result<bool>
where
    C: DynamicResources + ?Sized,
{
    let marker = ResourceKind::parse(INSTALL_MARKER_RESOURCE)?;
    let namespace = qliksense.namespace().unwrap_or_default();
    match cluster
        .list(&marker, &namespace, &tracking_selector(&qliksense.name_any()))
        .await
    {
        Ok(items) => Ok(!items.is_empty()),
        Err(e) if e.is_not_found() => {
            debug!("{} is not served, {} is not installed", marker, qliksense.name_any());
            Ok(false)
        }
        Err(e) => Err(e).context("Failed to check installation state"),
    }
}

/// Build the entry's manifest tree and apply it
pub async fn install(
    builder: &dyn ManifestBuilder,
    applier: &dyn ManifestApplier,
    entry: &InstanceEntry,
    qliksense: &Qliksense,
) -> Result<()> {
    let name = qliksense.name_any();
    let profile = qliksense.profile_dir();
    let span = info_span!(
        "qliksense.install",
        resource.name = %name,
        version = %entry.version,
        profile = %profile
    );

    async {
        info!(
            "Installing {} from {} (profile {})",
            name,
            entry.manifest_root.display(),
            profile
        );
        let manifests = builder
            .build(&entry.spec, &entry.manifest_root, profile)
            .await
            .with_context(|| format!("Failed to render manifests for {name}"))?;
        applier
            .apply(&manifests)
            .await
            .with_context(|| format!("Failed to apply manifests for {name}"))?;

        observability::metrics::increment_installs();
        info!("Installed {}", name);
        Ok(())
    }
    .instrument(span)
    .await
}
