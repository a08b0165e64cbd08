//! # Kustomize
//!
//! Manifest rendering: overlay patches derived from the CR are written into the
//! tree, then the selected profile is built with the `kustomize` CLI.

pub mod build;
pub mod ejson;
pub mod keys;
pub mod patches;

pub use build::run_kustomize_build;
pub use keys::{EcKeyGenerator, KeyGenerator};
pub use patches::write_overlay_patches;

use crate::controller::install::ManifestBuilder;
use crate::crd::QliksenseSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info_span, Instrument};

/// [`ManifestBuilder`] backed by the `kustomize` CLI
#[derive(Debug, Clone)]
pub struct KustomizeBuilder {
    keys: Arc<dyn KeyGenerator>,
}

impl KustomizeBuilder {
    pub fn new(keys: Arc<dyn KeyGenerator>) -> Self {
        Self { keys }
    }
}

impl Default for KustomizeBuilder {
    fn default() -> Self {
        Self::new(Arc::new(EcKeyGenerator))
    }
}

#[async_trait]
impl ManifestBuilder for KustomizeBuilder {
    async fn build(&self, spec: &QliksenseSpec, manifest_root: &Path, profile: &str) -> Result<String> {
        let spec = spec.clone();
        let root = manifest_root.to_path_buf();
        let profile = profile.to_string();
        let keys = Arc::clone(&self.keys);
        let span = info_span!(
            "kustomize.build",
            manifest.root = %root.display(),
            profile = %profile
        );

        // Both steps touch the filesystem and spawn a process
        tokio::task::spawn_blocking(move || {
            write_overlay_patches(&spec, &root, keys.as_ref())?;
            run_kustomize_build(&root, &profile)
        })
        .instrument(span)
        .await
        .context("Kustomize build task panicked")?
    }
}
