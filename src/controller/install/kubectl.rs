//! `kubectl apply` of rendered manifests.

use super::ManifestApplier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use tokio::process::Command;
use tracing::{error, info};

/// [`ManifestApplier`] that shells out to `kubectl`
#[derive(Debug, Clone, Copy, Default)]
pub struct KubectlApplier;

#[async_trait]
impl ManifestApplier for KubectlApplier {
    async fn apply(&self, manifests: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("qliksense-")
            .suffix(".yaml")
            .tempfile()
            .context("Failed to create manifest file")?;
        file.write_all(manifests.as_bytes())
            .context("Failed to write manifest file")?;
        file.flush()?;

        info!("Applying manifests with kubectl ({} bytes)", manifests.len());
        let output = Command::new("kubectl")
            .arg("apply")
            .arg("-f")
            .arg(file.path())
            .arg("--validate=false")
            .output()
            .await
            .context("Failed to execute kubectl apply")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("kubectl apply failed: {}", stderr);
            return Err(anyhow::anyhow!("kubectl apply failed: {stderr}"));
        }
        Ok(())
    }
}
