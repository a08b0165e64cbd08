//! # Kustomize Build Execution
//!
//! Runs `kustomize build` over a profile directory of a manifest tree.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use std::time::Instant;
use tracing::{error, info};

/// Build `<manifest_root>/<profile>` and return the rendered YAML
///
/// Load restrictions are disabled because profiles reference overlays outside
/// their own directory (`.operator`, `.configuration`).
pub fn run_kustomize_build(manifest_root: &Path, profile: &str) -> Result<String> {
    let profile_dir = manifest_root.join(profile);

    if !profile_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Profile directory does not exist: {}",
            profile_dir.display()
        ));
    }
    if !profile_dir.join("kustomization.yaml").exists() {
        return Err(anyhow::anyhow!(
            "kustomization.yaml not found in profile {}",
            profile_dir.display()
        ));
    }

    info!("Running kustomize build on {}", profile_dir.display());
    let start = Instant::now();

    let output = Command::new("kustomize")
        .arg("build")
        .arg("--load-restrictor")
        .arg("LoadRestrictionsNone")
        .arg(&profile_dir)
        .current_dir(manifest_root)
        .output()
        .context("Failed to execute kustomize build")?;

    crate::observability::metrics::observe_kustomize_build_duration(
        start.elapsed().as_secs_f64(),
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Kustomize build failed: {}", stderr);
        crate::observability::metrics::increment_kustomize_build_errors();
        return Err(anyhow::anyhow!("Kustomize build failed: {stderr}"));
    }

    String::from_utf8(output.stdout).context("Failed to decode kustomize output as UTF-8")
}
