//! # Overlay Patch Writers
//!
//! Writes the CR's config and secret values, its storage class override and,
//! when asked for, service key material (see [`super::keys`]) into the
//! `.operator` overlay of a manifest tree before it is built.
//!
//! Each service gets one `SelectivePatch` document per overlay folder:
//!
//! ```yaml
//! apiVersion: qlik.com/v1
//! kind: SelectivePatch
//! metadata:
//!   name: qix-sessions-operator-secrets
//! enabled: true
//! patches:
//!   - patch: |
//!       apiVersion: qlik.com/v1
//!       kind: SuperSecret
//!       metadata:
//!         name: qix-sessions-secrets
//!       stringData:
//!         mongoDbUri: mongodb://...
//!     target:
//!       kind: SuperSecret
//!       labelSelector: app=qix-sessions
//! ```

use super::keys::{write_key_patches, KeyGenerator};
use crate::constants::OPERATOR_OVERLAY_DIR;
use crate::crd::{ConfigEntry, QliksenseSpec, SecretEntry};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

const PATCH_API_VERSION: &str = "qlik.com/v1";

static STORAGE_CLASS_DISABLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"value:\s*false").expect("static storage class pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectivePatch {
    api_version: String,
    kind: String,
    metadata: BTreeMap<String, String>,
    enabled: bool,
    patches: Vec<PatchEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PatchEntry {
    patch: String,
    target: PatchTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchTarget {
    kind: String,
    label_selector: String,
}

/// Body of a SuperConfigMap / SuperSecret patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuperResource {
    api_version: String,
    kind: String,
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    string_data: BTreeMap<String, String>,
}

/// Which overlay a set of values is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlayKind {
    Configs,
    Secrets,
}

impl OverlayKind {
    fn folder(self) -> &'static str {
        match self {
            Self::Configs => "configs",
            Self::Secrets => "secrets",
        }
    }

    fn target_kind(self) -> &'static str {
        match self {
            Self::Configs => "SuperConfigMap",
            Self::Secrets => "SuperSecret",
        }
    }

    fn patch_name(self, service: &str) -> String {
        format!("{service}-operator-{}", self.folder())
    }

    fn resource_name(self, service: &str) -> String {
        format!("{service}-{}", self.folder())
    }
}

/// Write every overlay patch the CR asks for into `manifest_root`
pub fn write_overlay_patches(
    spec: &QliksenseSpec,
    manifest_root: &Path,
    keys: &dyn KeyGenerator,
) -> Result<()> {
    write_config_patches(&spec.configs, manifest_root)?;
    write_secret_patches(&spec.secrets, manifest_root)?;
    let rotate = spec.rotate_keys_requested();
    if spec.generate_keys || rotate {
        write_key_patches(manifest_root, keys, rotate)?;
    }
    if !spec.storage_class_name.is_empty() {
        enable_storage_class(manifest_root)?;
    }
    Ok(())
}

pub fn write_config_patches(configs: &[ConfigEntry], manifest_root: &Path) -> Result<()> {
    let values = group_by_service(configs.iter().map(|c| (&c.data_key, &c.values)));
    write_patches(OverlayKind::Configs, &values, manifest_root)
}

pub fn write_secret_patches(secrets: &[SecretEntry], manifest_root: &Path) -> Result<()> {
    let values = group_by_service(secrets.iter().map(|s| (&s.secret_key, &s.values)));
    write_patches(OverlayKind::Secrets, &values, manifest_root)
}

/// Turn `key -> {service -> value}` entries into `service -> {key -> value}`
fn group_by_service<'a>(
    entries: impl Iterator<Item = (&'a String, &'a BTreeMap<String, String>)>,
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut by_service: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (key, values) in entries {
        for (service, value) in values {
            by_service
                .entry(service.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
    }
    by_service
}

fn write_patches(
    overlay: OverlayKind,
    values: &BTreeMap<String, BTreeMap<String, String>>,
    manifest_root: &Path,
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let dir = manifest_root.join(OPERATOR_OVERLAY_DIR).join(overlay.folder());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create overlay folder {}", dir.display()))?;

    for (service, data) in values {
        let patch = selective_patch(overlay, service, data)?;
        let file_name = format!("{service}.yaml");
        let path = dir.join(&file_name);
        std::fs::write(&path, serde_yaml::to_string(&patch)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        add_resource_to_kustomization(&dir.join("kustomization.yaml"), &file_name)?;
        debug!("Wrote {} patch for {}", overlay.folder(), service);
    }
    info!(
        "Wrote {} {} patch(es) to {}",
        values.len(),
        overlay.folder(),
        dir.display()
    );
    Ok(())
}

fn selective_patch(
    overlay: OverlayKind,
    service: &str,
    data: &BTreeMap<String, String>,
) -> Result<SelectivePatch> {
    let mut body = SuperResource {
        api_version: PATCH_API_VERSION.to_string(),
        kind: overlay.target_kind().to_string(),
        metadata: BTreeMap::from([("name".to_string(), overlay.resource_name(service))]),
        data: BTreeMap::new(),
        string_data: BTreeMap::new(),
    };
    match overlay {
        OverlayKind::Configs => body.data = data.clone(),
        OverlayKind::Secrets => body.string_data = data.clone(),
    }

    Ok(SelectivePatch {
        api_version: PATCH_API_VERSION.to_string(),
        kind: "SelectivePatch".to_string(),
        metadata: BTreeMap::from([("name".to_string(), overlay.patch_name(service))]),
        enabled: true,
        patches: vec![PatchEntry {
            patch: serde_yaml::to_string(&body)?,
            target: PatchTarget {
                kind: overlay.target_kind().to_string(),
                label_selector: format!("app={service}"),
            },
        }],
    })
}

/// List `resource` in a kustomization file, creating the file when absent
pub(super) fn add_resource_to_kustomization(kustomization: &Path, resource: &str) -> Result<()> {
    let mut doc: serde_yaml::Value = if kustomization.exists() {
        let raw = std::fs::read_to_string(kustomization)
            .with_context(|| format!("Failed to read {}", kustomization.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", kustomization.display()))?
    } else {
        serde_yaml::from_str("apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\n")?
    };
    if doc.is_null() {
        doc = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }

    let mapping = doc
        .as_mapping_mut()
        .with_context(|| format!("{} is not a mapping", kustomization.display()))?;
    let resources = mapping
        .entry(serde_yaml::Value::from("resources"))
        .or_insert_with(|| serde_yaml::Value::Sequence(Vec::new()));
    if resources.is_null() {
        *resources = serde_yaml::Value::Sequence(Vec::new());
    }
    let list = resources
        .as_sequence_mut()
        .with_context(|| format!("resources in {} is not a list", kustomization.display()))?;

    let entry = serde_yaml::Value::from(resource);
    if !list.contains(&entry) {
        list.push(entry);
        std::fs::write(kustomization, serde_yaml::to_string(&doc)?)
            .with_context(|| format!("Failed to write {}", kustomization.display()))?;
    }
    Ok(())
}

/// Flip the storage class transformer of the operator overlay on
pub fn enable_storage_class(manifest_root: &Path) -> Result<()> {
    let path = manifest_root
        .join(OPERATOR_OVERLAY_DIR)
        .join("transformers")
        .join("storage-class.yaml");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Storage class transformer {} does not exist", path.display()))?;
    let updated = STORAGE_CLASS_DISABLED.replace_all(&raw, "value: true");
    if updated != raw {
        std::fs::write(&path, updated.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Enabled storage class transformer in {}", path.display());
    }
    Ok(())
}
