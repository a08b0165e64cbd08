//! # Key Material
//!
//! Per-service signing keys written into the operator overlay when the CR asks
//! for generated keys. Inputs and outputs under `<root>/.operator`:
//!
//! ```text
//! templates/keys/services.yaml                  services that get a key
//! templates/keys/service_secrets/*              per-service templates
//! templates/keys/keys_configs/*                 templates for the shared JWKS
//! secrets/<service>/eprivate_key.json           private key and kid (ejson)
//! secrets/<service>/selectivepatch.yaml
//! configs/keys/ejwks.json                       public keys of all services (ejson)
//! configs/keys/selectivepatch.yaml
//! ```
//!
//! Templates use `{{.Name}}`, `{{.PrivateKey}}`, `{{.Kid}}` and `{{.JWKS}}`; the
//! shared ones repeat a `{{range .}} ... {{end}}` block per service. Existing
//! material is reused unless a rotation is requested.

use super::ejson;
use super::patches::add_resource_to_kustomization;
use crate::constants::{KEY_TEMPLATES_DIR, OPERATOR_OVERLAY_DIR};
use anyhow::{anyhow, Context, Result};
use p384::pkcs8::{EncodePublicKey, LineEnding};
use p384::SecretKey;
use rand::rngs::OsRng;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

static FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").expect("static template field pattern is valid")
});

static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{\s*range\s+\.\s*\}\}(.*?)\{\{\s*end\s*\}\}")
        .expect("static template range pattern is valid")
});

/// A freshly generated signing key
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceKeyPair {
    /// SEC1 PEM
    pub private_key: String,
    pub kid: String,
    /// SPKI PEM
    pub public_key: String,
}

impl std::fmt::Debug for ServiceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceKeyPair")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Source of service signing keys
pub trait KeyGenerator: Send + Sync + std::fmt::Debug {
    fn generate(&self) -> Result<ServiceKeyPair>;
}

/// P-384 keys with a random kid
#[derive(Debug, Clone, Copy, Default)]
pub struct EcKeyGenerator;

impl KeyGenerator for EcKeyGenerator {
    fn generate(&self) -> Result<ServiceKeyPair> {
        let secret = SecretKey::random(&mut OsRng);
        let private_key = secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encode private key: {e}"))?;
        let public_key = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encode public key: {e}"))?;
        Ok(ServiceKeyPair {
            private_key: private_key.as_str().to_owned(),
            kid: uuid::Uuid::new_v4().to_string(),
            public_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
}

struct ServiceKey {
    name: String,
    pair: ServiceKeyPair,
}

impl ServiceKey {
    /// Template value; key material is escaped for use inside a JSON string
    fn field(&self, field: &str) -> Option<String> {
        match field {
            "Name" => Some(self.name.clone()),
            "PrivateKey" => Some(json_escape(&self.pair.private_key)),
            "Kid" => Some(json_escape(&self.pair.kid)),
            "JWKS" => Some(json_escape(&self.pair.public_key)),
            _ => None,
        }
    }
}

fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::from(value).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Substitute the fields of one service
fn render_one(template: &str, key: &ServiceKey) -> Result<String> {
    let mut unknown = None;
    let rendered = FIELD.replace_all(template, |caps: &Captures<'_>| {
        key.field(&caps[1]).unwrap_or_else(|| {
            unknown.get_or_insert_with(|| caps[1].to_string());
            String::new()
        })
    });
    if let Some(field) = unknown {
        anyhow::bail!("Unknown template field .{field}");
    }
    Ok(rendered.into_owned())
}

/// Expand every range block once per service
fn render_all(template: &str, keys: &[ServiceKey]) -> Result<String> {
    let mut failure = None;
    let rendered = RANGE.replace_all(template, |caps: &Captures<'_>| {
        let mut body = String::new();
        for key in keys {
            match render_one(&caps[1], key) {
                Ok(part) => body.push_str(&part),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        body
    });
    if let Some(e) = failure {
        return Err(e);
    }
    anyhow::ensure!(
        !FIELD.is_match(&rendered),
        "Template uses service fields outside of a range block"
    );
    Ok(rendered.into_owned())
}

struct Templates {
    root: PathBuf,
}

impl Templates {
    fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read key template {}", path.display()))
    }

    fn services(&self) -> Result<Vec<String>> {
        let entries: Vec<ServiceEntry> = serde_yaml::from_str(&self.read("services.yaml")?)
            .context("Failed to parse services.yaml")?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Remove and recreate `dir`
fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

fn material_present(overlay: &Path, services: &[String]) -> bool {
    overlay.join("configs/keys/ejwks.json").exists()
        && services.iter().all(|service| {
            overlay
                .join("secrets")
                .join(service)
                .join("eprivate_key.json")
                .exists()
        })
}

/// Write key material for every listed service into the operator overlay.
///
/// Returns whether new keys were generated. Without `rotate`, material that is
/// already complete is kept as it is.
pub fn write_key_patches(
    manifest_root: &Path,
    generator: &dyn KeyGenerator,
    rotate: bool,
) -> Result<bool> {
    let overlay = manifest_root.join(OPERATOR_OVERLAY_DIR);
    let templates = Templates {
        root: overlay.join(KEY_TEMPLATES_DIR),
    };
    let services = templates.services()?;

    if !rotate && material_present(&overlay, &services) {
        debug!("Reusing key material of {} services", services.len());
        return Ok(false);
    }

    let keys = services
        .into_iter()
        .map(|name| -> Result<ServiceKey> {
            Ok(ServiceKey {
                name,
                pair: generator.generate()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let service_kustomization = templates.read("service_secrets/kustomization.yaml")?;
    let private_key_template = templates.read("service_secrets/eprivate_key.json.tmpl")?;
    let service_patch_template = templates.read("service_secrets/selectivepatch.yaml.tmpl")?;

    let secrets = overlay.join("secrets");
    for key in &keys {
        let dir = secrets.join(&key.name);
        reset_dir(&dir)?;
        write_file(&dir.join("kustomization.yaml"), &service_kustomization)?;
        let private_key = render_one(&private_key_template, key)?;
        write_file(
            &dir.join("eprivate_key.json"),
            &ejson::encrypt_document(&private_key)
                .with_context(|| format!("Failed to encrypt private key of {}", key.name))?,
        )?;
        write_file(
            &dir.join("selectivepatch.yaml"),
            &render_one(&service_patch_template, key)?,
        )?;
        add_resource_to_kustomization(&secrets.join("kustomization.yaml"), &key.name)?;
    }

    let configs = overlay.join("configs");
    let dir = configs.join("keys");
    reset_dir(&dir)?;
    for file in ["kustomization.yaml", "gomplate.yaml"] {
        write_file(&dir.join(file), &templates.read(&format!("keys_configs/{file}"))?)?;
    }
    let jwks = render_all(&templates.read("keys_configs/ejwks.json.tmpl")?, &keys)?;
    write_file(
        &dir.join("ejwks.json"),
        &ejson::encrypt_document(&jwks).context("Failed to encrypt public keys")?,
    )?;
    write_file(
        &dir.join("selectivepatch.yaml"),
        &render_all(&templates.read("keys_configs/selectivepatch.yaml.tmpl")?, &keys)?,
    )?;
    add_resource_to_kustomization(&configs.join("kustomization.yaml"), "keys")?;

    info!(
        "Generated {} key material for {} services",
        if rotate { "rotated" } else { "new" },
        keys.len()
    );
    Ok(true)
}
