//! # Build Service
//!
//! HTTP callback the ops runner uses to render manifests inside the operator.
//!
//! ```text
//! POST /kuz   {"cr": base64(CR YAML), "config": base64(tar.gz of the manifest tree)}
//!          -> {"manifests": base64(tar.gz holding manifest.yaml)}
//! GET /health -> 204
//! ```
//!
//! A request that cannot be decoded is answered with 400 and a message. Failures
//! while staging or building are answered with 500 and an empty body; details go
//! to the operator log only.

use crate::config::OperatorConfig;
use crate::constants::BUILD_SERVICE_PORT_NAME;
use crate::controller::archive;
use crate::controller::install::ManifestBuilder;
use crate::controller::operator_owner::{resolve_operator_owner, KubeOwnerLookup};
use crate::crd::QliksenseSpec;
use crate::observability;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Body of `POST /kuz`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub cr: String,
    #[serde(default)]
    pub config: String,
}

/// Successful response of `POST /kuz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub manifests: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildServiceError {
    #[error("error decoding expected JSON object from the HTTP request body")]
    InvalidBody(#[source] serde_json::Error),
    #[error("error base64 decoding {0}")]
    InvalidEncoding(&'static str, #[source] base64::DecodeError),
    #[error("failed to stage build request: {0:#}")]
    Staging(anyhow::Error),
    #[error("failed to build manifests: {0:#}")]
    Build(anyhow::Error),
}

impl IntoResponse for BuildServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidBody(_) | Self::InvalidEncoding(..) => {
                warn!("Rejected build request: {}", self);
                observability::metrics::increment_build_requests("bad_request");
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            Self::Staging(_) | Self::Build(_) => {
                error!("Build request failed: {}", self);
                observability::metrics::increment_build_requests("error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Router of the build service
pub fn build_service_router(builder: Arc<dyn ManifestBuilder>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/kuz", post(build_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(builder)
}

/// Bind to `port` and serve build requests until the process exits
pub async fn start_build_service(port: u16, builder: Arc<dyn ManifestBuilder>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind build service to {addr}"))?;
    info!("Build service listening on {}", addr);
    axum::serve(listener, build_service_router(builder))
        .await
        .context("Build service terminated")
}

async fn health_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn build_handler(
    State(builder): State<Arc<dyn ManifestBuilder>>,
    body: Bytes,
) -> Result<Json<BuildResponse>, BuildServiceError> {
    let (cr, config) = decode_request(&body)?;

    // Dropping the staging directory removes it
    let staging = tokio::task::spawn_blocking(move || stage_request(&cr, &config))
        .await
        .map_err(|e| BuildServiceError::Staging(e.into()))?
        .map_err(BuildServiceError::Staging)?;

    let mut spec = staging.spec.clone();
    spec.manifests_root = staging.config_dir.to_string_lossy().into_owned();
    let manifests = builder
        .build(&spec, &staging.config_dir, spec.profile_dir())
        .await
        .map_err(BuildServiceError::Build)?;

    let archive = archive::create_tar_gz("manifest.yaml", manifests.as_bytes())
        .map_err(BuildServiceError::Build)?;
    observability::metrics::increment_build_requests("success");
    Ok(Json(BuildResponse {
        manifests: STANDARD.encode(archive),
    }))
}

fn decode_request(body: &[u8]) -> Result<(Vec<u8>, Vec<u8>), BuildServiceError> {
    let request: BuildRequest =
        serde_json::from_slice(body).map_err(BuildServiceError::InvalidBody)?;
    let cr = STANDARD
        .decode(request.cr.trim())
        .map_err(|e| BuildServiceError::InvalidEncoding("cr", e))?;
    let config = STANDARD
        .decode(request.config.trim())
        .map_err(|e| BuildServiceError::InvalidEncoding("config", e))?;
    Ok((cr, config))
}

/// Temporary directory holding a staged request
struct StagedRequest {
    _dir: tempfile::TempDir,
    config_dir: PathBuf,
    spec: QliksenseSpec,
}

/// Minimal view of the CR document sent by the runner
#[derive(Debug, Deserialize)]
struct CrDocument {
    #[serde(default)]
    spec: QliksenseSpec,
}

fn stage_request(cr: &[u8], config: &[u8]) -> Result<StagedRequest> {
    let dir = tempfile::Builder::new()
        .prefix("kuz-")
        .tempdir()
        .context("Failed to create staging directory")?;
    std::fs::write(dir.path().join("CR.yaml"), cr).context("Failed to write CR.yaml")?;
    std::fs::write(dir.path().join("config.tgz"), config).context("Failed to write config.tgz")?;

    let config_dir = dir.path().join("config");
    archive::unpack_tar_gz(config, &config_dir)?;

    let document: CrDocument = serde_yaml::from_slice(cr).context("Failed to parse CR")?;
    Ok(StagedRequest {
        _dir: dir,
        config_dir,
        spec: document.spec,
    })
}

/// Service object fronting the build service, owned by `owner` when given
pub fn build_service_object(config: &OperatorConfig, owner: Option<OwnerReference>) -> Service {
    let port = i32::from(config.build_service_port);
    Service {
        metadata: ObjectMeta {
            name: Some(config.build_service_name()),
            namespace: Some(config.operator_namespace.clone()),
            labels: Some(BTreeMap::from([(
                "name".to_string(),
                config.operator_name.clone(),
            )])),
            owner_references: owner.map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "name".to_string(),
                config.operator_name.clone(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(BUILD_SERVICE_PORT_NAME.to_string()),
                port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(port)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Create the build Service, or update it in place when it already exists.
///
/// The update keeps the allocated cluster IP and sends the live resource version.
pub async fn register_build_service(client: Client, config: &OperatorConfig) -> Result<()> {
    let owner = match &config.pod_name {
        Some(pod_name) => {
            let lookup = KubeOwnerLookup::new(client.clone(), &config.operator_namespace);
            match resolve_operator_owner(&lookup, pod_name).await {
                Ok(owner) => {
                    info!("Build service is owned by {} {}", owner.kind, owner.name);
                    Some(owner)
                }
                Err(e) => {
                    warn!("Failed to resolve owner of pod {}: {:#}", pod_name, e);
                    None
                }
            }
        }
        None => {
            warn!("POD_NAME is not set, build service is registered without an owner");
            None
        }
    };

    let api: Api<Service> = Api::namespaced(client, &config.operator_namespace);
    let desired = build_service_object(config, owner);
    let name = config.build_service_name();

    match api.create(&PostParams::default(), &desired).await {
        Ok(_) => {
            info!("Created build service {}/{}", config.operator_namespace, name);
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 409 => {
            let existing = api
                .get(&name)
                .await
                .with_context(|| format!("Failed to fetch build service {name}"))?;
            let mut updated = desired;
            updated.metadata.resource_version = existing.metadata.resource_version.clone();
            if let (Some(spec), Some(live)) = (updated.spec.as_mut(), existing.spec.as_ref()) {
                spec.cluster_ip = live.cluster_ip.clone();
                spec.cluster_ips = live.cluster_ips.clone();
            }
            api.replace(&name, &PostParams::default(), &updated)
                .await
                .with_context(|| format!("Failed to update build service {name}"))?;
            info!("Updated build service {}/{}", config.operator_namespace, name);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to create build service {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_service_object() {
        let config = OperatorConfig::default();
        let service = build_service_object(&config, None);
        assert!(service.metadata.owner_references.is_none());
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("qliksense-operator-kuztomize")
        );
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector.unwrap()["name"], "qliksense-operator");
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 7000);
        assert_eq!(port.name.as_deref(), Some("kuz-port"));
        assert_eq!(port.target_port, Some(IntOrString::Int(7000)));
    }

    #[test]
    fn test_build_service_object_is_owned() {
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "qliksense-operator".to_string(),
            uid: "uid-operator".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let service = build_service_object(&OperatorConfig::default(), Some(owner.clone()));
        assert_eq!(service.metadata.owner_references, Some(vec![owner]));
    }

    #[test]
    fn test_decode_request_errors() {
        assert!(matches!(
            decode_request(b"{not json"),
            Err(BuildServiceError::InvalidBody(_))
        ));
        assert!(matches!(
            decode_request(br#"{"cr": "%%%", "config": ""}"#),
            Err(BuildServiceError::InvalidEncoding("cr", _))
        ));
        let (cr, config) = decode_request(br#"{"cr": "a2luZDogUWxpa3NlbnNl", "config": ""}"#).unwrap();
        assert_eq!(cr, b"kind: Qliksense");
        assert!(config.is_empty());
    }

    #[test]
    fn test_staging_parses_spec() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("README"), "manifests").unwrap();
        let config = archive::pack_directory(src.path()).unwrap();
        let cr = b"apiVersion: qlik.com/v1\nkind: Qliksense\nmetadata:\n  name: qlik-default\nspec:\n  profile: manifests/gke\n";

        let staged = stage_request(cr, &config).unwrap();
        assert_eq!(staged.spec.profile, "manifests/gke");
        assert!(staged.config_dir.join("README").exists());

        let root = staged._dir.path().to_path_buf();
        drop(staged);
        assert!(!root.exists());
    }
}
