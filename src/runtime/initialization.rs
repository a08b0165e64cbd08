//! # Initialization
//!
//! Operator startup: rustls setup, tracing, metrics, metrics server, Kubernetes
//! client, build service and a summary of the resources already present.

use crate::config::{load_config, OperatorConfig, ServerConfig};
use crate::constants;
use crate::controller::build_service::{register_build_service, start_build_service};
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::Qliksense;
use crate::observability;
use anyhow::{Context, Result};
use kube::{api::Api, api::ListParams, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Tools invoked as subprocesses
const REQUIRED_TOOLS: [&str; 3] = ["git", "kustomize", "kubectl"];

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    /// All Qliksense resources, cluster wide
    pub qliksenses: Api<Qliksense>,
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Initialize the operator runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - Metrics server startup
/// - Kubernetes client creation
/// - Build service startup and registration
/// - Summary of existing resources
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before any TLS connection is made
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install rustls crypto provider, one is already installed: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| constants::DEFAULT_LOG_FILTER.into()),
        )
        .init();

    info!("Starting Qliksense operator");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let (config, server_config) = load_config();
    info!(
        "Operator {} in namespace {}, work dir {}",
        config.operator_name,
        config.operator_namespace,
        config.workdir.display()
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_state_clone = Arc::clone(&server_state);
    let metrics_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_clone).await {
            error!("HTTP server error: {:#}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    check_required_tools();

    let reconciler = Arc::new(Reconciler::from_client(client.clone(), config.clone()));

    let builder = Arc::clone(&reconciler.builder);
    let build_port = server_config.build_service_port;
    tokio::spawn(async move {
        if let Err(e) = start_build_service(build_port, builder).await {
            error!("Build service error: {:#}", e);
        }
    });
    register_service(client.clone(), &config).await;

    let qliksenses: Api<Qliksense> = Api::all(client.clone());
    summarize_existing_resources(&qliksenses).await;

    info!("Operator initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        qliksenses,
        reconciler,
        server_state,
    })
}

/// Block until the metrics server has bound its listener
///
/// Fails early when the server task exits, so a port clash is reported instead of
/// surfacing later as failing readiness checks.
async fn wait_for_server_ready(
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let limit = Duration::from_secs(server_config.startup_timeout_secs);
    let mut ticks = tokio::time::interval(Duration::from_millis(server_config.poll_interval_ms));

    let wait = async {
        loop {
            ticks.tick().await;
            if server_handle.is_finished() {
                anyhow::bail!(
                    "Metrics server on port {} exited during startup",
                    server_config.metrics_port
                );
            }
            if server_state.is_ready.load(Ordering::Relaxed) {
                return Ok(());
            }
        }
    };

    tokio::time::timeout(limit, wait)
        .await
        .with_context(|| format!("Metrics server not ready after {}s", limit.as_secs()))??;
    info!("Metrics server listening on port {}", server_config.metrics_port);
    Ok(())
}

fn check_required_tools() {
    for tool in REQUIRED_TOOLS {
        match which::which(tool) {
            Ok(path) => info!("Found {} at {}", tool, path.display()),
            Err(_) => warn!(
                "{} was not found on PATH, installs and builds that need it will fail",
                tool
            ),
        }
    }
}

async fn register_service(client: Client, config: &OperatorConfig) {
    if !config.register_build_service {
        info!("Build service registration is disabled");
        return;
    }
    if let Err(e) = register_build_service(client, config).await {
        // Runners fail to reach the callback, but installs still work
        warn!("Failed to register build service: {:#}", e);
    }
}

/// Log existing Qliksense resources per namespace
///
/// The controller reconciles them as soon as the watch starts; this only makes
/// the starting state visible in the log.
async fn summarize_existing_resources(qliksenses: &Api<Qliksense>) {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.existing_resources",
        operation = "summarize_existing_resources"
    );
    let _guard = span.enter();

    let list = match qliksenses.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            error!("CRD is not queryable; {}. Is the CRD installed?", e);
            error!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            warn!("Continuing despite CRD queryability check failure - controller will retry");
            return;
        }
    };

    if list.items.is_empty() {
        info!("No existing Qliksense resources found, watch will pick up new resources");
        return;
    }

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in &list.items {
        by_namespace
            .entry(item.namespace().unwrap_or_else(|| "default".to_string()))
            .or_default()
            .push(item.name_any());
    }

    info!("Qliksense operator - Startup Resource Summary");
    info!("Total Resources: {}", list.items.len());
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, names) in &mut by_namespace {
        names.sort();
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), format_names(names));
    }
}

/// Comma-separated names, at most three shown
fn format_names(names: &[String]) -> String {
    if names.len() <= 3 {
        names.join(", ")
    } else {
        format!("{}, ... ({} total)", names[..3].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        let names: Vec<String> = ["a", "b"].iter().map(ToString::to_string).collect();
        assert_eq!(format_names(&names), "a, b");

        let names: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(format_names(&names), "a, b, c, ... (5 total)");
    }
}
