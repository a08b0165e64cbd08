//! # Constants
//!
//! Names, labels and default values shared across the operator.

/// Finalizer guarding cleanup of a Qliksense resource
pub const QLIKSENSE_FINALIZER: &str = "finalizer.qliksense.qlik.com";

/// Label carried by every resource owned by a Qliksense CR (value = CR name)
pub const TRACKING_LABEL: &str = "release";

/// Label on the CR naming the manifest version (git ref)
pub const VERSION_LABEL: &str = "version";

/// Ref used when the CR carries no version label
pub const DEFAULT_VERSION: &str = "master";

/// Suffix appended to the CR name for the ops-runner Job/CronJob
pub const OPS_RUNNER_NAME_SUFFIX: &str = "-ops-runner";

/// Suffix appended to the operator name for the build service
pub const BUILD_SERVICE_NAME_SUFFIX: &str = "-kuztomize";

/// Name of the build service port
pub const BUILD_SERVICE_PORT_NAME: &str = "kuz-port";

/// Pull secret attached when the ops-runner image is rewritten to a private registry
pub const PULL_SECRET_NAME: &str = "artifactory-docker-secret";

/// Field manager used for patches
pub const FIELD_MANAGER: &str = "qliksense-operator";

/// Overlay folder the operator writes patches into
pub const OPERATOR_OVERLAY_DIR: &str = ".operator";

/// Templates for generated key material, relative to the operator overlay
pub const KEY_TEMPLATES_DIR: &str = "templates/keys";

/// Profile built when the CR does not name one
pub const DEFAULT_PROFILE: &str = "manifests/docker-desktop";

/// Grace period for bulk deletes during finalization
pub const DELETE_GRACE_PERIOD_SECS: u32 = 1;

// Environment contract of the ops-runner pod
pub const ENV_YAML_CONF: &str = "YAML_CONF";
pub const ENV_OPERATOR_SERVICE_NAME: &str = "OPERATOR_SERVICE_NAME";
pub const ENV_OPERATOR_SERVICE_PORT: &str = "OPERATOR_SERVICE_PORT";

// Defaults for operator configuration
pub const DEFAULT_OPERATOR_NAME: &str = "qliksense-operator";
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "default";
pub const DEFAULT_BUILD_SERVICE_PORT: u16 = 7000;
pub const DEFAULT_METRICS_PORT: u16 = 8080;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_MAX_DELETION_WAIT_SECS: u64 = 90;
pub const DEFAULT_DELETION_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "Always";
pub const DEFAULT_RESTART_POLICY: &str = "OnFailure";

/// Dynamic kinds reconciled in addition to the built-in ones
/// Format: `group/version/Kind/plural`
pub const DEFAULT_DYNAMIC_RESOURCES: &str =
    "qixmanager.qlik.com/v1/Engine/engines,autoscaling/v2/HorizontalPodAutoscaler/horizontalpodautoscalers";

/// Requeue delay when the backoff state cannot be read
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;

/// Periodic resync for healthy resources
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Backoff bounds in minutes
pub const BACKOFF_MIN_MINUTES: u64 = 1;
pub const BACKOFF_MAX_MINUTES: u64 = 10;

/// Default tracing directive
pub const DEFAULT_LOG_FILTER: &str = "qliksense_operator=info";

/// Kind whose presence under the tracking label marks a CR as installed
pub const INSTALL_MARKER_RESOURCE: &str = "qixmanager.qlik.com/v1/Engine/engines";
