//! # Operator Configuration
//!
//! Operator-level configuration loaded from environment variables.
//!
//! All configuration has sensible defaults and can be overridden via environment
//! variables populated from the operator Deployment.

mod operator;
mod server;

pub use operator::{FinalizationConfig, OperatorConfig, OpsRunnerConfig};
pub use server::ServerConfig;

/// Load configuration from environment variables with defaults
pub fn load_config() -> (OperatorConfig, ServerConfig) {
    (OperatorConfig::from_env(), ServerConfig::from_env())
}

/// Parse a configured value, falling back to `default` when absent or invalid
pub(crate) fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Read a non-empty string environment variable
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
