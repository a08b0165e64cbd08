//! # Server Configuration
//!
//! Listen ports of the metrics server and the build service, and how long startup
//! waits for the metrics server to bind.

use super::parse_or;
use crate::constants::{
    DEFAULT_BUILD_SERVICE_PORT, DEFAULT_METRICS_PORT, DEFAULT_SERVER_POLL_INTERVAL_MS,
    DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// `/kuz` build callback
    pub build_service_port: u16,
    /// Startup fails if the metrics server is not bound after this long
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(super::env_string)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            metrics_port: parse_or(lookup("METRICS_PORT"), DEFAULT_METRICS_PORT),
            build_service_port: parse_or(lookup("KUZ_SERVER_PORT"), DEFAULT_BUILD_SERVICE_PORT),
            startup_timeout_secs: parse_or(
                lookup("SERVER_STARTUP_TIMEOUT_SECS"),
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            poll_interval_ms: parse_or(
                lookup("SERVER_POLL_INTERVAL_MS"),
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            )
            .max(1),
        }
    }
}
