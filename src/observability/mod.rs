//! # Observability
//!
//! Prometheus metrics for the operator. Logging goes through `tracing` and is
//! configured once at startup.

pub mod metrics;
