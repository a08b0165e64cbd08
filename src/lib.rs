//! # Qliksense Operator
//!
//! A Kubernetes operator that installs Qlik Sense from GitOps manifests and keeps
//! the installation reconciled.
//!
//! ## Overview
//!
//! For every `Qliksense` custom resource the operator:
//!
//! 1. **Acquires manifests** - Clones the declared git repository at the CR's version
//! 2. **Installs** - Writes overlay patches, runs `kustomize build` and applies the result
//! 3. **Runs the ops runner** - Keeps a Job or CronJob that re-applies a watched branch
//! 4. **Takes ownership** - Sets the CR as controller owner of everything it installed
//! 5. **Cleans up** - Tears the installation down when the CR is deleted
//!
//! The operator also serves a build callback (`POST /kuz`) used by ops-runner pods
//! to render manifests, plus Prometheus metrics and health checks.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;

pub use controller::reconciler::{reconcile, Reconciler, ReconcilerError};
pub use crd::{Qliksense, QliksenseSpec, QliksenseStatus};
