//! # Controller
//!
//! Reconciliation of Qliksense resources and the components it drives.
//!
//! - `reconciler` - the reconcile loop and its context
//! - `cluster` - Kubernetes access behind traits
//! - `registry`, `acquisition` - per-CR manifest trees and where they come from
//! - `kustomize`, `install` - rendering and applying manifests
//! - `opsrunner` - the ops-runner Job/CronJob
//! - `owner` - owner references on installed objects
//! - `finalizer` - teardown on deletion
//! - `build_service`, `archive` - the `/kuz` build callback
//! - `operator_owner` - the object owning what the operator creates for itself
//! - `server` - metrics and health checks

pub mod acquisition;
pub mod archive;
pub mod backoff;
pub mod build_service;
pub mod cluster;
pub mod finalizer;
pub mod install;
pub mod kustomize;
pub mod operator_owner;
pub mod opsrunner;
pub mod owner;
pub mod reconciler;
pub mod registry;
pub mod server;
