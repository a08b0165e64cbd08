//! # Status Management
//!
//! Collects condition changes during a reconciliation and writes them once, only
//! when something changed, so an idle resource does not generate watch events.

use crate::controller::cluster::ClusterClient;
use crate::crd::{Condition, Qliksense, QliksenseStatus};
use anyhow::{Context, Result};
use kube::ResourceExt;
use tracing::debug;

/// Working copy of a resource's status
#[derive(Debug, Clone)]
pub struct StatusTracker {
    persisted: QliksenseStatus,
    current: QliksenseStatus,
}

impl StatusTracker {
    pub fn new(qliksense: &Qliksense) -> Self {
        let persisted = qliksense.status.clone().unwrap_or_default();
        Self {
            current: persisted.clone(),
            persisted,
        }
    }

    pub fn status(&self) -> &QliksenseStatus {
        &self.current
    }

    /// Set the condition only if no condition of that type exists yet
    pub fn ensure(&mut self, condition: Condition) {
        if self.current.condition(&condition.r#type).is_none() {
            self.current.set_condition(condition);
        }
    }

    pub fn set(&mut self, condition: Condition) {
        self.current.set_condition(condition);
    }

    pub fn remove(&mut self, r#type: &str) {
        self.current.remove_condition(r#type);
    }

    pub fn is_dirty(&self) -> bool {
        self.current != self.persisted
    }

    /// Patch the status subresource if it changed. A resource deleted in the
    /// meantime is not an error.
    pub async fn persist(&mut self, cluster: &dyn ClusterClient, qliksense: &Qliksense) -> Result<()> {
        if !self.is_dirty() {
            debug!("Status unchanged, skipping update");
            return Ok(());
        }
        let name = qliksense.name_any();
        let namespace = qliksense.namespace().unwrap_or_default();
        match cluster
            .patch_qliksense_status(&namespace, &name, &self.current)
            .await
        {
            Ok(()) => {
                self.persisted = self.current.clone();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("{} is gone, dropping status update", name);
                Ok(())
            }
            Err(e) => Err(e).context("Failed to update Qliksense status"),
        }
    }
}
