//! # Qliksense Status
//!
//! Status conditions owned by the reconcile loop.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types written by the operator
pub mod condition_types {
    pub const INITIALIZED: &str = "Initialized";
    pub const GIT_MODE: &str = "GitMode";
    pub const CLI_MODE: &str = "CliMode";
    pub const OPS_RUNNER_MODE: &str = "OpsRunnerMode";
    pub const ERROR: &str = "Error";
}

/// Status of the Qliksense resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QliksenseStatus {
    /// Conditions, at most one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

impl QliksenseStatus {
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    pub fn is_condition_true(&self, r#type: &str) -> bool {
        self.condition(r#type).is_some_and(Condition::is_true)
    }

    /// Insert or replace the condition with the same type.
    ///
    /// The transition time moves only when the status changes. Returns `true` when
    /// anything observable changed.
    pub fn set_condition(&mut self, mut condition: Condition) -> bool {
        let now = chrono::Utc::now().to_rfc3339();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now)
                };
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
                true
            }
        }
    }

    /// Drop the condition with the given type. Returns `true` if one was removed.
    pub fn remove_condition(&mut self, r#type: &str) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.r#type != r#type);
        before != self.conditions.len()
    }
}
