//! Status conditions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall readiness of an object
pub const READY: &str = "Ready";
/// Readiness of the rollout(s) targeting a node group
pub const DEPLOYMENT_READY: &str = "DeploymentReady";
/// Inputs (node groups, services) are present and reconciled
pub const INPUT_READY: &str = "InputReady";

/// Condition key for a single service within a rollout
pub fn service_condition(service: &str) -> String {
    format!("ServiceReady/{}", service)
}

pub const REASON_REQUESTED: &str = "Requested";
pub const REASON_IN_PROGRESS: &str = "InProgress";
pub const REASON_READY: &str = "Ready";
pub const REASON_ERROR: &str = "Error";
pub const REASON_INPUT_NOT_READY: &str = "InputNotReady";
pub const REASON_BACKOFF_LIMIT_EXCEEDED: &str = "BackoffLimitExceeded";

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Severity of a non-true condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Info,
    Warning,
    Error,
}

/// A single observed condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition key
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    /// When the status last changed
    pub last_transition: DateTime<Utc>,
}

/// Ordered set of conditions keyed by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    pub fn is_true(&self, kind: &str) -> bool {
        self.get(kind)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Whether the condition is false with error severity
    pub fn is_error(&self, kind: &str) -> bool {
        self.get(kind)
            .map(|c| c.status == ConditionStatus::False && c.severity == Severity::Error)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert or replace a condition; the transition time only moves when
    /// the status changes
    pub fn set(&mut self, mut condition: Condition) {
        match self.0.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition = existing.last_transition;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    pub fn mark_true(&mut self, kind: &str, message: impl Into<String>) {
        self.set(Condition {
            kind: kind.to_string(),
            status: ConditionStatus::True,
            reason: REASON_READY.to_string(),
            severity: Severity::None,
            message: message.into(),
            last_transition: Utc::now(),
        });
    }

    pub fn mark_false(
        &mut self,
        kind: &str,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
    ) {
        self.set(Condition {
            kind: kind.to_string(),
            status: ConditionStatus::False,
            reason: reason.to_string(),
            severity,
            message: message.into(),
            last_transition: Utc::now(),
        });
    }

    pub fn mark_unknown(&mut self, kind: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition {
            kind: kind.to_string(),
            status: ConditionStatus::Unknown,
            reason: reason.to_string(),
            severity: Severity::None,
            message: message.into(),
            last_transition: Utc::now(),
        });
    }

    pub fn remove(&mut self, kind: &str) {
        self.0.retain(|c| c.kind != kind);
    }
}
