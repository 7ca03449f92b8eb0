//! Rollout requests

use super::condition::Conditions;
use super::node_group::Vars;
use crate::store::{ObjectMeta, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired rollout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSpec {
    /// Target node groups, processed in this order
    pub node_groups: Vec<String>,
    /// Services to run instead of each group's own list
    pub services_override: Vec<String>,
    /// Node selector expression
    pub node_limit: Option<String>,
    pub tags: Vec<String>,
    pub skip_tags: Vec<String>,
    pub extra_vars: Vars,
    /// Execution attempts before a job failure is terminal
    pub backoff_limit: Option<u32>,
    /// Requeue interval while jobs run
    pub requeue_seconds: Option<u64>,
}

/// Rollout lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    #[default]
    Pending,
    Running,
    Ready,
    FailedRetryable,
    FailedTerminal,
}

impl RolloutPhase {
    /// Ready or terminally failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutPhase::Ready | RolloutPhase::FailedTerminal)
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutPhase::Pending => "Pending",
            RolloutPhase::Running => "Running",
            RolloutPhase::Ready => "Ready",
            RolloutPhase::FailedRetryable => "FailedRetryable",
            RolloutPhase::FailedTerminal => "FailedTerminal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
}

/// Evidence that a rollout finished, ordered by `sequence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub outcome: CompletionOutcome,
}

/// Observed state of a rollout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutStatus {
    pub phase: RolloutPhase,
    /// Conditions per target node group
    pub node_group_conditions: BTreeMap<String, Conditions>,
    /// Unit-of-work fingerprint per execution name
    pub job_hashes: BTreeMap<String, String>,
    /// Unit-of-work fingerprint of each in-flight job
    pub submitted: BTreeMap<String, String>,
    /// Failed attempt count already reported per execution
    pub failures: BTreeMap<String, u32>,
    /// Config hash of each node group when it was deployed
    pub node_group_hashes: BTreeMap<String, String>,
    pub deployed: bool,
    pub completion: Option<Completion>,
    pub message: Option<String>,
    pub conditions: Conditions,
    pub observed_generation: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rollout {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: RolloutSpec,
    #[serde(default)]
    pub status: RolloutStatus,
}

impl Resource for Rollout {
    const KIND: &'static str = "Rollout";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Rollout {
    pub fn new(name: impl Into<String>, spec: RolloutSpec) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec,
            status: RolloutStatus::default(),
        }
    }

    pub fn targets(&self, node_group: &str) -> bool {
        self.spec.node_groups.iter().any(|ng| ng == node_group)
    }

    /// Terminal for the current generation
    pub fn is_finished(&self) -> bool {
        self.status.phase.is_terminal() && self.status.observed_generation == self.meta.generation
    }
}
