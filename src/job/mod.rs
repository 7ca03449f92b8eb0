//! Job execution interface
//!
//! The rollout aggregator hands each unit of work to a [`JobRunner`] as a
//! [`JobSpec`] and polls it for completion. How a job actually runs is the
//! runner's business.

mod dry_run;
pub mod spec;

pub use dry_run::DryRunRunner;
pub use spec::{execution_name, render_inventory, unit_fingerprint, JobRequest, JobSpec};

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Execution phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Running,
    Succeeded,
    Failed,
}

/// Observed state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub phase: JobPhase,
    /// Executions so far, including the current one
    pub attempts: u32,
    pub message: Option<String>,
}

impl JobStatus {
    pub fn succeeded(attempts: u32) -> Self {
        Self {
            phase: JobPhase::Succeeded,
            attempts,
            message: None,
        }
    }

    pub fn running(attempts: u32) -> Self {
        Self {
            phase: JobPhase::Running,
            attempts,
            message: None,
        }
    }

    pub fn failed(attempts: u32, message: impl Into<String>) -> Self {
        Self {
            phase: JobPhase::Failed,
            attempts,
            message: Some(message.into()),
        }
    }
}

/// Executes jobs
pub trait JobRunner: Send + Sync {
    /// Start a job, or start another attempt of a failed one
    fn submit(&self, spec: &JobSpec) -> Result<JobStatus>;

    /// Status of a job, `None` if it was never submitted
    fn status(&self, name: &str) -> Result<Option<JobStatus>>;

    /// Remove a job and its history
    fn delete(&self, name: &str) -> Result<()>;
}
