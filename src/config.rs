//! Operator configuration
//!
//! Loaded from a YAML file; every field is optional and falls back to the
//! defaults below.

use crate::error::{FleetError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default namespace recorded on resolved credential usage
pub const DEFAULT_NAMESPACE: &str = "openstack";

/// Default guard marker prefix
pub const DEFAULT_GUARD_PREFIX: &str = "nodeset.os";

/// Default runner image for submitted jobs
pub const DEFAULT_RUNNER_IMAGE: &str =
    "quay.io/openstack-k8s-operators/openstack-ansibleee-runner:latest";

/// Maximum length of a guard marker
pub const MAX_MARKER_LEN: usize = 63;

/// Room reserved after the prefix for `/<8-hex>-` plus a short service name
const MARKER_RESERVED: usize = 1 + 8 + 1 + 4;

/// Operator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace the fleet lives in
    pub namespace: String,
    /// Prefix of guard markers placed on shared credentials
    pub guard_prefix: String,
    /// Requeue interval while work is outstanding (seconds)
    pub requeue_seconds: u64,
    /// Requeue interval after a transient error (seconds)
    pub error_requeue_seconds: u64,
    /// Periodic full resync interval for the daemon loop (seconds)
    pub resync_seconds: u64,
    /// Execution attempts before a job failure becomes terminal
    pub default_backoff_limit: u32,
    /// Attempts for read-modify-write cycles that hit a version conflict
    pub conflict_retries: u32,
    /// Default image for submitted jobs
    pub runner_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            guard_prefix: DEFAULT_GUARD_PREFIX.to_string(),
            requeue_seconds: 15,
            error_requeue_seconds: 30,
            resync_seconds: 300,
            default_backoff_limit: 6,
            conflict_retries: 5,
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a YAML string and validate it
    pub fn parse_str(content: &str) -> Result<Self> {
        let config: OperatorConfig = if content.trim().is_empty() {
            OperatorConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| FleetError::InvalidConfig(format!("Failed to parse YAML: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let prefix_re = Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$")
            .map_err(|e| FleetError::Internal(e.to_string()))?;
        if !prefix_re.is_match(&self.guard_prefix) {
            return Err(FleetError::InvalidConfig(format!(
                "guard_prefix '{}' is not a valid DNS subdomain",
                self.guard_prefix
            )));
        }
        if self.guard_prefix.len() + MARKER_RESERVED > MAX_MARKER_LEN {
            return Err(FleetError::InvalidConfig(format!(
                "guard_prefix '{}' leaves no room for a service name",
                self.guard_prefix
            )));
        }
        if self.requeue_seconds == 0 || self.error_requeue_seconds == 0 || self.resync_seconds == 0
        {
            return Err(FleetError::InvalidConfig(
                "requeue intervals must be greater than zero".to_string(),
            ));
        }
        if self.conflict_retries == 0 {
            return Err(FleetError::InvalidConfig(
                "conflict_retries must be at least 1".to_string(),
            ));
        }
        if self.runner_image.is_empty() {
            return Err(FleetError::InvalidConfig(
                "runner_image must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}
