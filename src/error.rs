//! Error types for Fleetward

use thiserror::Error;

/// Result type for Fleetward operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Fleetward error types
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Conflict updating {kind} {name}: expected version {expected}, found {found}")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("Fingerprint error: {0}")]
    Fingerprint(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Rollout error: {0}")]
    Rollout(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Shorthand for a not-found error on a resource kind
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        FleetError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, FleetError::Conflict { .. })
    }

    /// Whether the referenced record does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound { .. })
    }

    /// Whether retrying the same pass later can succeed.
    ///
    /// Validation and configuration errors stay broken until a human edits
    /// the input, everything else is worth another reconciliation.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            FleetError::Validation(_) | FleetError::InvalidConfig(_) | FleetError::Manifest(_)
        )
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(e: serde_yaml::Error) -> Self {
        FleetError::Yaml(e.to_string())
    }
}
