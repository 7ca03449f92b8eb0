//! Object metadata shared by every persisted record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata carried by every persisted object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    /// Object name, unique per kind
    pub name: String,
    /// Unique ID assigned on creation
    pub uid: String,
    /// Bumped by the store on every write
    pub resource_version: u64,
    /// Bumped when the desired state changes
    pub generation: u64,
    /// Store revision at creation, orders objects by age
    pub creation_index: u64,
    /// Creation timestamp
    pub created_at: Option<DateTime<Utc>>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Name of the owning object, if any
    pub owner: Option<String>,
    /// Markers that block deletion while present
    pub finalizers: Vec<String>,
    /// Set when deletion was requested but finalizers are still present
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a new object with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the object carries the given finalizer
    pub fn has_finalizer(&self, marker: &str) -> bool {
        self.finalizers.iter().any(|f| f == marker)
    }

    /// Add a finalizer; returns false if it was already present
    pub fn add_finalizer(&mut self, marker: &str) -> bool {
        if self.has_finalizer(marker) {
            return false;
        }
        self.finalizers.push(marker.to_string());
        true
    }

    /// Remove a finalizer; returns false if it was not present
    pub fn remove_finalizer(&mut self, marker: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != marker);
        before != self.finalizers.len()
    }

    /// Whether deletion was requested and is waiting on finalizers
    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }
}
