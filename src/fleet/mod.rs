//! Fleet data model and the shared set of record stores
//!
//! [`Fleet`] bundles one store per kind plus the completion sequence, and can
//! be snapshotted to a JSON file between CLI invocations.

pub mod condition;
pub mod node_group;
pub mod rollout;
pub mod secret;
pub mod service;

pub use condition::{Condition, ConditionStatus, Conditions, Severity};
pub use node_group::{NodeGroup, NodeGroupSpec, NodeGroupStatus, NodeSpec, Vars};
pub use rollout::{Completion, CompletionOutcome, Rollout, RolloutPhase, RolloutSpec, RolloutStatus};
pub use secret::{CredentialSpec, CredentialStatus, Secret, SharedCredential};
pub use service::{Mount, Service, ServiceSpec};

use crate::config::OperatorConfig;
use crate::error::Result;
use crate::inventory::{FleetInventory, ResolverRegistry, SecretInventory};
use crate::store::{Deletion, MemoryStore, RecordStore, Sequence};
use crate::tracking::{ServiceTracker, TrackingRecord};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared state of the fleet
#[derive(Clone)]
pub struct Fleet {
    pub config: OperatorConfig,
    pub node_groups: Arc<MemoryStore<NodeGroup>>,
    pub services: Arc<MemoryStore<Service>>,
    pub rollouts: Arc<MemoryStore<Rollout>>,
    pub credentials: Arc<MemoryStore<SharedCredential>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub tracking_records: Arc<MemoryStore<TrackingRecord>>,
    /// Completion evidence sequence
    pub sequence: Sequence,
    revision: Arc<AtomicU64>,
}

/// On-disk form of a [`Fleet`]
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSnapshot {
    pub revision: u64,
    pub sequence: u64,
    pub node_groups: Vec<NodeGroup>,
    pub services: Vec<Service>,
    pub rollouts: Vec<Rollout>,
    pub credentials: Vec<SharedCredential>,
    pub secrets: Vec<Secret>,
    pub tracking: Vec<TrackingRecord>,
}

impl Fleet {
    /// Empty in-memory fleet
    pub fn new(config: OperatorConfig) -> Self {
        let revision = Arc::new(AtomicU64::new(0));
        Self {
            config,
            node_groups: Arc::new(MemoryStore::with_revision(revision.clone())),
            services: Arc::new(MemoryStore::with_revision(revision.clone())),
            rollouts: Arc::new(MemoryStore::with_revision(revision.clone())),
            credentials: Arc::new(MemoryStore::with_revision(revision.clone())),
            secrets: Arc::new(MemoryStore::with_revision(revision.clone())),
            tracking_records: Arc::new(MemoryStore::with_revision(revision.clone())),
            sequence: Sequence::default(),
            revision,
        }
    }

    /// Tracking accessor bound to this fleet's store
    pub fn tracker(&self) -> ServiceTracker {
        ServiceTracker::new(self.tracking_records.clone(), self.config.conflict_retries)
    }

    /// Inventory over this fleet's secrets with the built-in resolvers
    pub fn inventory(&self) -> Arc<dyn FleetInventory> {
        Arc::new(SecretInventory::new(
            self.secrets.clone(),
            ResolverRegistry::with_defaults(),
            self.config.namespace.clone(),
        ))
    }

    /// Delete a node group and the tracking record it owns
    pub fn delete_node_group(&self, name: &str) -> Result<Deletion> {
        let deletion = self.node_groups.delete(name)?;
        if deletion == Deletion::Deleted {
            self.tracker().delete(name)?;
            info!("Deleted node group {} and its service tracking", name);
        }
        Ok(deletion)
    }

    /// Capture every store
    pub fn snapshot(&self) -> Result<FleetSnapshot> {
        Ok(FleetSnapshot {
            revision: self.revision.load(Ordering::SeqCst),
            sequence: self.sequence.current(),
            node_groups: self.node_groups.list()?,
            services: self.services.list()?,
            rollouts: self.rollouts.list()?,
            credentials: self.credentials.list()?,
            secrets: self.secrets.list()?,
            tracking: self.tracking_records.list()?,
        })
    }

    /// Rebuild a fleet from a snapshot
    pub fn from_snapshot(config: OperatorConfig, snapshot: FleetSnapshot) -> Result<Self> {
        let fleet = Self::new(config);
        fleet.revision.store(snapshot.revision, Ordering::SeqCst);
        fleet.node_groups.restore(snapshot.node_groups)?;
        fleet.services.restore(snapshot.services)?;
        fleet.rollouts.restore(snapshot.rollouts)?;
        fleet.credentials.restore(snapshot.credentials)?;
        fleet.secrets.restore(snapshot.secrets)?;
        fleet.tracking_records.restore(snapshot.tracking)?;
        let fleet = Self {
            sequence: Sequence::new(snapshot.sequence),
            ..fleet
        };
        Ok(fleet)
    }

    /// Load state from `path`; a missing file yields an empty fleet
    pub fn load(config: OperatorConfig, path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No state at {}, starting empty", path.display());
            return Ok(Self::new(config));
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: FleetSnapshot = serde_json::from_str(&content)?;
        Self::from_snapshot(config, snapshot)
    }

    /// Write state to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = self.snapshot()?;
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved fleet state to {}", path.display());
        Ok(())
    }
}
