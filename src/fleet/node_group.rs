//! Node groups

use super::condition::Conditions;
use crate::error::{FleetError, Result};
use crate::fingerprint::fingerprint_value;
use crate::store::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Free-form variables passed through to the job inventory
pub type Vars = BTreeMap<String, serde_yaml::Value>;

/// A single managed node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    /// Hostname, defaults to the node name
    pub hostname: Option<String>,
    /// Per-node variable overrides
    pub vars: Vars,
}

/// Desired state of a node group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupSpec {
    /// Nodes keyed by name
    pub nodes: BTreeMap<String, NodeSpec>,
    /// Services deployed to the group, in order
    pub services: Vec<String>,
    /// Group-level variables
    pub vars: Vars,
}

/// Observed state of a node group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupStatus {
    /// Fingerprint of the current spec
    pub config_hash: String,
    /// Config hash deployed by the authoritative rollout
    pub deployed_config_hash: String,
    /// Short ID used in guard markers
    pub guard_id: String,
    /// Conditions reported by each rollout targeting the group
    pub deployment_statuses: BTreeMap<String, Conditions>,
    /// Rollout whose outcome currently defines the group
    pub authoritative_rollout: Option<String>,
    pub conditions: Conditions,
    pub observed_generation: u64,
}

/// Named collection of managed nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGroup {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: NodeGroupSpec,
    #[serde(default)]
    pub status: NodeGroupStatus,
}

impl Resource for NodeGroup {
    const KIND: &'static str = "NodeGroup";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl NodeGroup {
    pub fn new(name: impl Into<String>, spec: NodeGroupSpec) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec,
            status: NodeGroupStatus::default(),
        }
    }

    /// Node names in stable order
    pub fn node_names(&self) -> Vec<String> {
        self.spec.nodes.keys().cloned().collect()
    }

    /// Hostname of a node, falling back to its name
    pub fn hostname<'a>(&'a self, node: &'a str) -> &'a str {
        self.spec
            .nodes
            .get(node)
            .and_then(|n| n.hostname.as_deref())
            .unwrap_or(node)
    }

    /// Fingerprint of the spec
    pub fn config_hash(&self) -> Result<String> {
        fingerprint_value(&self.spec)
    }

    /// Whether the group has been reconciled at least once for its current spec
    pub fn is_reconciled(&self) -> bool {
        !self.status.config_hash.is_empty()
    }

    /// Check node names and hostnames
    pub fn validate(&self) -> Result<()> {
        let mut hostnames = BTreeSet::new();
        for name in self.spec.nodes.keys() {
            if name.trim().is_empty() {
                return Err(FleetError::Validation(format!(
                    "node group {}: node name must not be empty",
                    self.meta.name
                )));
            }
            let hostname = self.hostname(name);
            if !hostnames.insert(hostname.to_string()) {
                return Err(FleetError::Validation(format!(
                    "node group {}: duplicate hostname {}",
                    self.meta.name, hostname
                )));
            }
        }
        Ok(())
    }
}
