//! Services: units of configuration applied to node groups

use super::node_group::Vars;
use crate::error::{FleetError, Result};
use crate::store::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};

/// Extra volume made available to a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    /// Secret or config source the mount is filled from
    pub source: String,
    pub mount_path: String,
}

/// Service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Playbook path inside the runner image
    pub playbook: Option<String>,
    /// Inline playbook
    pub playbook_contents: Option<String>,
    /// Role to run
    pub role: Option<String>,
    pub extra_vars: Vars,
    pub mounts: Vec<Mount>,
    /// Run once per rollout across all node groups
    pub deploy_on_all_node_groups: bool,
    /// De-duplication key within a rollout, defaults to the name
    pub service_type: Option<String>,
    /// Image override for jobs of this service
    pub runner_image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

impl Resource for Service {
    const KIND: &'static str = "Service";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Service {
    pub fn new(name: impl Into<String>, spec: ServiceSpec) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec,
        }
    }

    /// Service kind: `service_type` when set, otherwise the name
    pub fn kind(&self) -> &str {
        match self.spec.service_type.as_deref() {
            Some(kind) if !kind.is_empty() => kind,
            _ => &self.meta.name,
        }
    }

    /// Exactly one of playbook, inline contents or role must be set
    pub fn validate(&self) -> Result<()> {
        let sources = [
            self.spec.playbook.is_some(),
            self.spec.playbook_contents.is_some(),
            self.spec.role.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if sources != 1 {
            return Err(FleetError::Validation(format!(
                "service {}: exactly one of playbook, playbook_contents or role is required",
                self.meta.name
            )));
        }
        Ok(())
    }
}
