//! YAML manifests
//!
//! A manifest file holds one or more YAML documents, each describing one
//! object:
//!
//! ```yaml
//! kind: NodeGroup
//! name: edpm-compute
//! spec:
//!   services: [nova]
//!   nodes:
//!     compute-0: {}
//! ---
//! kind: Secret
//! name: nova-cell1-compute-config
//! stringData:
//!   transport_url: rabbit://nova-cell1:pw@rabbitmq-cell1.openstack.svc:5672/
//! ```

use crate::error::{FleetError, Result};
use crate::fleet::{
    CredentialSpec, Fleet, NodeGroup, NodeGroupSpec, Rollout, RolloutSpec, Secret, Service,
    ServiceSpec, SharedCredential,
};
use crate::store::{retry_on_conflict, RecordStore, Resource};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// One object from a manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    NodeGroup {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        spec: NodeGroupSpec,
    },
    Service {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        spec: ServiceSpec,
    },
    Rollout {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        spec: RolloutSpec,
    },
    SharedCredential {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        #[serde(default)]
        spec: CredentialSpec,
    },
    Secret {
        name: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        /// Base64-encoded values
        #[serde(default)]
        data: BTreeMap<String, String>,
        #[serde(default, rename = "stringData", alias = "string_data")]
        string_data: BTreeMap<String, String>,
    },
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::NodeGroup { .. } => NodeGroup::KIND,
            Manifest::Service { .. } => Service::KIND,
            Manifest::Rollout { .. } => Rollout::KIND,
            Manifest::SharedCredential { .. } => SharedCredential::KIND,
            Manifest::Secret { .. } => Secret::KIND,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Manifest::NodeGroup { name, .. }
            | Manifest::Service { name, .. }
            | Manifest::Rollout { name, .. }
            | Manifest::SharedCredential { name, .. }
            | Manifest::Secret { name, .. } => name,
        }
    }
}

/// Parse every document in a YAML string; empty documents are skipped
pub fn parse_str(content: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| FleetError::Manifest(format!("document {}: {}", index + 1, e)))?;
        if value.is_null() {
            continue;
        }
        let manifest: Manifest = serde_yaml::from_value(value)
            .map_err(|e| FleetError::Manifest(format!("document {}: {}", index + 1, e)))?;
        if manifest.name().is_empty() {
            return Err(FleetError::Manifest(format!(
                "document {}: {} without a name",
                index + 1,
                manifest.kind()
            )));
        }
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Parse a manifest file, or every `.yaml`/`.yml` file under a directory in
/// path order
pub fn load_path(path: &Path) -> Result<Vec<Manifest>> {
    let files: Vec<PathBuf> = if path.is_dir() {
        let mut files = Vec::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| FleetError::Manifest(e.to_string()))?;
            let is_yaml = entry
                .path()
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if entry.file_type().is_file() && is_yaml {
                files.push(entry.into_path());
            }
        }
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut manifests = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| {
            FleetError::Manifest(format!("Failed to read {}: {}", file.display(), e))
        })?;
        let parsed = parse_str(&content)
            .map_err(|e| FleetError::Manifest(format!("{}: {}", file.display(), e)))?;
        debug!("Loaded {} object(s) from {}", parsed.len(), file.display());
        manifests.extend(parsed);
    }
    Ok(manifests)
}

/// What applying one object did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Configured,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
        };
        write!(f, "{}", s)
    }
}

/// Apply result for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub kind: &'static str,
    pub name: String,
    pub action: Action,
}

/// Objects whose desired state can be declared in a manifest
trait Declared: Resource {
    type Spec: PartialEq + Clone;

    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;

    /// Hook run after the desired state changed
    fn changed(&mut self) {}
}

impl Declared for NodeGroup {
    type Spec = NodeGroupSpec;

    fn spec(&self) -> &NodeGroupSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut NodeGroupSpec {
        &mut self.spec
    }
}

impl Declared for Service {
    type Spec = ServiceSpec;

    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut ServiceSpec {
        &mut self.spec
    }
}

impl Declared for Rollout {
    type Spec = RolloutSpec;

    fn spec(&self) -> &RolloutSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut RolloutSpec {
        &mut self.spec
    }
}

impl Declared for SharedCredential {
    type Spec = CredentialSpec;

    fn spec(&self) -> &CredentialSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut CredentialSpec {
        &mut self.spec
    }

    fn changed(&mut self) {
        self.status.username = self.spec.username.clone();
    }
}

impl Declared for Secret {
    type Spec = BTreeMap<String, String>;

    fn spec(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    fn spec_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.data
    }

    fn changed(&mut self) {
        self.modified_at = Some(Utc::now());
    }
}

/// Create the object, or update its desired state and labels. A changed spec
/// bumps the generation; status is left alone.
fn upsert<T: Declared>(store: &dyn RecordStore<T>, retries: u32, desired: T) -> Result<Action> {
    retry_on_conflict(retries, || {
        let Some(mut existing) = store.try_get(desired.name())? else {
            store.create(desired.clone())?;
            return Ok(Action::Created);
        };

        let spec_changed = existing.spec() != desired.spec();
        let labels_changed = existing.meta().labels != desired.meta().labels;
        if !spec_changed && !labels_changed {
            return Ok(Action::Unchanged);
        }
        if spec_changed {
            *existing.spec_mut() = desired.spec().clone();
            existing.meta_mut().generation += 1;
            existing.changed();
        }
        existing.meta_mut().labels = desired.meta().labels.clone();
        store.update(existing)?;
        Ok(Action::Configured)
    })
}

fn labelled<T: Resource>(mut obj: T, labels: BTreeMap<String, String>) -> T {
    obj.meta_mut().labels = labels;
    obj
}

/// Apply manifests to the fleet in order
pub fn apply(fleet: &Fleet, manifests: Vec<Manifest>) -> Result<Vec<Applied>> {
    let retries = fleet.config.conflict_retries;
    let mut applied = Vec::new();

    for manifest in manifests {
        let kind = manifest.kind();
        let name = manifest.name().to_string();
        let action = match manifest {
            Manifest::NodeGroup { name, labels, spec } => {
                let group = labelled(NodeGroup::new(name, spec), labels);
                group.validate()?;
                // Vars must fingerprint cleanly before the group is accepted.
                group.config_hash()?;
                upsert(fleet.node_groups.as_ref(), retries, group)?
            }
            Manifest::Service { name, labels, spec } => {
                let service = labelled(Service::new(name, spec), labels);
                service.validate()?;
                upsert(fleet.services.as_ref(), retries, service)?
            }
            Manifest::Rollout { name, labels, spec } => {
                let rollout = labelled(Rollout::new(name, spec), labels);
                crate::rollout::validate(&rollout)?;
                upsert(fleet.rollouts.as_ref(), retries, rollout)?
            }
            Manifest::SharedCredential { name, labels, spec } => {
                let credential = labelled(
                    SharedCredential::new(name, spec.cluster, spec.username),
                    labels,
                );
                upsert(fleet.credentials.as_ref(), retries, credential)?
            }
            Manifest::Secret {
                name,
                labels,
                data,
                string_data,
            } => {
                let secret = labelled(Secret::from_encoded(name, &data, &string_data)?, labels);
                upsert(fleet.secrets.as_ref(), retries, secret)?
            }
        };
        info!("{} {} {}", kind, name, action);
        applied.push(Applied { kind, name, action });
    }
    Ok(applied)
}
