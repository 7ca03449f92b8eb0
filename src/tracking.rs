//! Service tracking
//!
//! Records, per node group and service kind, which credential material was
//! last rolled out and which nodes have received it. The guard manager reads
//! these records to decide when an old credential can be released.
//!
//! One record per node group, named `<node-group>-service-tracking`, holds two
//! string fields per service kind:
//!
//! - `<service>.credentialFingerprint`
//! - `<service>.updatedNodes` (JSON array of node names)

use crate::error::{FleetError, Result};
use crate::store::{retry_on_conflict, ObjectMeta, RecordStore, Resource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

const FINGERPRINT_SUFFIX: &str = ".credentialFingerprint";
const UPDATED_NODES_SUFFIX: &str = ".updatedNodes";

/// Name of the tracking record for a node group
pub fn record_name(node_group: &str) -> String {
    format!("{}-service-tracking", node_group)
}

/// Persisted tracking record for one node group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Resource for TrackingRecord {
    const KIND: &'static str = "ServiceTracking";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl TrackingRecord {
    fn for_node_group(node_group: &str) -> Self {
        let mut meta = ObjectMeta::named(record_name(node_group));
        meta.owner = Some(node_group.to_string());
        Self {
            meta,
            data: BTreeMap::new(),
        }
    }

    /// Decode the entry for one service kind
    pub fn service(&self, service: &str) -> Result<ServiceTrackingRecord> {
        let credential_fingerprint = self
            .data
            .get(&format!("{}{}", service, FINGERPRINT_SUFFIX))
            .cloned()
            .unwrap_or_default();
        let updated_nodes = match self.data.get(&format!("{}{}", service, UPDATED_NODES_SUFFIX)) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
                FleetError::Internal(format!(
                    "corrupt tracking entry {}/{}: {}",
                    self.meta.name, service, e
                ))
            })?,
            _ => Vec::new(),
        };
        Ok(ServiceTrackingRecord {
            credential_fingerprint,
            updated_nodes,
        })
    }

    fn set_service(&mut self, service: &str, record: &ServiceTrackingRecord) -> Result<()> {
        self.data.insert(
            format!("{}{}", service, FINGERPRINT_SUFFIX),
            record.credential_fingerprint.clone(),
        );
        self.data.insert(
            format!("{}{}", service, UPDATED_NODES_SUFFIX),
            serde_json::to_string(&record.updated_nodes)?,
        );
        Ok(())
    }

    /// Service kinds with an entry in this record
    pub fn services(&self) -> Vec<String> {
        self.data
            .keys()
            .filter_map(|k| k.strip_suffix(FINGERPRINT_SUFFIX))
            .map(str::to_string)
            .collect()
    }
}

/// Rollout progress of one service kind within one node group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTrackingRecord {
    /// Fingerprint of the credential material last rolled out, empty if never
    pub credential_fingerprint: String,
    /// Nodes that received that material, de-duplicated, in insertion order
    pub updated_nodes: Vec<String>,
}

impl ServiceTrackingRecord {
    /// Whether every node in `nodes` has been updated
    pub fn covers(&self, nodes: &[String]) -> bool {
        nodes.iter().all(|n| self.updated_nodes.contains(n))
    }

    fn add_node(&mut self, node: &str) -> bool {
        if self.updated_nodes.iter().any(|n| n == node) {
            return false;
        }
        self.updated_nodes.push(node.to_string());
        true
    }
}

/// Read/write access to tracking records
#[derive(Clone)]
pub struct ServiceTracker {
    store: Arc<dyn RecordStore<TrackingRecord>>,
    retries: u32,
}

impl ServiceTracker {
    pub fn new(store: Arc<dyn RecordStore<TrackingRecord>>, retries: u32) -> Self {
        Self { store, retries }
    }

    /// Tracking state for a service kind; empty when nothing was recorded yet
    pub fn get(&self, node_group: &str, service: &str) -> Result<ServiceTrackingRecord> {
        match self.store.try_get(&record_name(node_group))? {
            Some(record) => record.service(service),
            None => Ok(ServiceTrackingRecord::default()),
        }
    }

    /// Service kinds tracked for a node group
    pub fn tracked_services(&self, node_group: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .try_get(&record_name(node_group))?
            .map(|r| r.services())
            .unwrap_or_default())
    }

    /// Start over with a new fingerprint and no updated nodes
    pub fn reset(&self, node_group: &str, service: &str, fingerprint: &str) -> Result<()> {
        self.update(node_group, |record| {
            let current = record.service(service)?;
            let fresh = ServiceTrackingRecord {
                credential_fingerprint: fingerprint.to_string(),
                updated_nodes: Vec::new(),
            };
            if current == fresh && record.data.contains_key(&format!("{}{}", service, FINGERPRINT_SUFFIX)) {
                return Ok(false);
            }
            record.set_service(service, &fresh)?;
            Ok(true)
        })?;
        info!(
            "Reset service tracking for {}/{} (fingerprint {})",
            node_group, service, fingerprint
        );
        Ok(())
    }

    /// Reset when the stored fingerprint differs from `fingerprint`.
    ///
    /// Returns whether a reset happened.
    pub fn observe(&self, node_group: &str, service: &str, fingerprint: &str) -> Result<bool> {
        let mut reset = false;
        self.update(node_group, |record| {
            let current = record.service(service)?;
            reset = current.credential_fingerprint != fingerprint;
            if !reset {
                return Ok(false);
            }
            record.set_service(
                service,
                &ServiceTrackingRecord {
                    credential_fingerprint: fingerprint.to_string(),
                    updated_nodes: Vec::new(),
                },
            )?;
            Ok(true)
        })?;
        if reset {
            info!(
                "Credential material for {}/{} changed, tracking reset",
                node_group, service
            );
        }
        Ok(reset)
    }

    /// Record that a node received the current material. Idempotent.
    pub fn mark_node_updated(&self, node_group: &str, service: &str, node: &str) -> Result<()> {
        self.mark_nodes_updated(node_group, service, &[node.to_string()])
    }

    /// Record several updated nodes in one write. Idempotent.
    pub fn mark_nodes_updated(&self, node_group: &str, service: &str, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.update(node_group, |record| {
            let mut current = record.service(service)?;
            let mut changed = false;
            for node in nodes {
                changed |= current.add_node(node);
            }
            if changed {
                record.set_service(service, &current)?;
            }
            Ok(changed)
        })?;
        debug!(
            "Marked {} node(s) updated for {}/{}",
            nodes.len(),
            node_group,
            service
        );
        Ok(())
    }

    /// Drop updated nodes that are no longer part of the group
    pub fn retain_nodes(&self, node_group: &str, service: &str, nodes: &BTreeSet<String>) -> Result<()> {
        if self.store.try_get(&record_name(node_group))?.is_none() {
            return Ok(());
        }
        self.update(node_group, |record| {
            let mut current = record.service(service)?;
            let before = current.updated_nodes.len();
            current.updated_nodes.retain(|n| nodes.contains(n));
            if current.updated_nodes.len() == before {
                return Ok(false);
            }
            info!(
                "Pruned {} departed node(s) from tracking {}/{}",
                before - current.updated_nodes.len(),
                node_group,
                service
            );
            record.set_service(service, &current)?;
            Ok(true)
        })?;
        Ok(())
    }

    /// Remove the tracking record of a deleted node group
    pub fn delete(&self, node_group: &str) -> Result<()> {
        match self.store.delete(&record_name(node_group)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // Read-modify-write, creating the record on first use. A racing create
    // surfaces as a conflict so the cycle re-reads.
    fn update<F>(&self, node_group: &str, mut mutate: F) -> Result<()>
    where
        F: FnMut(&mut TrackingRecord) -> Result<bool>,
    {
        let name = record_name(node_group);
        retry_on_conflict(self.retries, || match self.store.try_get(&name)? {
            Some(mut record) => {
                if mutate(&mut record)? {
                    self.store.update(record)?;
                }
                Ok(())
            }
            None => {
                let mut record = TrackingRecord::for_node_group(node_group);
                if mutate(&mut record)? {
                    self.store.create(record).map_err(|e| match e {
                        FleetError::AlreadyExists { kind, name } => FleetError::Conflict {
                            kind,
                            name,
                            expected: 0,
                            found: 0,
                        },
                        other => other,
                    })?;
                }
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> ServiceTracker {
        ServiceTracker::new(Arc::new(MemoryStore::new()), 10)
    }

    #[test]
    fn test_get_missing_is_empty() {
        let t = tracker();
        let record = t.get("edpm-a", "nova").unwrap();
        assert!(record.credential_fingerprint.is_empty());
        assert!(record.updated_nodes.is_empty());
    }

    #[test]
    fn test_mark_node_updated_is_idempotent() {
        let t = tracker();
        t.reset("edpm-a", "nova", "fp1").unwrap();
        t.mark_node_updated("edpm-a", "nova", "n0").unwrap();
        t.mark_node_updated("edpm-a", "nova", "n0").unwrap();
        t.mark_nodes_updated("edpm-a", "nova", &["n1".to_string(), "n0".to_string()])
            .unwrap();

        let record = t.get("edpm-a", "nova").unwrap();
        assert_eq!(record.updated_nodes, vec!["n0", "n1"]);
        assert_eq!(record.credential_fingerprint, "fp1");
    }

    #[test]
    fn test_observe_resets_on_rotation() {
        let t = tracker();
        assert!(t.observe("edpm-a", "nova", "fp1").unwrap());
        t.mark_nodes_updated("edpm-a", "nova", &["n0".to_string(), "n1".to_string()])
            .unwrap();

        assert!(!t.observe("edpm-a", "nova", "fp1").unwrap());
        assert_eq!(t.get("edpm-a", "nova").unwrap().updated_nodes.len(), 2);

        assert!(t.observe("edpm-a", "nova", "fp2").unwrap());
        let record = t.get("edpm-a", "nova").unwrap();
        assert_eq!(record.credential_fingerprint, "fp2");
        assert!(record.updated_nodes.is_empty());
    }

    #[test]
    fn test_record_layout() {
        let store: Arc<MemoryStore<TrackingRecord>> = Arc::new(MemoryStore::new());
        let t = ServiceTracker::new(store.clone(), 3);
        t.reset("edpm-a", "nova", "fp1").unwrap();
        t.mark_node_updated("edpm-a", "nova", "n0").unwrap();
        t.reset("edpm-a", "neutron", "fp9").unwrap();

        let record = store.get("edpm-a-service-tracking").unwrap();
        assert_eq!(record.meta.owner.as_deref(), Some("edpm-a"));
        assert_eq!(record.data["nova.credentialFingerprint"], "fp1");
        assert_eq!(record.data["nova.updatedNodes"], "[\"n0\"]");
        assert_eq!(record.data["neutron.updatedNodes"], "[]");
        assert_eq!(t.tracked_services("edpm-a").unwrap(), vec!["neutron", "nova"]);
    }

    #[test]
    fn test_retain_nodes_prunes_departed() {
        let t = tracker();
        t.reset("edpm-a", "nova", "fp1").unwrap();
        t.mark_nodes_updated("edpm-a", "nova", &["n0".to_string(), "n1".to_string(), "n2".to_string()])
            .unwrap();

        let remaining: BTreeSet<String> = ["n0".to_string(), "n2".to_string()].into();
        t.retain_nodes("edpm-a", "nova", &remaining).unwrap();
        assert_eq!(t.get("edpm-a", "nova").unwrap().updated_nodes, vec!["n0", "n2"]);

        // no record yet: nothing to prune
        t.retain_nodes("edpm-b", "nova", &remaining).unwrap();
        assert!(t.tracked_services("edpm-b").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_marks_are_not_lost() {
        let t = ServiceTracker::new(Arc::new(MemoryStore::new()), 1000);
        t.reset("edpm-a", "nova", "fp1").unwrap();

        std::thread::scope(|s| {
            for worker in 0..4 {
                let t = t.clone();
                s.spawn(move || {
                    for i in 0..10 {
                        t.mark_node_updated("edpm-a", "nova", &format!("n{}-{}", worker, i))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(t.get("edpm-a", "nova").unwrap().updated_nodes.len(), 40);
    }

    #[test]
    fn test_delete_cascade() {
        let t = tracker();
        t.reset("edpm-a", "nova", "fp1").unwrap();
        t.delete("edpm-a").unwrap();
        t.delete("edpm-a").unwrap();
        assert!(t.get("edpm-a", "nova").unwrap().credential_fingerprint.is_empty());
    }
}
