//! Credential guard manager
//!
//! Places a guard marker (a finalizer) on every shared broker credential a
//! node group currently depends on, and removes it once no node of the group,
//! nor of any peer group on the same broker cluster, can still be using it.
//! Markers are added eagerly and released lazily. The decision is derived
//! only from service tracking plus the live credential usage, so running it
//! again is always safe.

use crate::config::MAX_MARKER_LEN;
use crate::error::{FleetError, Result};
use crate::fingerprint::guard_id;
use crate::fleet::{Fleet, NodeGroup, Service, SharedCredential};
use crate::inventory::{CredentialUsage, FleetInventory};
use crate::store::{modify, RecordStore};
use crate::tracking::ServiceTracker;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Build the guard marker for a node group and service kind
pub fn marker(prefix: &str, guard_id: &str, service: &str) -> Result<String> {
    let marker = format!("{}/{}-{}", prefix, guard_id, service);
    if marker.len() > MAX_MARKER_LEN {
        return Err(FleetError::Validation(format!(
            "guard marker {} is {} characters, limit is {}",
            marker,
            marker.len(),
            MAX_MARKER_LEN
        )));
    }
    Ok(marker)
}

/// What one guard pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardReport {
    pub marker: String,
    /// Reason the pass stopped early, if it did
    pub skipped: Option<String>,
    pub safe_to_release: bool,
    /// Credentials that received the marker
    pub added: Vec<String>,
    /// Credentials the marker was released from
    pub removed: Vec<String>,
    /// Credentials no longer in use whose marker is held until the rollout completes
    pub pending: Vec<String>,
    /// Credentials whose update failed, with the error
    pub failed: Vec<(String, String)>,
}

impl GuardReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Applies guard markers for node groups
#[derive(Clone)]
pub struct GuardManager {
    node_groups: Arc<dyn RecordStore<NodeGroup>>,
    services: Arc<dyn RecordStore<Service>>,
    credentials: Arc<dyn RecordStore<SharedCredential>>,
    tracker: ServiceTracker,
    inventory: Arc<dyn FleetInventory>,
    prefix: String,
    namespace: String,
    retries: u32,
}

impl GuardManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_groups: Arc<dyn RecordStore<NodeGroup>>,
        services: Arc<dyn RecordStore<Service>>,
        credentials: Arc<dyn RecordStore<SharedCredential>>,
        tracker: ServiceTracker,
        inventory: Arc<dyn FleetInventory>,
        prefix: impl Into<String>,
        namespace: impl Into<String>,
        retries: u32,
    ) -> Self {
        Self {
            node_groups,
            services,
            credentials,
            tracker,
            inventory,
            prefix: prefix.into(),
            namespace: namespace.into(),
            retries,
        }
    }

    /// Guard manager over a fleet's stores
    pub fn for_fleet(fleet: &Fleet, inventory: Arc<dyn FleetInventory>) -> Self {
        Self::new(
            fleet.node_groups.clone(),
            fleet.services.clone(),
            fleet.credentials.clone(),
            fleet.tracker(),
            inventory,
            fleet.config.guard_prefix.clone(),
            fleet.config.namespace.clone(),
            fleet.config.conflict_retries,
        )
    }

    /// Credential kinds of the services a node group runs, de-duplicated,
    /// in list order. A service without a definition counts under its own
    /// name.
    pub fn service_kinds(&self, group: &NodeGroup) -> Result<Vec<String>> {
        let mut seen = BTreeSet::new();
        let mut kinds = Vec::new();
        for name in &group.spec.services {
            let kind = match self.services.try_get(name)? {
                Some(service) => self.inventory.credential_kind(service.kind()),
                None => self.inventory.credential_kind(name),
            };
            if seen.insert(kind.clone()) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    /// Credential usage of a kind; `None` when the kind has no credentials
    pub fn usage(&self, service_kind: &str) -> Result<Option<CredentialUsage>> {
        self.inventory
            .resolve_credential_usage(service_kind, &self.namespace)
    }

    /// The part of `usage` a node group depends on: the secrets mounted by
    /// its services of this kind, or everything when they mount none of them
    pub fn group_usage(
        &self,
        group: &NodeGroup,
        service_kind: &str,
        usage: &CredentialUsage,
    ) -> Result<CredentialUsage> {
        let mut mounted = BTreeSet::new();
        for name in &group.spec.services {
            let Some(service) = self.services.try_get(name)? else {
                continue;
            };
            if self.inventory.credential_kind(service.kind()) != service_kind {
                continue;
            }
            mounted.extend(service.spec.mounts.iter().map(|m| m.source.clone()));
        }
        Ok(usage.scoped(&mounted))
    }

    /// Run one guard pass for a node group and service kind
    pub fn reconcile(&self, group: &NodeGroup, service: &str) -> Result<GuardReport> {
        let ng = &group.meta.name;

        let tracking = self.tracker.get(ng, service)?;
        if tracking.credential_fingerprint.is_empty() {
            debug!("No credential fingerprint for {}/{}, skipping guards", ng, service);
            return Ok(GuardReport::skipped("no credential fingerprint recorded"));
        }
        if tracking.updated_nodes.is_empty() {
            debug!("No nodes updated for {}/{}, skipping guards", ng, service);
            return Ok(GuardReport::skipped("no nodes updated yet"));
        }

        let Some(all) = self.usage(service)? else {
            return Ok(GuardReport::skipped("service kind has no credentials"));
        };
        let current = all.fingerprint()?;
        let usage = self.group_usage(group, service, &all)?;

        let nodes = group.node_names();
        let group_updated = tracking.covers(&nodes);
        let peers_updated = self.peers_updated(group, service, &all, &usage, &current)?;
        let safe_to_release = group_updated && peers_updated;

        if usage.identities.is_empty() {
            info!("No credentials in use for {}/{}, skipping guards", ng, service);
            return Ok(GuardReport {
                safe_to_release,
                ..GuardReport::skipped("no credentials in use")
            });
        }
        if tracking.credential_fingerprint != current {
            info!(
                "Credential material for {}/{} changed since the last rollout, holding all markers",
                ng, service
            );
            return Ok(GuardReport {
                safe_to_release: false,
                ..GuardReport::skipped("credential material changed since last rollout")
            });
        }

        let id = if group.status.guard_id.is_empty() {
            guard_id(ng)
        } else {
            group.status.guard_id.clone()
        };
        let marker = marker(&self.prefix, &id, service)?;

        if safe_to_release {
            info!(
                "All nodes of {} and its peers updated for {}, releasing stale markers {}",
                ng, service, marker
            );
        } else {
            info!(
                "Rollout of {} for {} in progress ({}/{} nodes, peers updated: {}), adding markers only",
                service,
                ng,
                tracking.updated_nodes.len(),
                nodes.len(),
                peers_updated
            );
        }

        let mut report = GuardReport {
            marker: marker.clone(),
            safe_to_release,
            ..Default::default()
        };

        for credential in self.credentials.list()? {
            let name = credential.meta.name.clone();
            let in_use = credential.matches_any(&usage.identities);
            let has_marker = credential.meta.has_finalizer(&marker);

            let result = if in_use && !has_marker {
                info!("Adding marker {} to credential {}", marker, name);
                self.edit(&name, |c| Ok(c.meta.add_finalizer(&marker)))
                    .map(|_| report.added.push(name.clone()))
            } else if !in_use && has_marker && safe_to_release {
                info!("Removing marker {} from credential {} (no longer in use)", marker, name);
                self.edit(&name, |c| Ok(c.meta.remove_finalizer(&marker)))
                    .map(|_| report.removed.push(name.clone()))
            } else if !in_use && has_marker {
                info!(
                    "Credential {} no longer in use by {}, holding marker until all nodes are updated",
                    name, ng
                );
                report.pending.push(name.clone());
                Ok(())
            } else {
                Ok(())
            };

            if let Err(e) = result {
                error!("Failed to update marker {} on credential {}: {}", marker, name, e);
                report.failed.push((name, e.to_string()));
            }
        }

        Ok(report)
    }

    /// Drop every marker a node group holds, used when the group goes away
    pub fn release_node_group(&self, node_group: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/{}-", self.prefix, guard_id(node_group));
        let mut released = Vec::new();
        for credential in self.credentials.list()? {
            if !credential.meta.finalizers.iter().any(|f| f.starts_with(&prefix)) {
                continue;
            }
            let name = credential.meta.name.clone();
            match self.edit(&name, |c| {
                let before = c.meta.finalizers.len();
                c.meta.finalizers.retain(|f| !f.starts_with(&prefix));
                Ok(before != c.meta.finalizers.len())
            }) {
                Ok(()) => released.push(name),
                Err(e) => warn!("Failed to release markers of {} on {}: {}", node_group, name, e),
            }
        }
        if !released.is_empty() {
            info!("Released markers of deleted node group {} from {:?}", node_group, released);
        }
        Ok(released)
    }

    /// Whether every other group on a shared broker cluster has the current
    /// material on all of its nodes
    fn peers_updated(
        &self,
        group: &NodeGroup,
        service: &str,
        all: &CredentialUsage,
        ours: &CredentialUsage,
        current: &str,
    ) -> Result<bool> {
        if all.is_empty() {
            return Ok(true);
        }
        for peer in self.node_groups.list()? {
            if peer.meta.name == group.meta.name {
                continue;
            }
            if !self.service_kinds(&peer)?.iter().any(|k| k == service) {
                continue;
            }
            let nodes = peer.node_names();
            if nodes.is_empty() {
                continue;
            }
            let theirs = self.group_usage(&peer, service, all)?;
            if !ours.shares_cluster(&theirs) {
                debug!(
                    "Peer {} uses other broker clusters for {} ({:?}), not waiting on it",
                    peer.meta.name, service, theirs.clusters
                );
                continue;
            }
            let tracking = self.tracker.get(&peer.meta.name, service)?;
            if tracking.credential_fingerprint != current || !tracking.covers(&nodes) {
                debug!(
                    "Peer {} not yet updated for {} ({}/{} nodes)",
                    peer.meta.name,
                    service,
                    tracking.updated_nodes.len(),
                    nodes.len()
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn edit<F>(&self, name: &str, mut change: F) -> Result<()>
    where
        F: FnMut(&mut SharedCredential) -> Result<bool>,
    {
        modify(self.credentials.as_ref(), name, self.retries, |c| change(c)).map(|_| ())
    }
}
