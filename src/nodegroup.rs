//! Node-group reconciler
//!
//! Keeps a node group's status in line with the rollouts that target it and
//! runs the guard manager for every credential-bearing service the group
//! runs.

use crate::controller::Outcome;
use crate::error::Result;
use crate::fingerprint::guard_id;
use crate::fleet::condition::{
    DEPLOYMENT_READY, READY, REASON_BACKOFF_LIMIT_EXCEEDED, REASON_ERROR, REASON_IN_PROGRESS,
    REASON_REQUESTED,
};
use crate::fleet::{Conditions, Fleet, NodeGroup, Rollout, RolloutPhase, Severity};
use crate::guard::{GuardManager, GuardReport};
use crate::store::{modify, RecordStore};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// How the rollouts targeting a group add up
#[derive(Debug, Default)]
pub struct RolloutSummary {
    /// Per-rollout conditions for this group
    pub statuses: BTreeMap<String, Conditions>,
    /// Terminal rollout with the highest completion sequence
    pub authoritative: Option<Rollout>,
    /// Newest outstanding rollout created after the authoritative one
    pub controlling: Option<Rollout>,
    pub outstanding: bool,
}

/// Aggregate the rollouts that target `ng`
pub fn summarize(ng: &str, rollouts: &[Rollout]) -> RolloutSummary {
    let mut summary = RolloutSummary::default();
    let targeting: Vec<&Rollout> = rollouts.iter().filter(|r| r.targets(ng)).collect();

    for rollout in &targeting {
        let conditions = rollout
            .status
            .node_group_conditions
            .get(ng)
            .cloned()
            .unwrap_or_else(|| {
                let mut c = Conditions::new();
                c.mark_unknown(DEPLOYMENT_READY, REASON_REQUESTED, "rollout requested");
                c
            });
        summary.statuses.insert(rollout.meta.name.clone(), conditions);
    }

    summary.authoritative = targeting
        .iter()
        .filter(|r| r.is_finished())
        .filter_map(|r| r.status.completion.as_ref().map(|c| (c.sequence, *r)))
        .max_by_key(|(seq, _)| *seq)
        .map(|(_, r)| r.clone());

    let after = summary
        .authoritative
        .as_ref()
        .map(|r| r.meta.creation_index)
        .unwrap_or(0);
    let outstanding: Vec<&&Rollout> = targeting.iter().filter(|r| !r.is_finished()).collect();
    summary.outstanding = !outstanding.is_empty();
    summary.controlling = outstanding
        .into_iter()
        .filter(|r| r.meta.creation_index > after)
        .max_by_key(|r| r.meta.creation_index)
        .map(|r| (*r).clone());

    summary
}

/// Reconciles node groups
#[derive(Clone)]
pub struct NodeGroupReconciler {
    fleet: Fleet,
    guards: GuardManager,
}

impl NodeGroupReconciler {
    pub fn new(fleet: Fleet, guards: GuardManager) -> Self {
        Self { fleet, guards }
    }

    /// Run one pass for the named node group
    pub fn reconcile(&self, name: &str) -> Result<Outcome> {
        let Some(group) = self.fleet.node_groups.try_get(name)? else {
            debug!("Node group {} not found, nothing to do", name);
            return Ok(Outcome::Done);
        };

        if let Err(e) = group.validate() {
            warn!("Node group {} is invalid: {}", name, e);
            let message = e.to_string();
            self.write_status(name, |g| {
                g.status
                    .conditions
                    .mark_false(READY, REASON_ERROR, Severity::Error, &message);
            })?;
            return Err(e);
        }

        let config_hash = group.config_hash()?;
        let id = guard_id(name);
        let nodes: BTreeSet<String> = group.spec.nodes.keys().cloned().collect();

        let tracker = self.fleet.tracker();
        for service in tracker.tracked_services(name)? {
            tracker.retain_nodes(name, &service, &nodes)?;
        }

        let rollouts = self.fleet.rollouts.list()?;
        let summary = summarize(name, &rollouts);
        let (deployment, deployed_hash) = visible_condition(name, &summary, &config_hash);

        if config_hash != group.status.config_hash {
            info!("Node group {} config hash is now {}", name, config_hash);
        }

        let authoritative = summary.authoritative.as_ref().map(|r| r.meta.name.clone());
        let group = self.write_status(name, |g| {
            g.status.config_hash = config_hash.clone();
            g.status.guard_id = id.clone();
            g.status.deployment_statuses = summary.statuses.clone();
            g.status.authoritative_rollout = authoritative.clone();
            if let Some(hash) = &deployed_hash {
                g.status.deployed_config_hash = hash.clone();
            }
            for condition in deployment.iter() {
                let mut ready = condition.clone();
                ready.kind = READY.to_string();
                g.status.conditions.set(condition.clone());
                g.status.conditions.set(ready);
            }
            g.status.observed_generation = g.meta.generation;
        })?;

        for report in self.run_guards(&group)? {
            debug!("Guard pass for {}: {:?}", name, report);
        }

        if summary.outstanding {
            Ok(Outcome::RequeueAfter(self.fleet.config.requeue()))
        } else {
            Ok(Outcome::Done)
        }
    }

    /// Phase 2: guard markers for every credential-bearing service kind.
    /// A failing kind is logged and the others still run.
    fn run_guards(&self, group: &NodeGroup) -> Result<Vec<GuardReport>> {
        let mut reports = Vec::new();
        for kind in self.guards.service_kinds(group)? {
            match self.guards.usage(&kind) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to resolve credentials of {} for {}: {}", kind, group.meta.name, e);
                    continue;
                }
            }
            match self.guards.reconcile(group, &kind) {
                Ok(report) => {
                    for (credential, err) in &report.failed {
                        error!(
                            "Guard {} on credential {} failed: {}",
                            report.marker, credential, err
                        );
                    }
                    reports.push(report);
                }
                Err(e) => error!(
                    "Guard pass for {} service {} failed: {}",
                    group.meta.name, kind, e
                ),
            }
        }
        Ok(reports)
    }

    fn write_status<F>(&self, name: &str, mut update: F) -> Result<NodeGroup>
    where
        F: FnMut(&mut NodeGroup),
    {
        modify(
            self.fleet.node_groups.as_ref(),
            name,
            self.fleet.config.conflict_retries,
            |g| {
                update(g);
                Ok(true)
            },
        )
    }
}

/// Deployment condition shown on the group, plus the config hash the
/// authoritative rollout deployed if it succeeded
fn visible_condition(ng: &str, summary: &RolloutSummary, config_hash: &str) -> (Conditions, Option<String>) {
    let mut out = Conditions::new();

    let deployed_hash = summary.authoritative.as_ref().and_then(|r| {
        if r.status.phase == RolloutPhase::Ready {
            r.status.node_group_hashes.get(ng).cloned()
        } else {
            None
        }
    });

    if let Some(rollout) = &summary.controlling {
        let copied = rollout
            .status
            .node_group_conditions
            .get(ng)
            .and_then(|c| c.get(DEPLOYMENT_READY))
            .cloned();
        match copied {
            Some(condition) => out.set(condition),
            None => out.mark_false(
                DEPLOYMENT_READY,
                REASON_IN_PROGRESS,
                Severity::Info,
                format!("rollout {} in progress", rollout.meta.name),
            ),
        }
    } else if let Some(rollout) = &summary.authoritative {
        match rollout.status.phase {
            RolloutPhase::Ready if deployed_hash.as_deref() == Some(config_hash) => {
                out.mark_true(
                    DEPLOYMENT_READY,
                    format!("deployed by rollout {}", rollout.meta.name),
                );
            }
            RolloutPhase::Ready => out.mark_false(
                DEPLOYMENT_READY,
                REASON_REQUESTED,
                Severity::Warning,
                format!(
                    "node group changed since rollout {}, a new rollout is required",
                    rollout.meta.name
                ),
            ),
            _ => out.mark_false(
                DEPLOYMENT_READY,
                REASON_BACKOFF_LIMIT_EXCEEDED,
                Severity::Error,
                rollout
                    .status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("rollout {} failed", rollout.meta.name)),
            ),
        }
    } else {
        out.mark_unknown(DEPLOYMENT_READY, REASON_REQUESTED, "no rollout has completed");
    }

    (out, deployed_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{Completion, CompletionOutcome, ConditionStatus, NodeSpec, RolloutSpec};
    use crate::job::JobPhase;
    use crate::testing::{self, ScriptedRunner};
    use chrono::Utc;
    use std::sync::Arc;

    fn rollout(name: &str, index: u64, phase: RolloutPhase, sequence: Option<u64>) -> Rollout {
        let mut r = Rollout::new(
            name,
            RolloutSpec {
                node_groups: vec!["edpm-a".to_string()],
                ..Default::default()
            },
        );
        r.meta.generation = 1;
        r.meta.creation_index = index;
        r.status.phase = phase;
        r.status.observed_generation = 1;
        r.status.completion = sequence.map(|sequence| Completion {
            sequence,
            at: Utc::now(),
            outcome: if phase == RolloutPhase::Ready {
                CompletionOutcome::Succeeded
            } else {
                CompletionOutcome::Failed
            },
        });
        r
    }

    #[test]
    fn test_latest_completion_is_authoritative() {
        // r2 was created first but finished last
        let rollouts = vec![
            rollout("r1", 5, RolloutPhase::Ready, Some(1)),
            rollout("r2", 3, RolloutPhase::FailedTerminal, Some(2)),
        ];
        let summary = summarize("edpm-a", &rollouts);
        assert_eq!(summary.authoritative.unwrap().meta.name, "r2");
        assert!(summary.controlling.is_none());
        assert!(!summary.outstanding);
        assert_eq!(summary.statuses.len(), 2);
    }

    #[test]
    fn test_newer_outstanding_rollout_controls() {
        let rollouts = vec![
            rollout("r1", 3, RolloutPhase::Ready, Some(1)),
            rollout("r2", 2, RolloutPhase::Running, None),
            rollout("r3", 7, RolloutPhase::Running, None),
        ];
        let summary = summarize("edpm-a", &rollouts);
        assert_eq!(summary.authoritative.as_ref().unwrap().meta.name, "r1");
        assert_eq!(summary.controlling.as_ref().unwrap().meta.name, "r3");
        assert!(summary.outstanding);

        let (conditions, _) = visible_condition("edpm-a", &summary, "hash");
        let shown = conditions.get(DEPLOYMENT_READY).unwrap();
        assert_eq!(shown.status, ConditionStatus::False);
        assert_eq!(shown.reason, REASON_IN_PROGRESS);
    }

    #[test]
    fn test_other_groups_rollouts_ignored() {
        let mut other = rollout("r9", 9, RolloutPhase::Running, None);
        other.spec.node_groups = vec!["edpm-b".to_string()];
        let summary = summarize("edpm-a", &[other]);
        assert!(summary.statuses.is_empty());
        assert!(!summary.outstanding);

        let (conditions, deployed) = visible_condition("edpm-a", &summary, "hash");
        assert_eq!(
            conditions.get(DEPLOYMENT_READY).unwrap().status,
            ConditionStatus::Unknown
        );
        assert!(deployed.is_none());
    }

    fn deployed_fleet() -> (crate::fleet::Fleet, Arc<ScriptedRunner>) {
        let fleet = testing::fleet();
        testing::add_service(&fleet, "nova");
        testing::add_node_group(&fleet, "edpm-a", &["compute-0", "compute-1"], &["nova"]);
        testing::set_nova_secret(&fleet, "u0");
        testing::add_credential(&fleet, "u0");
        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        fleet
            .rollouts
            .create(Rollout::new(
                "r1",
                RolloutSpec {
                    node_groups: vec!["edpm-a".to_string()],
                    ..Default::default()
                },
            ))
            .unwrap();
        testing::rollout_reconciler(&fleet, runner.clone())
            .reconcile("r1")
            .unwrap();
        (fleet, runner)
    }

    #[test]
    fn test_reports_deployment_and_guards() {
        let (fleet, _) = deployed_fleet();
        let outcome = testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        assert_eq!(outcome, Outcome::Done);

        let group = fleet.node_groups.get("edpm-a").unwrap();
        assert!(group.status.conditions.is_true(DEPLOYMENT_READY));
        assert!(group.status.conditions.is_true(READY));
        assert_eq!(group.status.deployed_config_hash, group.status.config_hash);
        assert_eq!(group.status.guard_id, guard_id("edpm-a"));
        assert_eq!(group.status.observed_generation, group.meta.generation);

        let credential = fleet.credentials.get("u0").unwrap();
        assert_eq!(
            credential.meta.finalizers,
            vec![format!("nodeset.os/{}-nova", guard_id("edpm-a"))]
        );
    }

    #[test]
    fn test_changed_group_needs_new_rollout() {
        let (fleet, _) = deployed_fleet();
        let reconciler = testing::node_group_reconciler(&fleet);
        reconciler.reconcile("edpm-a").unwrap();

        let mut group = fleet.node_groups.get("edpm-a").unwrap();
        group
            .spec
            .nodes
            .insert("compute-2".to_string(), NodeSpec::default());
        group.meta.generation += 1;
        fleet.node_groups.update(group).unwrap();

        reconciler.reconcile("edpm-a").unwrap();
        let group = fleet.node_groups.get("edpm-a").unwrap();
        let shown = group.status.conditions.get(DEPLOYMENT_READY).unwrap();
        assert_eq!(shown.status, ConditionStatus::False);
        assert_eq!(shown.severity, Severity::Warning);
        assert_ne!(group.status.deployed_config_hash, group.status.config_hash);
    }

    #[test]
    fn test_later_failure_overrides_success() {
        let (fleet, runner) = deployed_fleet();
        testing::add_service(&fleet, "libvirt");
        runner.script("libvirt-r2-edpm-a", &[JobPhase::Failed]);
        fleet
            .rollouts
            .create(Rollout::new(
                "r2",
                RolloutSpec {
                    node_groups: vec!["edpm-a".to_string()],
                    services_override: vec!["libvirt".to_string()],
                    backoff_limit: Some(1),
                    ..Default::default()
                },
            ))
            .unwrap();
        testing::rollout_reconciler(&fleet, runner.clone())
            .reconcile("r2")
            .unwrap();

        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        let group = fleet.node_groups.get("edpm-a").unwrap();
        assert_eq!(group.status.authoritative_rollout.as_deref(), Some("r2"));
        assert!(group.status.conditions.is_error(DEPLOYMENT_READY));
        assert!(group.status.deployment_statuses["r1"].is_true(DEPLOYMENT_READY));
        assert!(group.status.deployment_statuses["r2"].is_error(DEPLOYMENT_READY));
        assert_eq!(runner.submitted("libvirt-r2-edpm-a"), 1);
        assert_eq!(runner.submitted("nova-r2-edpm-a"), 0);
    }

    #[test]
    fn test_failing_kind_does_not_block_other_guards() {
        let fleet = testing::fleet();
        testing::add_service(&fleet, "neutron-dhcp");
        testing::add_service(&fleet, "nova");
        testing::add_node_group(&fleet, "edpm-a", &["compute-0"], &["neutron-dhcp", "nova"]);
        testing::set_neutron_secret(&fleet, "neutron-user");
        testing::set_nova_secret(&fleet, "u0");
        testing::add_credential(&fleet, "neutron-user");
        testing::add_credential(&fleet, "u0");
        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();

        fleet
            .rollouts
            .create(Rollout::new(
                "r1",
                RolloutSpec {
                    node_groups: vec!["edpm-a".to_string()],
                    ..Default::default()
                },
            ))
            .unwrap();
        testing::rollout_reconciler(&fleet, Arc::new(ScriptedRunner::new()))
            .reconcile("r1")
            .unwrap();

        let broken = testing::FailingInventory::new(fleet.inventory(), "neutron");
        let reconciler =
            NodeGroupReconciler::new(fleet.clone(), GuardManager::for_fleet(&fleet, Arc::new(broken)));
        assert_eq!(reconciler.reconcile("edpm-a").unwrap(), Outcome::Done);

        assert!(fleet.credentials.get("neutron-user").unwrap().meta.finalizers.is_empty());
        assert_eq!(
            fleet.credentials.get("u0").unwrap().meta.finalizers,
            vec![format!("nodeset.os/{}-nova", guard_id("edpm-a"))]
        );
    }

    #[test]
    fn test_departed_nodes_pruned_from_tracking() {
        let (fleet, _) = deployed_fleet();
        let mut group = fleet.node_groups.get("edpm-a").unwrap();
        group.spec.nodes.remove("compute-1");
        fleet.node_groups.update(group).unwrap();

        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        let tracking = fleet.tracker().get("edpm-a", "nova").unwrap();
        assert_eq!(tracking.updated_nodes, vec!["compute-0"]);
    }

    #[test]
    fn test_invalid_group_reports_error() {
        let fleet = testing::fleet();
        let group = testing::add_node_group(&fleet, "edpm-a", &["compute-0", "compute-1"], &[]);
        let mut group = group;
        for node in group.spec.nodes.values_mut() {
            node.hostname = Some("same-host".to_string());
        }
        fleet.node_groups.update(group).unwrap();

        assert!(testing::node_group_reconciler(&fleet).reconcile("edpm-a").is_err());
        let group = fleet.node_groups.get("edpm-a").unwrap();
        assert!(group.status.conditions.is_error(READY));
    }
}
