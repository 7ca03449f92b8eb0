//! Rollout aggregator
//!
//! Drives a rollout request through `Pending -> Running -> {Ready,
//! FailedRetryable, FailedTerminal}`. Each pass walks the target node groups
//! in submission order and, within a group, runs its services one after the
//! other, stopping at the first one that is not complete. A failure in one
//! group does not stop the others.
//!
//! When a job succeeds, the pass records which nodes received which
//! credential material (phase 1 of the guard protocol) before the service is
//! reported complete.

pub mod limit;

pub use limit::NodeLimit;

use crate::controller::Outcome;
use crate::error::{FleetError, Result};
use crate::fingerprint::combine;
use crate::fleet::condition::{
    service_condition, DEPLOYMENT_READY, INPUT_READY, READY, REASON_BACKOFF_LIMIT_EXCEEDED,
    REASON_ERROR, REASON_INPUT_NOT_READY, REASON_IN_PROGRESS,
};
use crate::fleet::{
    Completion, CompletionOutcome, Fleet, NodeGroup, Rollout, RolloutPhase,
    RolloutStatus, Service, Severity,
};
use crate::inventory::FleetInventory;
use crate::job::{unit_fingerprint, JobPhase, JobRequest, JobRunner, JobSpec, JobStatus};
use crate::store::{modify, RecordStore};
use chrono::Utc;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Check a rollout request before any work starts
pub fn validate(rollout: &Rollout) -> Result<()> {
    let name = &rollout.meta.name;
    let re = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .map_err(|e| FleetError::Internal(e.to_string()))?;
    if name.len() > 63 || !re.is_match(name) {
        return Err(FleetError::Validation(format!(
            "rollout name '{}' is not a valid RFC 1123 label",
            name
        )));
    }
    if rollout.spec.node_groups.is_empty() {
        return Err(FleetError::Validation(format!(
            "rollout {} targets no node groups",
            name
        )));
    }
    if let Some(limit) = rollout.spec.node_limit.as_deref() {
        NodeLimit::parse(limit)?;
    }
    Ok(())
}

/// Result of driving one service for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServiceState {
    Complete,
    Running,
    Retryable(String),
    Terminal(String),
}

/// Per-pass working state
struct Pass<'a> {
    rollout: &'a Rollout,
    status: RolloutStatus,
    limit: Option<NodeLimit>,
    groups: BTreeMap<String, NodeGroup>,
    /// Deploy-on-all services already driven this pass
    shared: BTreeMap<String, ServiceState>,
}

/// Reconciles rollout requests
#[derive(Clone)]
pub struct RolloutReconciler {
    fleet: Fleet,
    runner: Arc<dyn JobRunner>,
    inventory: Arc<dyn FleetInventory>,
}

impl RolloutReconciler {
    pub fn new(fleet: Fleet, runner: Arc<dyn JobRunner>, inventory: Arc<dyn FleetInventory>) -> Self {
        Self {
            fleet,
            runner,
            inventory,
        }
    }

    /// Run one pass for the named rollout
    pub fn reconcile(&self, name: &str) -> Result<Outcome> {
        let Some(rollout) = self.fleet.rollouts.try_get(name)? else {
            debug!("Rollout {} not found, nothing to do", name);
            return Ok(Outcome::Done);
        };
        validate(&rollout)?;

        let generation = rollout.meta.generation;
        let mut status = rollout.status.clone();
        if status.observed_generation != 0 && status.observed_generation != generation {
            info!(
                "Rollout {} changed (generation {} -> {}), starting over",
                name, status.observed_generation, generation
            );
            status = RolloutStatus {
                job_hashes: status.job_hashes,
                ..Default::default()
            };
        }
        status.observed_generation = generation;

        if status.deployed {
            debug!("Rollout {} already deployed", name);
            return Ok(Outcome::Done);
        }
        if status.phase == RolloutPhase::FailedTerminal {
            debug!("Rollout {} failed terminally, waiting for a spec change", name);
            return Ok(Outcome::Done);
        }

        let requeue = rollout
            .spec
            .requeue_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.fleet.config.requeue());

        // Inputs: every target group must exist and have been reconciled.
        let mut groups = BTreeMap::new();
        let mut waiting = Vec::new();
        for ng in &rollout.spec.node_groups {
            match self.fleet.node_groups.try_get(ng)? {
                Some(group) if group.is_reconciled() => {
                    groups.insert(ng.clone(), group);
                }
                Some(_) => waiting.push(format!("node group {} not reconciled yet", ng)),
                None => waiting.push(format!("node group {} not found", ng)),
            }
        }
        let mut plan: Vec<(String, Vec<Service>)> = Vec::new();
        if waiting.is_empty() {
            for ng in &rollout.spec.node_groups {
                match self.services_for(&rollout, &groups[ng])? {
                    Ok(services) => plan.push((ng.clone(), services)),
                    Err(missing) => waiting.push(missing),
                }
            }
        }
        if !waiting.is_empty() {
            let message = waiting.join(", ");
            info!("Rollout {} waiting for inputs: {}", name, message);
            status.phase = RolloutPhase::Pending;
            status
                .conditions
                .mark_false(INPUT_READY, REASON_INPUT_NOT_READY, Severity::Info, &message);
            status
                .conditions
                .mark_false(READY, REASON_INPUT_NOT_READY, Severity::Info, &message);
            status.message = Some(message);
            self.write_status(name, status)?;
            return Ok(Outcome::RequeueAfter(requeue));
        }

        status.conditions.mark_true(INPUT_READY, "inputs ready");
        let limit = rollout
            .spec
            .node_limit
            .as_deref()
            .map(NodeLimit::parse)
            .transpose()?;

        let mut pass = Pass {
            rollout: &rollout,
            status,
            limit,
            groups,
            shared: BTreeMap::new(),
        };

        let mut errors = Vec::new();
        let mut terminal = false;
        let mut running = false;

        for (ng, services) in &plan {
            let mut complete = true;
            for service in services {
                let state = self.drive_service(&mut pass, ng, service);
                let key = service_condition(&service.meta.name);
                let conditions = pass.status.node_group_conditions.entry(ng.clone()).or_default();
                match state {
                    ServiceState::Complete => {
                        conditions.mark_true(&key, format!("{} deployed", service.meta.name));
                        continue;
                    }
                    ServiceState::Running => {
                        conditions.mark_false(
                            &key,
                            REASON_IN_PROGRESS,
                            Severity::Info,
                            format!("{} in progress", service.meta.name),
                        );
                        running = true;
                    }
                    ServiceState::Retryable(msg) => {
                        conditions.mark_false(&key, REASON_ERROR, Severity::Warning, &msg);
                        errors.push(format!("nodeGroup: {} error: {}", ng, msg));
                    }
                    ServiceState::Terminal(msg) => {
                        conditions.mark_false(
                            &key,
                            REASON_BACKOFF_LIMIT_EXCEEDED,
                            Severity::Error,
                            &msg,
                        );
                        errors.push(format!("nodeGroup: {} error: {}", ng, msg));
                        terminal = true;
                    }
                }
                complete = false;
                break;
            }

            let group_terminal = pass
                .status
                .node_group_conditions
                .get(ng)
                .map(|c| c.iter().any(|c| c.reason == REASON_BACKOFF_LIMIT_EXCEEDED))
                .unwrap_or(false);
            let config_hash = pass.groups[ng].status.config_hash.clone();
            let conditions = pass.status.node_group_conditions.entry(ng.clone()).or_default();
            if complete {
                conditions.mark_true(DEPLOYMENT_READY, "all services deployed");
                pass.status.node_group_hashes.insert(ng.clone(), config_hash);
            } else if group_terminal {
                conditions.mark_false(
                    DEPLOYMENT_READY,
                    REASON_BACKOFF_LIMIT_EXCEEDED,
                    Severity::Error,
                    "a service exceeded its backoff limit",
                );
            } else {
                conditions.mark_false(
                    DEPLOYMENT_READY,
                    REASON_IN_PROGRESS,
                    Severity::Info,
                    "deployment in progress",
                );
            }
        }

        let mut status = pass.status;
        if terminal {
            let message = errors.join(" & ");
            error!("Rollout {} failed terminally: {}", name, message);
            status.phase = RolloutPhase::FailedTerminal;
            status
                .conditions
                .mark_false(READY, REASON_BACKOFF_LIMIT_EXCEEDED, Severity::Error, &message);
            status.message = Some(message);
            self.complete(&mut status, CompletionOutcome::Failed);
            self.write_status(name, status)?;
            return Ok(Outcome::Done);
        }
        if !errors.is_empty() {
            let message = errors.join(" & ");
            warn!("Rollout {} failed, will retry: {}", name, message);
            status.phase = RolloutPhase::FailedRetryable;
            status
                .conditions
                .mark_false(READY, REASON_ERROR, Severity::Warning, &message);
            status.message = Some(message.clone());
            self.write_status(name, status)?;
            return Err(FleetError::Rollout(message));
        }
        if running {
            status.phase = RolloutPhase::Running;
            status
                .conditions
                .mark_false(READY, REASON_IN_PROGRESS, Severity::Info, "rollout in progress");
            status.message = None;
            self.write_status(name, status)?;
            return Ok(Outcome::RequeueAfter(requeue));
        }

        info!("Rollout {} deployed to {:?}", name, rollout.spec.node_groups);
        status.phase = RolloutPhase::Ready;
        status.deployed = true;
        status.message = None;
        status.conditions.mark_true(READY, "rollout complete");
        self.complete(&mut status, CompletionOutcome::Succeeded);
        self.write_status(name, status)?;
        Ok(Outcome::Done)
    }

    /// Services a rollout runs on one group, de-duplicated by kind. The inner
    /// error names the first missing service.
    fn services_for(
        &self,
        rollout: &Rollout,
        group: &NodeGroup,
    ) -> Result<std::result::Result<Vec<Service>, String>> {
        let names = if rollout.spec.services_override.is_empty() {
            &group.spec.services
        } else {
            &rollout.spec.services_override
        };

        let mut kinds = BTreeSet::new();
        let mut services = Vec::new();
        for name in names {
            let Some(service) = self.fleet.services.try_get(name)? else {
                return Ok(Err(format!("service {} not found", name)));
            };
            service.validate()?;
            if !kinds.insert(service.kind().to_string()) {
                debug!(
                    "Skipping service {} on {}: kind {} already scheduled",
                    name,
                    group.meta.name,
                    service.kind()
                );
                continue;
            }
            services.push(service);
        }
        Ok(Ok(services))
    }

    fn drive_service(&self, pass: &mut Pass<'_>, ng: &str, service: &Service) -> ServiceState {
        let deploy_on_all = service.spec.deploy_on_all_node_groups;
        if deploy_on_all {
            if let Some(state) = pass.shared.get(&service.meta.name) {
                return state.clone();
            }
        }

        let targets: Vec<NodeGroup> = if deploy_on_all {
            pass.rollout
                .spec
                .node_groups
                .iter()
                .filter_map(|n| pass.groups.get(n).cloned())
                .collect()
        } else {
            pass.groups.get(ng).cloned().into_iter().collect()
        };

        let state = match self.run_service(pass, service, &targets) {
            Ok(state) => state,
            Err(e) => {
                error!(
                    "Rollout {}: service {} on {} failed: {}",
                    pass.rollout.meta.name, service.meta.name, ng, e
                );
                ServiceState::Retryable(e.to_string())
            }
        };
        if deploy_on_all {
            pass.shared.insert(service.meta.name.clone(), state.clone());
        }
        state
    }

    fn run_service(
        &self,
        pass: &mut Pass<'_>,
        service: &Service,
        targets: &[NodeGroup],
    ) -> Result<ServiceState> {
        let rollout = pass.rollout;
        let spec = JobSpec::build(&JobRequest {
            rollout,
            service,
            node_groups: targets,
            default_image: &self.fleet.config.runner_image,
            default_backoff_limit: self.fleet.config.default_backoff_limit,
        })?;

        let credential_kind = self.inventory.credential_kind(service.kind());
        let usage = self
            .inventory
            .resolve_credential_usage(&credential_kind, &self.fleet.config.namespace)?;
        let credential_fp = match &usage {
            Some(usage) => usage.fingerprint()?,
            None => String::new(),
        };
        let hashes: Vec<&str> = targets.iter().map(|g| g.status.config_hash.as_str()).collect();
        let config_hash = combine(&hashes);
        let unit_fp = unit_fingerprint(&spec, &credential_fp, &config_hash)?;

        if pass.status.job_hashes.get(&spec.name) == Some(&unit_fp) {
            debug!("Job {} unchanged since it last succeeded, skipping", spec.name);
            return Ok(ServiceState::Complete);
        }

        let mut job = self.runner.status(&spec.name)?;
        if job.is_some() && pass.status.submitted.get(&spec.name) != Some(&unit_fp) {
            info!("Inputs of job {} changed, resubmitting", spec.name);
            self.runner.delete(&spec.name)?;
            pass.status.failures.remove(&spec.name);
            job = None;
        }

        let job = match job {
            Some(job) => job,
            None => {
                info!("Submitting job {}", spec.name);
                pass.status.submitted.insert(spec.name.clone(), unit_fp.clone());
                self.runner.submit(&spec)?
            }
        };
        let job = self.retry_if_reported(pass, &spec, job)?;

        match job.phase {
            JobPhase::Running => Ok(ServiceState::Running),
            JobPhase::Succeeded => {
                if let Some(usage) = usage.filter(|_| !credential_fp.is_empty()) {
                    self.record_updated_nodes(pass, &credential_kind, targets, &credential_fp)?;
                    debug!(
                        "Recorded {} identities for {} ({}) on {} group(s)",
                        usage.identities.len(),
                        credential_kind,
                        service.meta.name,
                        targets.len()
                    );
                }
                info!("Job {} succeeded", spec.name);
                pass.status.job_hashes.insert(spec.name.clone(), unit_fp);
                pass.status.submitted.remove(&spec.name);
                pass.status.failures.remove(&spec.name);
                Ok(ServiceState::Complete)
            }
            JobPhase::Failed => {
                let reason = job.message.clone().unwrap_or_else(|| "job failed".to_string());
                if job.attempts >= spec.backoff_limit {
                    Ok(ServiceState::Terminal(format!(
                        "job {} failed after {} attempt(s): {}",
                        spec.name, job.attempts, reason
                    )))
                } else {
                    pass.status.failures.insert(spec.name.clone(), job.attempts);
                    Ok(ServiceState::Retryable(format!(
                        "job {} failed (attempt {} of {}): {}",
                        spec.name, job.attempts, spec.backoff_limit, reason
                    )))
                }
            }
        }
    }

    /// A failure already reported on an earlier pass gets another attempt
    fn retry_if_reported(&self, pass: &Pass<'_>, spec: &JobSpec, job: JobStatus) -> Result<JobStatus> {
        if job.phase != JobPhase::Failed || job.attempts >= spec.backoff_limit {
            return Ok(job);
        }
        if pass.status.failures.get(&spec.name) != Some(&job.attempts) {
            return Ok(job);
        }
        info!(
            "Retrying job {} (attempt {} of {})",
            spec.name,
            job.attempts + 1,
            spec.backoff_limit
        );
        self.runner.submit(spec)
    }

    /// Phase 1: remember which nodes now run the current credential material
    fn record_updated_nodes(
        &self,
        pass: &Pass<'_>,
        kind: &str,
        targets: &[NodeGroup],
        credential_fp: &str,
    ) -> Result<()> {
        let tracker = self.fleet.tracker();
        for group in targets {
            let ng = &group.meta.name;
            let nodes = group.node_names();
            let selected: Vec<String> = match &pass.limit {
                Some(limit) => limit.select_group(ng, &nodes).into_iter().collect(),
                None => nodes,
            };
            tracker.observe(ng, kind, credential_fp)?;
            tracker.mark_nodes_updated(ng, kind, &selected)?;
            info!(
                "Rollout {}: {} node(s) of {} updated for {}",
                pass.rollout.meta.name,
                selected.len(),
                ng,
                kind
            );
        }
        Ok(())
    }

    fn complete(&self, status: &mut RolloutStatus, outcome: CompletionOutcome) {
        if status.completion.is_none() {
            status.completion = Some(Completion {
                sequence: self.fleet.sequence.next(),
                at: Utc::now(),
                outcome,
            });
        }
    }

    fn write_status(&self, name: &str, status: RolloutStatus) -> Result<()> {
        modify(
            self.fleet.rollouts.as_ref(),
            name,
            self.fleet.config.conflict_retries,
            |rollout: &mut Rollout| {
                rollout.status = status.clone();
                Ok(true)
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::RolloutSpec;
    use crate::testing::{self, ScriptedRunner};

    const JOB: &str = "nova-r1-edpm-a";

    fn setup() -> (Fleet, Arc<ScriptedRunner>, RolloutReconciler) {
        let fleet = testing::fleet();
        testing::add_service(&fleet, "nova");
        testing::add_node_group(&fleet, "edpm-a", &["compute-0", "compute-1"], &["nova"]);
        testing::set_nova_secret(&fleet, "u0");
        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let reconciler = testing::rollout_reconciler(&fleet, runner.clone());
        (fleet, runner, reconciler)
    }

    fn request(fleet: &Fleet, name: &str, spec: RolloutSpec) {
        let spec = RolloutSpec {
            node_groups: if spec.node_groups.is_empty() {
                vec!["edpm-a".to_string()]
            } else {
                spec.node_groups
            },
            ..spec
        };
        fleet.rollouts.create(Rollout::new(name, spec)).unwrap();
    }

    #[test]
    fn test_validate() {
        let ok = Rollout::new(
            "r1",
            RolloutSpec {
                node_groups: vec!["edpm-a".to_string()],
                ..Default::default()
            },
        );
        assert!(validate(&ok).is_ok());

        let mut bad_name = ok.clone();
        bad_name.meta.name = "Bad_Name".to_string();
        assert!(matches!(validate(&bad_name), Err(FleetError::Validation(_))));

        let mut no_groups = ok.clone();
        no_groups.spec.node_groups.clear();
        assert!(validate(&no_groups).is_err());

        let mut bad_limit = ok;
        bad_limit.spec.node_limit = Some("compute 0".to_string());
        assert!(validate(&bad_limit).is_err());
    }

    #[test]
    fn test_successful_rollout() {
        let (fleet, runner, reconciler) = setup();
        request(&fleet, "r1", RolloutSpec::default());

        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submissions(), vec![JOB]);

        let rollout = fleet.rollouts.get("r1").unwrap();
        assert_eq!(rollout.status.phase, RolloutPhase::Ready);
        assert!(rollout.status.deployed);
        assert!(rollout.is_finished());
        let completion = rollout.status.completion.clone().unwrap();
        assert_eq!(completion.outcome, CompletionOutcome::Succeeded);

        let conditions = &rollout.status.node_group_conditions["edpm-a"];
        assert!(conditions.is_true(&service_condition("nova")));
        assert!(conditions.is_true(DEPLOYMENT_READY));
        let group = fleet.node_groups.get("edpm-a").unwrap();
        assert_eq!(rollout.status.node_group_hashes["edpm-a"], group.status.config_hash);

        let tracking = fleet.tracker().get("edpm-a", "nova").unwrap();
        assert!(!tracking.credential_fingerprint.is_empty());
        assert!(tracking.covers(&group.node_names()));

        // finished rollouts stay finished
        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submissions().len(), 1);
    }

    #[test]
    fn test_waits_for_inputs() {
        let (fleet, runner, reconciler) = setup();
        request(
            &fleet,
            "r1",
            RolloutSpec {
                node_groups: vec!["edpm-a".to_string(), "edpm-later".to_string()],
                ..Default::default()
            },
        );

        let outcome = reconciler.reconcile("r1").unwrap();
        assert!(matches!(outcome, Outcome::RequeueAfter(_)));
        let rollout = fleet.rollouts.get("r1").unwrap();
        assert_eq!(rollout.status.phase, RolloutPhase::Pending);
        assert!(!rollout.status.conditions.is_true(INPUT_READY));
        assert!(runner.submissions().is_empty());
    }

    #[test]
    fn test_running_job_requeues() {
        let (fleet, runner, reconciler) = setup();
        runner.script(JOB, &[JobPhase::Running]);
        request(
            &fleet,
            "r1",
            RolloutSpec {
                requeue_seconds: Some(5),
                ..Default::default()
            },
        );

        assert_eq!(
            reconciler.reconcile("r1").unwrap(),
            Outcome::RequeueAfter(Duration::from_secs(5))
        );
        assert_eq!(fleet.rollouts.get("r1").unwrap().status.phase, RolloutPhase::Running);
        // nothing recorded until the job succeeds
        assert!(fleet.tracker().get("edpm-a", "nova").unwrap().updated_nodes.is_empty());

        runner.finish(JOB, JobPhase::Succeeded);
        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(fleet.rollouts.get("r1").unwrap().status.phase, RolloutPhase::Ready);
        assert_eq!(runner.submitted(JOB), 1);
    }

    #[test]
    fn test_retry_then_backoff_limit() {
        let (fleet, runner, reconciler) = setup();
        runner.script(JOB, &[JobPhase::Failed, JobPhase::Failed]);
        request(
            &fleet,
            "r1",
            RolloutSpec {
                backoff_limit: Some(2),
                ..Default::default()
            },
        );

        let err = reconciler.reconcile("r1").unwrap_err();
        assert!(err.to_string().contains("nodeGroup: edpm-a error:"));
        let rollout = fleet.rollouts.get("r1").unwrap();
        assert_eq!(rollout.status.phase, RolloutPhase::FailedRetryable);
        assert!(rollout.status.completion.is_none());

        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submitted(JOB), 2);
        let rollout = fleet.rollouts.get("r1").unwrap();
        assert_eq!(rollout.status.phase, RolloutPhase::FailedTerminal);
        assert_eq!(
            rollout.status.completion.as_ref().map(|c| c.outcome),
            Some(CompletionOutcome::Failed)
        );
        assert!(rollout.status.node_group_conditions["edpm-a"].is_error(DEPLOYMENT_READY));

        // terminal until the request changes
        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submitted(JOB), 2);
    }

    #[test]
    fn test_unchanged_work_is_skipped() {
        let (fleet, runner, reconciler) = setup();
        request(&fleet, "r1", RolloutSpec::default());
        reconciler.reconcile("r1").unwrap();

        let mut rollout = fleet.rollouts.get("r1").unwrap();
        rollout.spec.requeue_seconds = Some(60);
        rollout.meta.generation += 1;
        fleet.rollouts.update(rollout).unwrap();

        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submitted(JOB), 1);
        assert_eq!(fleet.rollouts.get("r1").unwrap().status.phase, RolloutPhase::Ready);
    }

    #[test]
    fn test_node_limit_marks_selected_nodes() {
        let (fleet, _runner, reconciler) = setup();
        request(
            &fleet,
            "r1",
            RolloutSpec {
                node_limit: Some("compute-0".to_string()),
                ..Default::default()
            },
        );
        reconciler.reconcile("r1").unwrap();

        let tracking = fleet.tracker().get("edpm-a", "nova").unwrap();
        assert_eq!(tracking.updated_nodes, vec!["compute-0"]);
    }

    #[test]
    fn test_agents_sharing_a_credential_kind_all_run() {
        let fleet = testing::fleet();
        testing::add_service(&fleet, "neutron-dhcp");
        testing::add_service(&fleet, "neutron-sriov");
        testing::add_node_group(
            &fleet,
            "edpm-a",
            &["networker-0", "networker-1"],
            &["neutron-dhcp", "neutron-sriov"],
        );
        testing::set_neutron_secret(&fleet, "neutron-user");
        testing::add_credential(&fleet, "neutron-user");
        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let reconciler = testing::rollout_reconciler(&fleet, runner.clone());
        request(&fleet, "r1", RolloutSpec::default());

        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(
            runner.submissions(),
            vec!["neutron-dhcp-r1-edpm-a", "neutron-sriov-r1-edpm-a"]
        );
        let conditions = &fleet.rollouts.get("r1").unwrap().status.node_group_conditions["edpm-a"];
        assert!(conditions.is_true(&service_condition("neutron-dhcp")));
        assert!(conditions.is_true(&service_condition("neutron-sriov")));

        // both agents report under the shared neutron account
        let tracking = fleet.tracker().get("edpm-a", "neutron").unwrap();
        assert_eq!(tracking.updated_nodes, vec!["networker-0", "networker-1"]);
        assert!(fleet.tracker().get("edpm-a", "neutron-dhcp").unwrap().updated_nodes.is_empty());

        testing::node_group_reconciler(&fleet).reconcile("edpm-a").unwrap();
        assert_eq!(
            fleet.credentials.get("neutron-user").unwrap().meta.finalizers,
            vec![format!("nodeset.os/{}-neutron", crate::fingerprint::guard_id("edpm-a"))]
        );
    }

    #[test]
    fn test_one_failing_group_does_not_stop_others() {
        let (fleet, runner, reconciler) = setup();
        testing::add_node_group(&fleet, "edpm-b", &["compute-b0"], &["nova"]);
        testing::node_group_reconciler(&fleet).reconcile("edpm-b").unwrap();
        runner.script(JOB, &[JobPhase::Failed]);
        request(
            &fleet,
            "r1",
            RolloutSpec {
                node_groups: vec!["edpm-a".to_string(), "edpm-b".to_string()],
                ..Default::default()
            },
        );

        assert!(reconciler.reconcile("r1").is_err());
        assert_eq!(runner.submitted("nova-r1-edpm-b"), 1);
        let rollout = fleet.rollouts.get("r1").unwrap();
        assert!(rollout.status.node_group_conditions["edpm-b"].is_true(DEPLOYMENT_READY));
        assert!(!rollout.status.node_group_conditions["edpm-a"].is_true(DEPLOYMENT_READY));

        // the retry succeeds and edpm-b is not run again
        assert_eq!(reconciler.reconcile("r1").unwrap(), Outcome::Done);
        assert_eq!(runner.submitted(JOB), 2);
        assert_eq!(runner.submitted("nova-r1-edpm-b"), 1);
    }
}
