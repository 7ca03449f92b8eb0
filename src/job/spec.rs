//! Job input bundles

use crate::error::{FleetError, Result};
use crate::fingerprint::{combine, fingerprint_value};
use crate::fleet::{Mount, NodeGroup, Rollout, Service, Vars};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Kubernetes-style name length limit for executions
pub const MAX_EXECUTION_NAME: usize = 63;

/// Room kept after the service part of an execution name
const SUFFIX_RESERVE: usize = 10;

pub const LABEL_ROLLOUT: &str = "fleetward/rollout";
pub const LABEL_SERVICE: &str = "fleetward/service";
pub const LABEL_NODE_GROUP: &str = "fleetward/node-group";

/// Execution name for a service run.
///
/// `<service>-<rollout>[-<node-group>]`, with the service part cut to leave
/// room for the rest, the whole cut to 63 characters and trailing `-`/`.`
/// removed. Deploy-on-all services pass no node group.
pub fn execution_name(service: &str, rollout: &str, node_group: Option<&str>) -> String {
    let service: String = service
        .chars()
        .take(MAX_EXECUTION_NAME - SUFFIX_RESERVE)
        .collect();
    let mut name = format!("{}-{}", service, rollout);
    if let Some(ng) = node_group {
        name.push('-');
        name.push_str(ng);
    }
    let name: String = name.chars().take(MAX_EXECUTION_NAME).collect();
    name.trim_end_matches(|c: char| c == '-' || c == '.').to_string()
}

/// Everything a runner needs to execute one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Execution name
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    /// Runner entrypoint arguments
    pub args: Vec<String>,
    /// Selection flags (`--limit`, `--tags`, `--skip-tags`)
    pub cmdline: Vec<String>,
    pub playbook: Option<String>,
    pub playbook_contents: Option<String>,
    pub role: Option<String>,
    /// Merged extra variables, sorted by key
    pub extra_vars: Vars,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    /// Rendered inventory (YAML)
    pub inventory: String,
    /// Execution attempts before failure is terminal
    pub backoff_limit: u32,
}

/// Inputs for building a [`JobSpec`]
pub struct JobRequest<'a> {
    pub rollout: &'a Rollout,
    pub service: &'a Service,
    /// Target groups: one, or every group of the rollout for deploy-on-all services
    pub node_groups: &'a [NodeGroup],
    pub default_image: &'a str,
    pub default_backoff_limit: u32,
}

impl JobSpec {
    /// Build the job bundle for a service run
    pub fn build(req: &JobRequest<'_>) -> Result<Self> {
        let service = req.service;
        let rollout = req.rollout;
        let deploy_on_all = service.spec.deploy_on_all_node_groups;

        let target = if deploy_on_all {
            None
        } else {
            match req.node_groups {
                [single] => Some(single.meta.name.as_str()),
                _ => {
                    return Err(FleetError::Job(format!(
                        "service {} runs per node group but {} groups were given",
                        service.meta.name,
                        req.node_groups.len()
                    )))
                }
            }
        };
        let name = execution_name(&service.meta.name, &rollout.meta.name, target);

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_ROLLOUT.to_string(), rollout.meta.name.clone());
        labels.insert(LABEL_SERVICE.to_string(), service.meta.name.clone());
        if let Some(ng) = target {
            labels.insert(LABEL_NODE_GROUP.to_string(), ng.to_string());
        }

        let mut args = vec![
            "ansible-runner".to_string(),
            "run".to_string(),
            "/runner".to_string(),
        ];
        if let Some(playbook) = &service.spec.playbook {
            args.extend(["-p".to_string(), playbook.clone()]);
        } else if service.spec.playbook_contents.is_some() {
            args.extend(["-p".to_string(), "playbook.yaml".to_string()]);
        } else if let Some(role) = &service.spec.role {
            args.extend(["--role".to_string(), role.clone()]);
        }
        args.extend(["-i".to_string(), name.clone()]);

        let mut cmdline = Vec::new();
        if let Some(limit) = rollout.spec.node_limit.as_deref().filter(|l| !l.is_empty()) {
            cmdline.push(format!("--limit {}", limit));
        }
        if !rollout.spec.tags.is_empty() {
            cmdline.push(format!("--tags {}", rollout.spec.tags.join(",")));
        }
        if !rollout.spec.skip_tags.is_empty() {
            cmdline.push(format!("--skip-tags {}", rollout.spec.skip_tags.join(",")));
        }

        let mut extra_vars = service.spec.extra_vars.clone();
        extra_vars.extend(rollout.spec.extra_vars.clone());
        extra_vars.insert(
            "edpm_service_type".to_string(),
            Value::String(service.kind().to_string()),
        );
        if deploy_on_all {
            extra_vars.insert("edpm_override_hosts".to_string(), Value::String("all".to_string()));
        }

        let mut env = BTreeMap::new();
        env.insert("ANSIBLE_FORCE_COLOR".to_string(), "True".to_string());
        if !cmdline.is_empty() {
            env.insert("RUNNER_CMDLINE".to_string(), cmdline.join(" "));
        }
        if let Some(playbook) = &service.spec.playbook {
            env.insert("RUNNER_PLAYBOOK".to_string(), playbook.clone());
        }
        env.insert("RUNNER_EXTRA_VARS".to_string(), serde_yaml::to_string(&extra_vars)?);

        let image = service
            .spec
            .runner_image
            .clone()
            .unwrap_or_else(|| req.default_image.to_string());

        Ok(Self {
            name,
            labels,
            image,
            args,
            cmdline,
            playbook: service.spec.playbook.clone(),
            playbook_contents: service.spec.playbook_contents.clone(),
            role: service.spec.role.clone(),
            extra_vars,
            mounts: service.spec.mounts.clone(),
            env,
            inventory: render_inventory(req.node_groups)?,
            backoff_limit: rollout.spec.backoff_limit.unwrap_or(req.default_backoff_limit),
        })
    }

    /// Fingerprint of the bundle itself
    pub fn fingerprint(&self) -> Result<String> {
        fingerprint_value(self)
    }
}

/// Unit-of-work fingerprint: the bundle, the credential material it will
/// deploy and the config of the target group(s)
pub fn unit_fingerprint(spec: &JobSpec, credential_fingerprint: &str, config_hash: &str) -> Result<String> {
    let spec_fp = spec.fingerprint()?;
    Ok(combine(&[&spec_fp, credential_fingerprint, config_hash]))
}

/// Render the groups as an ansible-style YAML inventory
pub fn render_inventory(groups: &[NodeGroup]) -> Result<String> {
    let mut root = Mapping::new();
    for group in groups {
        let mut hosts = Mapping::new();
        for (name, node) in &group.spec.nodes {
            let mut host = Mapping::new();
            host.insert(
                Value::String("ansible_host".to_string()),
                Value::String(group.hostname(name).to_string()),
            );
            for (key, value) in &node.vars {
                host.insert(Value::String(key.clone()), value.clone());
            }
            hosts.insert(Value::String(name.clone()), Value::Mapping(host));
        }

        let mut vars = Mapping::new();
        for (key, value) in &group.spec.vars {
            vars.insert(Value::String(key.clone()), value.clone());
        }

        let mut entry = Mapping::new();
        entry.insert(Value::String("hosts".to_string()), Value::Mapping(hosts));
        entry.insert(Value::String("vars".to_string()), Value::Mapping(vars));
        root.insert(Value::String(group.meta.name.clone()), Value::Mapping(entry));
    }
    Ok(serde_yaml::to_string(&Value::Mapping(root))?)
}
