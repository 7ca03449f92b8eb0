//! Built-in credential resolvers

use super::transport::{transport_url_from_config, username_from_config, TransportUrl};
use super::{CredentialResolver, CredentialUsage};
use crate::error::{FleetError, Result};
use crate::fleet::Secret;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Config files of the nova compute secrets that may embed a transport URL
const NOVA_CONFIG_KEYS: &[&str] = &["custom.conf", "01-nova.conf"];

/// Nova: one broker account per cell, spread over
/// `nova-<cellN>-compute-config[-<n>]` secrets
pub struct NovaResolver;

impl NovaResolver {
    fn identity(secret: &Secret) -> Option<String> {
        if let Some(user) = secret.get("rabbitmq_user_name").filter(|u| !u.is_empty()) {
            return Some(user.to_string());
        }
        if let Some(url) = secret.get("transport_url") {
            return match TransportUrl::parse(url) {
                Ok(parsed) => Some(parsed.username),
                Err(e) => {
                    debug!("Ignoring transport_url in {}: {}", secret.meta.name, e);
                    None
                }
            };
        }
        NOVA_CONFIG_KEYS
            .iter()
            .filter_map(|key| secret.get(key))
            .find_map(|conf| username_from_config(conf).ok().flatten())
    }

    fn cluster(secret: &Secret) -> Option<String> {
        let embedded = NOVA_CONFIG_KEYS
            .iter()
            .filter_map(|key| secret.get(key))
            .find_map(|conf| transport_url_from_config(conf).ok().flatten());
        let url = secret.get("transport_url").map(str::to_string).or(embedded)?;
        TransportUrl::parse(&url).ok()?.cluster()
    }
}

impl CredentialResolver for NovaResolver {
    fn kind(&self) -> &str {
        "nova"
    }

    fn resolve(&self, secrets: &[Secret]) -> Result<CredentialUsage> {
        let pattern = Regex::new(r"^nova-(cell\d+)-compute-config(-\d+)?$")
            .map_err(|e| FleetError::Internal(e.to_string()))?;

        let mut cells: BTreeMap<String, Vec<&Secret>> = BTreeMap::new();
        for secret in secrets {
            if let Some(caps) = pattern.captures(&secret.meta.name) {
                cells.entry(caps[1].to_string()).or_default().push(secret);
            }
        }

        let mut usage = CredentialUsage::default();
        for (cell, mut cell_secrets) in cells {
            cell_secrets.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
            for secret in &cell_secrets {
                usage.record_source(secret);
            }

            match cell_secrets
                .iter()
                .find_map(|s| Self::identity(s).map(|user| (s.meta.name.as_str(), user)))
            {
                Some((source, user)) => {
                    debug!("Nova {} uses broker account {}", cell, user);
                    usage.add_identity(source, user);
                }
                None => debug!("No broker account found for nova {}", cell),
            }

            // Notification account sits on the first secret of the cell.
            if let Some(first) = cell_secrets.first() {
                if let Some(user) = first
                    .get("notification_rabbitmq_user_name")
                    .filter(|u| !u.is_empty())
                {
                    usage.add_identity(&first.meta.name, user);
                }
            }

            // The cell's cluster applies to every secret of the cell.
            if let Some(cluster) = cell_secrets.iter().find_map(|s| Self::cluster(s)) {
                for secret in &cell_secrets {
                    usage.add_cluster(&secret.meta.name, cluster.clone());
                }
            }
        }
        Ok(usage)
    }
}

/// Services whose broker account is embedded in agent config files of
/// well-known secrets
pub struct ConfigFileResolver {
    kind: String,
    secret_names: Vec<String>,
    config_keys: Vec<String>,
}

impl ConfigFileResolver {
    pub fn new(kind: &str, secret_names: &[&str], config_keys: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            secret_names: secret_names.iter().map(|s| s.to_string()).collect(),
            config_keys: config_keys.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn neutron() -> Self {
        Self::new(
            "neutron",
            &[
                "neutron-dhcp-agent-neutron-config",
                "neutron-sriov-agent-neutron-config",
            ],
            &["10-neutron-dhcp.conf", "10-neutron-sriov.conf"],
        )
    }

    pub fn ironic() -> Self {
        Self::new(
            "ironic",
            &["ironic-neutron-agent-config-data"],
            &["01-ironic_neutron_agent.conf"],
        )
    }
}

impl CredentialResolver for ConfigFileResolver {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn resolve(&self, secrets: &[Secret]) -> Result<CredentialUsage> {
        let mut usage = CredentialUsage::default();
        let mut matched: Vec<&Secret> = secrets
            .iter()
            .filter(|s| self.secret_names.contains(&s.meta.name))
            .collect();
        matched.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));

        for secret in matched {
            usage.record_source(secret);
            for key in &self.config_keys {
                let Some(conf) = secret.get(key) else {
                    continue;
                };
                if let Some(user) = username_from_config(conf)? {
                    usage.add_identity(&secret.meta.name, user);
                }
                if let Some(url) = transport_url_from_config(conf)? {
                    match TransportUrl::parse(&url) {
                        Ok(parsed) => {
                            if let Some(cluster) = parsed.cluster() {
                                usage.add_cluster(&secret.meta.name, cluster);
                            }
                        }
                        Err(e) => debug!("Ignoring transport_url in {}/{}: {}", secret.meta.name, key, e),
                    }
                }
            }
        }
        Ok(usage)
    }
}
