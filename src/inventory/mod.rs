//! Fleet inventory: which broker credentials a service kind currently uses
//!
//! Each credential-bearing service kind has a [`CredentialResolver`] that
//! reads the configuration secrets and reports the broker identities in use,
//! the broker clusters they live on, and the secret material consulted.
//!
//! Several service types may share one credential kind: both neutron agents
//! use the `neutron` account, so their markers and tracking live under
//! `neutron`.

pub mod resolvers;
pub mod transport;

pub use resolvers::{ConfigFileResolver, NovaResolver};
pub use transport::TransportUrl;

use crate::error::{FleetError, Result};
use crate::fingerprint::fingerprint_value;
use crate::fleet::Secret;
use crate::store::RecordStore;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Identities and clusters found in one secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceUsage {
    pub identities: BTreeSet<String>,
    pub clusters: BTreeSet<String>,
}

/// Credentials a service kind depends on right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialUsage {
    /// Broker account names in use
    pub identities: BTreeSet<String>,
    /// Broker clusters those accounts live on
    pub clusters: BTreeSet<String>,
    /// Secret name to data of every matched secret
    pub sources: BTreeMap<String, BTreeMap<String, String>>,
    /// What each matched secret contributed
    pub per_source: BTreeMap<String, SourceUsage>,
}

impl CredentialUsage {
    pub fn record_source(&mut self, secret: &Secret) {
        self.sources
            .insert(secret.meta.name.clone(), secret.data.clone());
        self.per_source.entry(secret.meta.name.clone()).or_default();
    }

    /// Record a broker account found in `source`
    pub fn add_identity(&mut self, source: &str, identity: impl Into<String>) {
        let identity = identity.into();
        self.per_source
            .entry(source.to_string())
            .or_default()
            .identities
            .insert(identity.clone());
        self.identities.insert(identity);
    }

    /// Record a broker cluster found in `source`
    pub fn add_cluster(&mut self, source: &str, cluster: impl Into<String>) {
        let cluster = cluster.into();
        self.per_source
            .entry(source.to_string())
            .or_default()
            .clusters
            .insert(cluster.clone());
        self.clusters.insert(cluster);
    }

    /// No relevant secret matched
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Fingerprint of the matched material, empty when nothing matched
    pub fn fingerprint(&self) -> Result<String> {
        if self.sources.is_empty() {
            return Ok(String::new());
        }
        fingerprint_value(&self.sources)
    }

    /// Usage restricted to the given secrets. When none of them matched,
    /// nothing pins the consumer to particular secrets and the full usage
    /// applies.
    pub fn scoped(&self, secrets: &BTreeSet<String>) -> CredentialUsage {
        if !self.sources.keys().any(|name| secrets.contains(name)) {
            return self.clone();
        }
        let mut scoped = CredentialUsage::default();
        for (name, data) in self.sources.iter().filter(|(n, _)| secrets.contains(*n)) {
            scoped.sources.insert(name.clone(), data.clone());
            let found = self.per_source.get(name).cloned().unwrap_or_default();
            scoped.identities.extend(found.identities.iter().cloned());
            scoped.clusters.extend(found.clusters.iter().cloned());
            scoped.per_source.insert(name.clone(), found);
        }
        scoped
    }

    /// Whether both usages may run on the same broker cluster. Unknown
    /// clusters on either side count as shared.
    pub fn shares_cluster(&self, other: &CredentialUsage) -> bool {
        self.clusters.is_empty()
            || other.clusters.is_empty()
            || !self.clusters.is_disjoint(&other.clusters)
    }
}

/// Strategy that extracts credential usage for one service kind
pub trait CredentialResolver: Send + Sync {
    /// Service kind this resolver handles
    fn kind(&self) -> &str;

    /// Inspect the secrets and report what is in use
    fn resolve(&self, secrets: &[Secret]) -> Result<CredentialUsage>;
}

/// Resolvers keyed by credential kind, plus service types that map onto them
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Box<dyn CredentialResolver>>,
    aliases: HashMap<String, String>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the nova, neutron and ironic resolvers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(NovaResolver));
        registry.register(Box::new(ConfigFileResolver::neutron()));
        registry.register(Box::new(ConfigFileResolver::ironic()));
        registry.alias("neutron-dhcp", "neutron");
        registry.alias("neutron-sriov", "neutron");
        registry.alias("ironic-neutron-agent", "ironic");
        registry
    }

    /// Resolve `service_type` with the resolver of `credential_kind`
    pub fn alias(&mut self, service_type: &str, credential_kind: &str) {
        self.aliases
            .insert(service_type.to_string(), credential_kind.to_string());
    }

    /// Credential kind a service type uses; itself unless aliased
    pub fn credential_kind<'a>(&'a self, service_type: &'a str) -> &'a str {
        self.aliases
            .get(service_type)
            .map(String::as_str)
            .unwrap_or(service_type)
    }

    /// Register a resolver, replacing any previous one for its kind
    pub fn register(&mut self, resolver: Box<dyn CredentialResolver>) {
        self.resolvers.insert(resolver.kind().to_string(), resolver);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn CredentialResolver> {
        self.resolvers.get(kind).map(|r| r.as_ref())
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.resolvers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Source of credential usage for the guard manager and the rollout pass
pub trait FleetInventory: Send + Sync {
    /// Credential kind behind a service type. Tracking records and guard
    /// markers are keyed by it.
    fn credential_kind(&self, service_type: &str) -> String {
        service_type.to_string()
    }

    /// Credential usage of a service kind; `None` when the kind carries no
    /// credential dependency
    fn resolve_credential_usage(
        &self,
        service_kind: &str,
        namespace: &str,
    ) -> Result<Option<CredentialUsage>>;
}

/// Inventory backed by the secret store
pub struct SecretInventory {
    secrets: Arc<dyn RecordStore<Secret>>,
    registry: ResolverRegistry,
    namespace: String,
}

impl SecretInventory {
    pub fn new(
        secrets: Arc<dyn RecordStore<Secret>>,
        registry: ResolverRegistry,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            secrets,
            registry,
            namespace: namespace.into(),
        }
    }
}

impl FleetInventory for SecretInventory {
    fn credential_kind(&self, service_type: &str) -> String {
        self.registry.credential_kind(service_type).to_string()
    }

    fn resolve_credential_usage(
        &self,
        service_kind: &str,
        namespace: &str,
    ) -> Result<Option<CredentialUsage>> {
        if namespace != self.namespace {
            return Err(FleetError::Inventory(format!(
                "unknown namespace {} (managing {})",
                namespace, self.namespace
            )));
        }
        let Some(resolver) = self.registry.get(service_kind) else {
            return Ok(None);
        };
        let secrets = self.secrets.list()?;
        resolver.resolve(&secrets).map(Some)
    }
}
