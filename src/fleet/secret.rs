//! Configuration secrets and shared broker credentials

use crate::error::{FleetError, Result};
use crate::store::{ObjectMeta, Resource};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// External configuration material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    pub meta: ObjectMeta,
    /// Decoded key/value data
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Last time the data changed
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Resource for Secret {
    const KIND: &'static str = "Secret";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl Secret {
    pub fn new(name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            data,
            modified_at: Some(Utc::now()),
        }
    }

    /// Build a secret from base64 `data` and plain `string_data`; plain
    /// values win on key clashes
    pub fn from_encoded(
        name: impl Into<String>,
        data: &BTreeMap<String, String>,
        string_data: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        let mut decoded = BTreeMap::new();
        for (key, value) in data {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(value.trim())
                .map_err(|e| {
                    FleetError::Manifest(format!("secret {} key {}: invalid base64: {}", name, key, e))
                })?;
            let text = String::from_utf8(bytes).map_err(|e| {
                FleetError::Manifest(format!("secret {} key {}: invalid UTF-8: {}", name, key, e))
            })?;
            decoded.insert(key.clone(), text);
        }
        for (key, value) in string_data {
            decoded.insert(key.clone(), value.clone());
        }
        Ok(Self::new(name, decoded))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// Spec of a shared broker credential
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSpec {
    /// Broker cluster the account lives on
    pub cluster: String,
    /// Requested account name
    pub username: String,
}

/// Observed state of a shared broker credential
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialStatus {
    /// Account name actually provisioned on the broker
    pub username: String,
}

/// Externally owned broker account. Guard markers live in `meta.finalizers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedCredential {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: CredentialSpec,
    #[serde(default)]
    pub status: CredentialStatus,
}

impl Resource for SharedCredential {
    const KIND: &'static str = "SharedCredential";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl SharedCredential {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            meta: ObjectMeta::named(name),
            spec: CredentialSpec {
                cluster: cluster.into(),
                username: username.clone(),
            },
            status: CredentialStatus { username },
        }
    }

    /// Whether any of the in-use identities refers to this credential
    pub fn matches_any(&self, identities: &std::collections::BTreeSet<String>) -> bool {
        identities.contains(&self.meta.name)
            || (!self.status.username.is_empty() && identities.contains(&self.status.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_secret_from_encoded() {
        let mut data = BTreeMap::new();
        data.insert("rabbitmq_user_name".to_string(), "bm92YS1jZWxsMQ==".to_string());
        let mut string_data = BTreeMap::new();
        string_data.insert("extra".to_string(), "plain".to_string());

        let secret = Secret::from_encoded("nova-cell1-compute-config", &data, &string_data).unwrap();
        assert_eq!(secret.get("rabbitmq_user_name"), Some("nova-cell1"));
        assert_eq!(secret.get("extra"), Some("plain"));

        data.insert("bad".to_string(), "***".to_string());
        assert!(Secret::from_encoded("x", &data, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_credential_matching() {
        let mut cred = SharedCredential::new("nova-cell1-user", "rabbitmq-cell1", "nova-cell1-user");
        cred.status.username = "generated-abc".to_string();

        let by_name: BTreeSet<String> = ["nova-cell1-user".to_string()].into();
        let by_status: BTreeSet<String> = ["generated-abc".to_string()].into();
        let other: BTreeSet<String> = ["neutron".to_string()].into();
        assert!(cred.matches_any(&by_name));
        assert!(cred.matches_any(&by_status));
        assert!(!cred.matches_any(&other));
    }
}
