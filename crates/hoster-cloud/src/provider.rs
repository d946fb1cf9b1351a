//! The per-kind cloud provider interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::digitalocean::DigitalOceanProvider;
use crate::error::{CloudError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub slug: String,
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSize {
    pub slug: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Monthly price in cents, when the provider reports one.
    pub price_monthly_cents: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Terminated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Provider-side instance ID.
    pub id: String,
    pub status: InstanceStatus,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    /// Provider-side SSH key IDs to authorize on the instance.
    pub ssh_key_ids: Vec<String>,
}

/// Operations the provisioner needs from any cloud. Implementations exist
/// per provider kind; nothing above this trait knows wire details.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The provider kind this implementation serves, e.g. `"digitalocean"`.
    fn kind(&self) -> &'static str;

    async fn list_regions(&self) -> Result<Vec<Region>>;
    async fn list_sizes(&self, region: &str) -> Result<Vec<InstanceSize>>;

    /// Registers a public key, returning the provider-side key ID.
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String>;
    /// Idempotent: deleting an absent key succeeds.
    async fn delete_ssh_key(&self, id: &str) -> Result<()>;

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance>;
    async fn get_instance(&self, id: &str) -> Result<Instance>;
    /// Idempotent: destroying an absent instance succeeds.
    async fn destroy_instance(&self, id: &str) -> Result<()>;
}

/// Build a provider from a kind string and the decrypted credential payload.
/// The payload shape is provider-specific JSON; each implementation parses
/// its own.
pub fn provider_for(kind: &str, payload_json: &str) -> Result<Box<dyn CloudProvider>> {
    match kind {
        "digitalocean" => Ok(Box::new(DigitalOceanProvider::from_payload(payload_json)?)),
        other => Err(CloudError::UnsupportedProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_rejected() {
        let err = provider_for("skynet", "{}").err().unwrap();
        assert!(matches!(err, CloudError::UnsupportedProvider(_)));
    }

    #[test]
    fn digitalocean_payload_parsed() {
        let provider = provider_for("digitalocean", r#"{"api_token":"dop_v1_test"}"#).unwrap();
        assert_eq!(provider.kind(), "digitalocean");
    }

    #[test]
    fn digitalocean_malformed_payload_rejected() {
        let err = provider_for("digitalocean", r#"{"token_missing":true}"#).err().unwrap();
        assert!(matches!(err, CloudError::MalformedPayload(_)));
    }
}
