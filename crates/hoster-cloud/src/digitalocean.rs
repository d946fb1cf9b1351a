//! DigitalOcean provider over the public REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{CloudError, Result};
use crate::provider::{
    CloudProvider, Instance, InstanceRequest, InstanceSize, InstanceStatus, Region,
};

const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com";
const DROPLET_IMAGE: &str = "ubuntu-22-04-x64";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credential payload shape for `provider = "digitalocean"`.
#[derive(Debug, Deserialize)]
struct Payload {
    api_token: String,
}

pub struct DigitalOceanProvider {
    client: reqwest::Client,
    token: Zeroizing<String>,
    base_url: String,
}

impl DigitalOceanProvider {
    pub fn from_payload(payload_json: &str) -> Result<Self> {
        let payload: Payload = serde_json::from_str(payload_json)
            .map_err(|e| CloudError::MalformedPayload(e.to_string()))?;
        Self::new(payload.api_token)
    }

    pub fn new(api_token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            token: Zeroizing::new(api_token.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at a different API host. Test hook.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(self.token.as_str())
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(self.token.as_str())
            .json(&body)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// DELETE where 404 counts as success.
    async fn delete_idempotent(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(self.token.as_str())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::parse_empty(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::InvalidCredentials);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    async fn parse_empty(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::InvalidCredentials);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    fn droplet_to_instance(droplet: &serde_json::Value) -> Instance {
        let status = match droplet["status"].as_str().unwrap_or("unknown") {
            "new" => InstanceStatus::Provisioning,
            "active" => InstanceStatus::Running,
            "off" => InstanceStatus::Stopped,
            "archive" => InstanceStatus::Terminated,
            _ => InstanceStatus::Unknown,
        };
        let public_ip = droplet["networks"]["v4"]
            .as_array()
            .and_then(|nets| nets.iter().find(|n| n["type"] == "public"))
            .and_then(|n| n["ip_address"].as_str())
            .map(ToString::to_string);
        Instance {
            id: droplet["id"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            status,
            public_ip,
        }
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn kind(&self) -> &'static str {
        "digitalocean"
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let json = self.get_json("/v2/regions?per_page=200").await?;
        let regions = json["regions"]
            .as_array()
            .map(|regions| {
                regions
                    .iter()
                    .map(|r| Region {
                        slug: r["slug"].as_str().unwrap_or_default().to_string(),
                        name: r["name"].as_str().unwrap_or_default().to_string(),
                        available: r["available"].as_bool().unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(regions)
    }

    async fn list_sizes(&self, region: &str) -> Result<Vec<InstanceSize>> {
        let json = self.get_json("/v2/sizes?per_page=200").await?;
        let sizes = json["sizes"]
            .as_array()
            .map(|sizes| {
                sizes
                    .iter()
                    .filter(|s| {
                        s["regions"]
                            .as_array()
                            .is_some_and(|rs| rs.iter().any(|r| r == region))
                    })
                    .map(|s| InstanceSize {
                        slug: s["slug"].as_str().unwrap_or_default().to_string(),
                        vcpus: s["vcpus"].as_u64().unwrap_or(0) as u32,
                        memory_mb: s["memory"].as_u64().unwrap_or(0),
                        disk_gb: s["disk"].as_u64().unwrap_or(0),
                        price_monthly_cents: s["price_monthly"]
                            .as_f64()
                            .map(|p| (p * 100.0) as u64),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(sizes)
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let json = self
            .post_json(
                "/v2/account/keys",
                serde_json::json!({ "name": name, "public_key": public_key }),
            )
            .await?;
        let id = json["ssh_key"]["id"].as_u64().ok_or_else(|| CloudError::Api {
            status: 500,
            message: "no key id in response".to_string(),
        })?;
        debug!(name, id, "registered ssh key");
        Ok(id.to_string())
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.delete_idempotent(&format!("/v2/account/keys/{id}")).await
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        let body = serde_json::json!({
            "name": request.name,
            "region": request.region,
            "size": request.size,
            "image": DROPLET_IMAGE,
            "ssh_keys": request.ssh_key_ids,
            "backups": false,
            "ipv6": false,
            "monitoring": true,
            "tags": ["hoster", "managed"],
        });
        let json = self.post_json("/v2/droplets", body).await?;
        let droplet = &json["droplet"];
        if droplet["id"].as_u64().is_none() {
            return Err(CloudError::Api {
                status: 500,
                message: "no droplet id in response".to_string(),
            });
        }
        let instance = Self::droplet_to_instance(droplet);
        info!(id = %instance.id, region = %request.region, size = %request.size, "droplet created");
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let json = match self.get_json(&format!("/v2/droplets/{id}")).await {
            Ok(json) => json,
            Err(CloudError::Api { status: 404, .. }) => {
                return Err(CloudError::NotFound {
                    entity: "instance",
                    id: id.to_string(),
                });
            }
            Err(err) => return Err(err),
        };
        Ok(Self::droplet_to_instance(&json["droplet"]))
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        self.delete_idempotent(&format!("/v2/droplets/{id}")).await?;
        info!(id, "droplet destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("api_token", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn droplet_status_mapping() {
        let droplet = serde_json::json!({
            "id": 42,
            "status": "active",
            "networks": { "v4": [
                { "type": "private", "ip_address": "10.0.0.5" },
                { "type": "public", "ip_address": "203.0.113.10" },
            ]},
        });
        let instance = DigitalOceanProvider::droplet_to_instance(&droplet);
        assert_eq!(instance.id, "42");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.public_ip.as_deref(), Some("203.0.113.10"));
    }

    #[test]
    fn new_droplet_has_no_public_ip_yet() {
        let droplet = serde_json::json!({ "id": 7, "status": "new", "networks": { "v4": [] } });
        let instance = DigitalOceanProvider::droplet_to_instance(&droplet);
        assert_eq!(instance.status, InstanceStatus::Provisioning);
        assert_eq!(instance.public_ip, None);
    }

    #[test]
    fn debug_redacts_token() {
        let provider = DigitalOceanProvider::new("dop_v1_secret").unwrap();
        let rendered = format!("{provider:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
