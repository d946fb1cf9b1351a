use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud API credentials for one provider, sealed by the vault. The payload
/// shape is provider-specific JSON; the store never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCredential {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: i64,
    /// Provider kind, e.g. `"digitalocean"`.
    pub provider: String,
    pub name: String,
    /// Vault ciphertext of the provider-specific JSON payload.
    #[serde(with = "super::key::serde_bytes_base64")]
    pub encrypted_payload: Vec<u8>,
    pub default_region: String,
    pub created_at: DateTime<Utc>,
}
