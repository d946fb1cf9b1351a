use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An SSH key pair: public half in the clear, private half sealed by the
/// vault. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: i64,
    pub name: String,
    /// OpenSSH `authorized_keys` line.
    pub public_key: String,
    /// `SHA256:<base64>` of the public key blob.
    pub fingerprint: String,
    /// Vault ciphertext of the OpenSSH-encoded private key.
    #[serde(with = "serde_bytes_base64")]
    pub encrypted_private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Base64 wrapper so ciphertext survives JSON round-trips compactly.
pub(crate) mod serde_bytes_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine as _;
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
