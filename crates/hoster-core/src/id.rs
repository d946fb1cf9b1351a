//! Reference-ID generation and validation.
//!
//! Every entity is addressed externally by a prefixed string ID
//! (`depl_x4k2m9qa`). Integer primary keys never leave the store layer.

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

const SUFFIX_LEN: usize = 8;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The entity kinds that carry reference-IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Template,
    Deployment,
    Node,
    SshKey,
    Credential,
    Provision,
    Event,
}

impl ResourceKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Template => "tmpl",
            ResourceKind::Deployment => "depl",
            ResourceKind::Node => "node",
            ResourceKind::SshKey => "key",
            ResourceKind::Credential => "cred",
            ResourceKind::Provision => "prov",
            ResourceKind::Event => "evt",
        }
    }
}

/// Generate a fresh reference-ID: `<prefix>_` plus eight lowercase
/// alphanumeric characters drawn from the OS CSPRNG.
pub fn new_ref(kind: ResourceKind) -> String {
    let mut rng = OsRng;
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}_{suffix}", kind.prefix())
}

/// The kind a reference-ID claims to be, if its prefix is recognized.
pub fn kind_of(id: &str) -> Option<ResourceKind> {
    let prefix = id.split_once('_')?.0;
    match prefix {
        "tmpl" => Some(ResourceKind::Template),
        "depl" => Some(ResourceKind::Deployment),
        "node" => Some(ResourceKind::Node),
        "key" => Some(ResourceKind::SshKey),
        "cred" => Some(ResourceKind::Credential),
        "prov" => Some(ResourceKind::Provision),
        "evt" => Some(ResourceKind::Event),
        _ => None,
    }
}

/// Whether `id` is a well-formed reference-ID of the given kind.
pub fn is_valid(kind: ResourceKind, id: &str) -> bool {
    let Some(suffix) = id.strip_prefix(kind.prefix()).and_then(|s| s.strip_prefix('_')) else {
        return false;
    };
    suffix.len() == SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for kind in [
            ResourceKind::Template,
            ResourceKind::Deployment,
            ResourceKind::Node,
            ResourceKind::SshKey,
            ResourceKind::Credential,
            ResourceKind::Provision,
            ResourceKind::Event,
        ] {
            let id = new_ref(kind);
            assert!(is_valid(kind, &id), "generated id {id} failed validation");
            assert_eq!(kind_of(&id), Some(kind));
        }
    }

    #[test]
    fn ids_are_distinct() {
        let a = new_ref(ResourceKind::Deployment);
        let b = new_ref(ResourceKind::Deployment);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_wrong_prefix_and_shape() {
        assert!(!is_valid(ResourceKind::Deployment, "tmpl_abcdefgh"));
        assert!(!is_valid(ResourceKind::Deployment, "depl_short"));
        assert!(!is_valid(ResourceKind::Deployment, "depl_ABCDEFGH"));
        assert!(!is_valid(ResourceKind::Deployment, "depl_abcdefghi"));
        assert!(!is_valid(ResourceKind::Deployment, "depl-abcdefgh"));
        assert_eq!(kind_of("unknown_abcdefgh"), None);
    }
}
