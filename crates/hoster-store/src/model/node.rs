use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use hoster_core::resources::Capacity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
    Maintenance,
    Unreachable,
}

impl NodeStatus {
    /// Everything except maintenance gets health-checked.
    pub fn is_checkable(self) -> bool {
        self != NodeStatus::Maintenance
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Offline => "offline",
            NodeStatus::Online => "online",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// A host, local or remote over SSH, that runs containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: i64,
    /// Unique per creator.
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Absent for the local node, which needs no SSH.
    pub ssh_key_id: Option<i64>,
    /// Reference-ID alternative to `ssh_key_id`; resolved by the store when
    /// `ssh_key_id` is unset.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_ref: String,
    /// Container runtime socket path on the node.
    pub container_socket: String,
    pub status: NodeStatus,
    /// Opaque capability strings a template may require.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub capacity: Capacity,
    /// Base domain for auto-domains of deployments scheduled here.
    pub base_domain: String,
    /// Public IPs this node answers on; the expected set for A-record
    /// domain verification.
    #[serde(default)]
    pub public_ips: Vec<std::net::Ipv4Addr>,
    /// Back-reference to the provision that created this node, if any.
    pub provision_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Whether this node satisfies a template's capability requirements.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}
