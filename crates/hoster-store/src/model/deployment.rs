use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use hoster_core::resources::ResourceSpec;
use serde::{Deserialize, Serialize};

/// Deployment lifecycle states. Transition edges are enforced by
/// [`DeploymentStatus::can_transition_to`]; every persisted status change
/// goes through that check inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleted,
}

impl DeploymentStatus {
    /// The legal edges:
    ///
    /// ```text
    /// pending   → scheduled | failed | deleted
    /// scheduled → starting  | failed | deleted
    /// starting  → running   | failed
    /// running   → stopping  | failed
    /// stopping  → stopped   | failed
    /// stopped   → starting  | deleted
    /// failed    → starting  | deleted
    /// deleted   → (terminal)
    /// ```
    ///
    /// A transition to `failed` is additionally legal from any non-terminal
    /// state, so mid-flight errors can always be recorded.
    pub fn can_transition_to(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::{
            Deleted, Failed, Pending, Running, Scheduled, Starting, Stopped, Stopping,
        };
        if to == Failed {
            return !matches!(self, Deleted | Failed);
        }
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Deleted)
                | (Scheduled, Starting)
                | (Scheduled, Deleted)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Stopped, Deleted)
                | (Failed, Starting)
                | (Failed, Deleted)
        )
    }

    /// The ordered intermediate states a start request traverses from this
    /// status, ending at `starting`. `None` when starting is not allowed.
    /// The path is applied one persisted transition at a time so monitors
    /// observe every intermediate state.
    pub fn start_path(self) -> Option<&'static [DeploymentStatus]> {
        match self {
            DeploymentStatus::Pending => {
                Some(&[DeploymentStatus::Scheduled, DeploymentStatus::Starting])
            }
            DeploymentStatus::Stopped | DeploymentStatus::Failed => {
                Some(&[DeploymentStatus::Starting])
            }
            _ => None,
        }
    }

    pub fn can_stop(self) -> bool {
        self == DeploymentStatus::Running
    }

    pub fn is_terminal(self) -> bool {
        self == DeploymentStatus::Deleted
    }

    /// Counts against node capacity: not deleted, not failed.
    pub fn reserves_capacity(self) -> bool {
        !matches!(self, DeploymentStatus::Deleted | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Scheduled => "scheduled",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopping => "stopping",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Whether a domain was generated by the system or supplied by the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Auto,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

/// One entry of a deployment's ordered domain list. The first entry is the
/// primary domain. Persisted as JSON with `hostname` at the top level so the
/// store can query it with `json_each()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDomain {
    pub hostname: String,
    pub kind: DomainKind,
    pub verification_status: VerificationStatus,
    /// Which method verified it, `"A"` or `"CNAME"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_error: Option<String>,
}

impl DeploymentDomain {
    /// An auto-domain is born verified; nobody else controls the base zone.
    pub fn auto(hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: DomainKind::Auto,
            verification_status: VerificationStatus::Verified,
            verified_method: None,
            verified_at: Some(now),
            last_checked_at: None,
            last_check_error: None,
        }
    }

    pub fn custom(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: DomainKind::Custom,
            verification_status: VerificationStatus::Pending,
            verified_method: None,
            verified_at: None,
            last_checked_at: None,
            last_check_error: None,
        }
    }
}

/// A container created for one service of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContainer {
    pub service_name: String,
    pub container_id: String,
    pub status: String,
}

/// A customer-owned instance of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub reference_id: String,
    pub customer_id: i64,
    pub template_id: i64,
    /// Reference-ID alternative to `template_id`; resolved by the store when
    /// `template_id` is zero.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_ref: String,
    /// Template version captured at create time. Later template publishes do
    /// not retroactively change a deployment.
    pub template_version: String,
    /// DNS-safe: `^[a-z][a-z0-9-]{0,62}$`.
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Ordered; first is primary.
    #[serde(default)]
    pub domains: Vec<DeploymentDomain>,
    #[serde(default)]
    pub containers: Vec<DeploymentContainer>,
    pub node_id: Option<i64>,
    pub proxy_port: Option<u16>,
    /// Actual reservation, captured from the template at create time.
    pub resources: ResourceSpec,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn primary_domain(&self) -> Option<&DeploymentDomain> {
        self.domains.first()
    }

    pub fn auto_domain(&self) -> Option<&str> {
        self.domains
            .iter()
            .find(|d| d.kind == DomainKind::Auto)
            .map(|d| d.hostname.as_str())
    }

    pub fn domain(&self, hostname: &str) -> Option<&DeploymentDomain> {
        self.domains.iter().find(|d| d.hostname == hostname)
    }

    pub fn domain_mut(&mut self, hostname: &str) -> Option<&mut DeploymentDomain> {
        self.domains.iter_mut().find(|d| d.hostname == hostname)
    }

    /// Validates the deployment name rule.
    pub fn name_is_valid(name: &str) -> bool {
        let mut bytes = name.bytes();
        let Some(first) = bytes.next() else {
            return false;
        };
        first.is_ascii_lowercase()
            && name.len() <= 63
            && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    }
}
