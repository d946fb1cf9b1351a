use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionStatus {
    Pending,
    Creating,
    Configuring,
    Ready,
    Failed,
    Destroying,
    Destroyed,
}

impl ProvisionStatus {
    /// Active provisions are the ones the reconciliation worker advances.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProvisionStatus::Pending
                | ProvisionStatus::Creating
                | ProvisionStatus::Configuring
                | ProvisionStatus::Destroying
        )
    }

    /// Create-path forward edges plus operator retry (`failed → pending`) and
    /// the destroy edges. The destroy path is reachable from every state but
    /// `destroyed`, and never fails.
    pub fn can_transition_to(self, to: ProvisionStatus) -> bool {
        use ProvisionStatus::{
            Configuring, Creating, Destroyed, Destroying, Failed, Pending, Ready,
        };
        match to {
            Destroying => !matches!(self, Destroyed | Destroying),
            Destroyed => self == Destroying,
            Failed => matches!(self, Pending | Creating | Configuring),
            Pending => self == Failed,
            Creating => self == Pending,
            Configuring => self == Creating,
            Ready => self == Configuring,
        }
    }
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStatus::Pending => "pending",
            ProvisionStatus::Creating => "creating",
            ProvisionStatus::Configuring => "configuring",
            ProvisionStatus::Ready => "ready",
            ProvisionStatus::Failed => "failed",
            ProvisionStatus::Destroying => "destroying",
            ProvisionStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Lifecycle handle for one cloud-instance-creation request. The external
/// identifiers fill in as the provisioner makes progress and survive
/// restarts, which is what makes the reconciliation loop resumable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudProvision {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: i64,
    pub credential_id: i64,
    /// Reference-ID alternative to `credential_id`; resolved by the store
    /// when `credential_id` is zero.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential_ref: String,
    pub provider: String,
    pub instance_name: String,
    pub region: String,
    pub size: String,
    /// Provider-side instance ID, persisted the moment creation is accepted
    /// so a restart never re-creates.
    pub provider_instance_id: Option<String>,
    /// Provider-side ID of the registered SSH public key.
    pub provider_key_id: Option<String>,
    pub public_ip: Option<String>,
    /// The key pair generated for this provision.
    pub ssh_key_id: Option<i64>,
    /// The node produced on success.
    pub node_id: Option<i64>,
    pub status: ProvisionStatus,
    /// Operator-visible progress, e.g. "Waiting for SSH".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionStatus::{Configuring, Creating, Destroyed, Destroying, Failed, Pending, Ready};

    #[test]
    fn create_path_is_ordered() {
        assert!(Pending.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Configuring));
        assert!(Configuring.can_transition_to(Ready));
        assert!(!Pending.can_transition_to(Configuring));
        assert!(!Creating.can_transition_to(Ready));
    }

    #[test]
    fn retry_only_from_failed() {
        assert!(Failed.can_transition_to(Pending));
        assert!(!Ready.can_transition_to(Pending));
        assert!(!Destroyed.can_transition_to(Pending));
    }

    #[test]
    fn destroy_reaches_everything_but_destroyed() {
        for from in [Pending, Creating, Configuring, Ready, Failed] {
            assert!(from.can_transition_to(Destroying), "{from} must be destroyable");
        }
        assert!(!Destroyed.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Destroyed));
        assert!(!Destroying.can_transition_to(Failed));
    }

    #[test]
    fn active_set() {
        assert!(Pending.is_active());
        assert!(Creating.is_active());
        assert!(Configuring.is_active());
        assert!(Destroying.is_active());
        assert!(!Ready.is_active());
        assert!(!Failed.is_active());
        assert!(!Destroyed.is_active());
    }
}
