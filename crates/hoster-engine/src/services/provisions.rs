//! Provision intents. These methods only move rows between states; the
//! provisioner worker does the cloud work.

use chrono::Utc;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::{Error, Result};
use hoster_store::model::{CloudProvision, Deployment, ProvisionStatus};
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct NewProvision {
    pub credential_ref: String,
    pub instance_name: String,
    /// Defaults to the credential's default region when empty.
    pub region: String,
    pub size: String,
}

impl<S: Store> Engine<S> {
    /// Queue a new instance provision. The worker picks it up on its next
    /// tick.
    pub async fn request_provision(
        &self,
        auth: &AuthContext,
        new: NewProvision,
    ) -> Result<CloudProvision> {
        if !auth.authenticated {
            return Err(Error::forbidden("provision instances"));
        }
        if !Deployment::name_is_valid(&new.instance_name) {
            return Err(Error::validation(
                "instance_name",
                "must match ^[a-z][a-z0-9-]{0,62}$",
            ));
        }
        if new.size.is_empty() {
            return Err(Error::validation("size", "must not be empty"));
        }

        let auth = auth.clone();
        self.store
            .with_tx(move |tx| {
                let credential = tx.credential_by_ref(&new.credential_ref)?;
                if !authz::can_manage_credential(&auth, &credential) {
                    return Err(Error::not_found("credential", new.credential_ref.clone()));
                }
                let region = if new.region.is_empty() {
                    credential.default_region.clone()
                } else {
                    new.region.clone()
                };
                let mut provision = CloudProvision {
                    id: 0,
                    reference_id: id::new_ref(ResourceKind::Provision),
                    creator_id: auth.user_id,
                    credential_id: credential.id,
                    credential_ref: String::new(),
                    provider: credential.provider.clone(),
                    instance_name: new.instance_name.clone(),
                    region,
                    size: new.size.clone(),
                    provider_instance_id: None,
                    provider_key_id: None,
                    public_ip: None,
                    ssh_key_id: None,
                    node_id: None,
                    status: ProvisionStatus::Pending,
                    current_step: Some("Queued".to_string()),
                    error_message: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                tx.insert_provision(&mut provision)?;
                Ok(provision)
            })
            .await
    }

    pub async fn list_provisions(&self, auth: &AuthContext) -> Result<Vec<CloudProvision>> {
        if !auth.authenticated {
            return Err(Error::forbidden("list provisions"));
        }
        let user_id = auth.user_id;
        self.store
            .with_tx(move |tx| Ok(tx.provisions_by_creator(user_id)?))
            .await
    }

    pub async fn get_provision(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<CloudProvision> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| owned_provision(tx, &auth, &reference_id))
            .await
    }

    /// Operator retry of a failed provision: back to `pending` with the
    /// error cleared. External identifiers stay, so completed steps are not
    /// redone.
    pub async fn retry_provision(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<CloudProvision> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let mut provision = owned_provision(tx, &auth, &reference_id)?;
                if !provision.status.can_transition_to(ProvisionStatus::Pending) {
                    return Err(Error::InvalidTransition {
                        entity: "provision",
                        from: provision.status.to_string(),
                        to: ProvisionStatus::Pending.to_string(),
                    });
                }
                provision.status = ProvisionStatus::Pending;
                provision.error_message = None;
                provision.current_step = Some("Retrying".to_string());
                tx.update_provision(&provision)?;
                Ok(provision)
            })
            .await
    }

    /// Begin teardown. Idempotent: a destroyed (or already-destroying)
    /// provision returns success with no side effects.
    pub async fn destroy_provision(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<CloudProvision> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let mut provision = owned_provision(tx, &auth, &reference_id)?;
                if matches!(
                    provision.status,
                    ProvisionStatus::Destroyed | ProvisionStatus::Destroying
                ) {
                    return Ok(provision);
                }
                provision.status = ProvisionStatus::Destroying;
                provision.current_step = Some("Destroying".to_string());
                provision.error_message = None;
                tx.update_provision(&provision)?;
                Ok(provision)
            })
            .await
    }
}

fn owned_provision<T: StoreTx>(
    tx: &mut T,
    auth: &AuthContext,
    reference_id: &str,
) -> Result<CloudProvision> {
    let provision = tx.provision_by_ref(reference_id)?;
    if !authz::can_manage_provision(auth, &provision) {
        return Err(Error::not_found("provision", reference_id));
    }
    Ok(provision)
}
