//! Cloud credential storage. Payloads are validated against the provider
//! registry, then sealed; nothing downstream of the store ever sees them in
//! the clear except the provisioner.

use chrono::Utc;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::{Error, Result};
use hoster_store::model::CloudCredential;
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct NewCredential {
    /// Provider kind, e.g. `"digitalocean"`.
    pub provider: String,
    pub name: String,
    /// Provider-specific JSON payload, e.g. `{"api_token": "..."}`.
    pub payload_json: String,
    pub default_region: String,
}

impl<S: Store> Engine<S> {
    pub async fn store_credential(
        &self,
        auth: &AuthContext,
        new: NewCredential,
    ) -> Result<CloudCredential> {
        if !auth.authenticated {
            return Err(Error::forbidden("store credentials"));
        }
        if new.name.is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        // Constructing a provider client validates both the kind and the
        // payload shape without touching the network.
        self.providers.provider(&new.provider, &new.payload_json)?;

        let encrypted_payload = self.vault.seal(new.payload_json.as_bytes())?;
        let mut credential = CloudCredential {
            id: 0,
            reference_id: id::new_ref(ResourceKind::Credential),
            creator_id: auth.user_id,
            provider: new.provider,
            name: new.name,
            encrypted_payload,
            default_region: new.default_region,
            created_at: Utc::now(),
        };
        self.store
            .with_tx(move |tx| {
                tx.insert_credential(&mut credential)?;
                Ok(credential)
            })
            .await
    }

    pub async fn list_credentials(&self, auth: &AuthContext) -> Result<Vec<CloudCredential>> {
        if !auth.authenticated {
            return Err(Error::forbidden("list credentials"));
        }
        let user_id = auth.user_id;
        self.store
            .with_tx(move |tx| Ok(tx.credentials_by_creator(user_id)?))
            .await
    }

    /// Delete. Blocked with `Conflict` while a non-destroyed provision
    /// references the credential.
    pub async fn delete_credential(&self, auth: &AuthContext, reference_id: &str) -> Result<()> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let credential = tx.credential_by_ref(&reference_id)?;
                if !authz::can_manage_credential(&auth, &credential) {
                    return Err(Error::not_found("credential", reference_id));
                }
                let blocking = tx
                    .provisions_by_credential(credential.id)?
                    .into_iter()
                    .filter(|p| p.status != hoster_store::model::ProvisionStatus::Destroyed)
                    .count();
                if blocking > 0 {
                    return Err(Error::conflict(format!(
                        "credential is referenced by {blocking} non-destroyed provision(s)"
                    )));
                }
                tx.delete_credential(credential.id)?;
                Ok(())
            })
            .await
    }
}
