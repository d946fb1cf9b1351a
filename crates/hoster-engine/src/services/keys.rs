//! SSH key management. Keys are generated server-side; private halves exist
//! outside the vault only inside tunnel and bootstrap key files.

use chrono::Utc;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::{Error, Result};
use hoster_store::model::SshKey;
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::engine::Engine;

impl<S: Store> Engine<S> {
    /// Generate an ed25519 key pair owned by the caller.
    pub async fn generate_ssh_key(&self, auth: &AuthContext, name: &str) -> Result<SshKey> {
        if !auth.authenticated {
            return Err(Error::forbidden("create ssh keys"));
        }
        if name.is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        let generated = self.vault.generate_ssh_key(name)?;
        let mut key = SshKey {
            id: 0,
            reference_id: id::new_ref(ResourceKind::SshKey),
            creator_id: auth.user_id,
            name: name.to_string(),
            public_key: generated.public_key,
            fingerprint: generated.fingerprint,
            encrypted_private_key: generated.encrypted_private_key,
            created_at: Utc::now(),
        };
        self.store
            .with_tx(move |tx| {
                tx.insert_ssh_key(&mut key)?;
                Ok(key)
            })
            .await
    }

    pub async fn list_ssh_keys(&self, auth: &AuthContext) -> Result<Vec<SshKey>> {
        if !auth.authenticated {
            return Err(Error::forbidden("list ssh keys"));
        }
        let user_id = auth.user_id;
        self.store
            .with_tx(move |tx| Ok(tx.ssh_keys_by_creator(user_id)?))
            .await
    }

    /// Delete. Blocked with `Conflict` while any node references the key.
    pub async fn delete_ssh_key(&self, auth: &AuthContext, reference_id: &str) -> Result<()> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let key = tx.ssh_key_by_ref(&reference_id)?;
                if !authz::can_manage_ssh_key(&auth, &key) {
                    return Err(Error::not_found("ssh_key", reference_id));
                }
                let holders = tx.nodes_by_ssh_key(key.id)?;
                if !holders.is_empty() {
                    return Err(Error::conflict(format!(
                        "key is used by node {}",
                        holders[0].reference_id
                    )));
                }
                tx.delete_ssh_key(key.id)?;
                Ok(())
            })
            .await
    }
}
