//! Node registration and lifecycle. Registration records intent; the health
//! worker is what actually brings a node online.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use chrono::Utc;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::resources::{Capacity, ResourceSpec};
use hoster_core::{Error, Result};
use hoster_store::model::{Deployment, Node, NodeStatus};
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Reference of a stored SSH key; empty for the local node.
    pub ssh_key_ref: String,
    pub container_socket: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: ResourceSpec,
    /// Defaults to the installation base domain when empty.
    pub base_domain: String,
    pub public_ips: Vec<Ipv4Addr>,
}

impl<S: Store> Engine<S> {
    /// Register a node as `offline`; the health worker transitions it to
    /// `online` once reachable.
    pub async fn register_node(&self, auth: &AuthContext, new: NewNode) -> Result<Node> {
        if !auth.authenticated {
            return Err(Error::forbidden("register nodes"));
        }
        if !Deployment::name_is_valid(&new.name) {
            return Err(Error::validation("name", "must match ^[a-z][a-z0-9-]{0,62}$"));
        }
        hoster_runtime::ssh::validate_hostname(&new.ssh_host)
            .map_err(|e| Error::validation("ssh_host", e.to_string()))?;
        hoster_runtime::ssh::validate_username(&new.ssh_user)
            .map_err(|e| Error::validation("ssh_user", e.to_string()))?;

        let auth = auth.clone();
        let base_domain = if new.base_domain.is_empty() {
            self.config.base_domain.clone()
        } else {
            new.base_domain.clone()
        };
        let max_nodes = auth.plan_limits.max_nodes as usize;

        let mut node = Node {
            id: 0,
            reference_id: id::new_ref(ResourceKind::Node),
            creator_id: auth.user_id,
            name: new.name,
            ssh_host: new.ssh_host,
            ssh_port: new.ssh_port,
            ssh_user: new.ssh_user,
            ssh_key_id: None,
            ssh_key_ref: new.ssh_key_ref,
            container_socket: new.container_socket,
            status: NodeStatus::Offline,
            capabilities: new.capabilities,
            capacity: Capacity::new(new.capacity),
            base_domain,
            public_ips: new.public_ips,
            provision_id: None,
            last_health_check: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store
            .with_tx(move |tx| {
                if tx.nodes_by_creator(auth.user_id)?.len() >= max_nodes {
                    return Err(Error::forbidden(format!(
                        "register more than {max_nodes} nodes on this plan"
                    )));
                }
                tx.insert_node(&mut node)?;
                Ok(node)
            })
            .await
    }

    pub async fn list_nodes(&self, auth: &AuthContext) -> Result<Vec<Node>> {
        if !auth.authenticated {
            return Err(Error::forbidden("list nodes"));
        }
        let user_id = auth.user_id;
        self.store
            .with_tx(move |tx| Ok(tx.nodes_by_creator(user_id)?))
            .await
    }

    pub async fn get_node(&self, auth: &AuthContext, reference_id: &str) -> Result<Node> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| owned_node(tx, &auth, &reference_id))
            .await
    }

    /// Enter or leave maintenance. Leaving drops the node to `offline`; the
    /// health worker decides when it is `online` again.
    pub async fn set_node_maintenance(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        maintenance: bool,
    ) -> Result<Node> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let mut node = owned_node(tx, &auth, &reference_id)?;
                node.status = if maintenance {
                    NodeStatus::Maintenance
                } else {
                    NodeStatus::Offline
                };
                tx.update_node(&node)?;
                Ok(node)
            })
            .await
    }

    /// Delete. Blocked with `Conflict` while non-deleted deployments are
    /// scheduled to the node.
    pub async fn delete_node(&self, auth: &AuthContext, reference_id: &str) -> Result<()> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        let node = self
            .store
            .with_tx(move |tx| {
                let node = owned_node(tx, &auth, &reference_id)?;
                tx.delete_node(node.id)?;
                Ok::<hoster_store::model::Node, hoster_core::Error>(node)
            })
            .await?;
        self.pool.evict(&node.reference_id).await;
        Ok(())
    }
}

fn owned_node<T: StoreTx>(tx: &mut T, auth: &AuthContext, reference_id: &str) -> Result<Node> {
    let node = tx.node_by_ref(reference_id)?;
    if !authz::can_manage_node(auth, &node) {
        return Err(Error::not_found("node", reference_id));
    }
    Ok(node)
}
