//! Transactional in-memory store.
//!
//! Backs the test suites and `hosterd --dev`. Transactions stage a copy of
//! the whole state and swap it in on commit, so a closure that errors leaves
//! nothing behind and concurrent transactions are fully serialized — which
//! satisfies (strictly exceeds) the row-level serialization the engine
//! requires.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::model::{
    CloudCredential, CloudProvision, ContainerEvent, Deployment, DeploymentStatus, DomainKind,
    Node, NodeStatus, ProvisionStatus, SshKey, Template, UsageEvent, User,
};
use crate::store::{Store, StoreTx};

#[derive(Debug, Default, Clone)]
struct State {
    next_id: i64,
    users: BTreeMap<i64, User>,
    templates: BTreeMap<i64, Template>,
    deployments: BTreeMap<i64, Deployment>,
    nodes: BTreeMap<i64, Node>,
    ssh_keys: BTreeMap<i64, SshKey>,
    credentials: BTreeMap<i64, CloudCredential>,
    provisions: BTreeMap<i64, CloudProvision>,
    usage_events: BTreeMap<i64, UsageEvent>,
    container_events: BTreeMap<i64, ContainerEvent>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    type Tx<'a>
        = MemoryTx<'a>
    where
        Self: 'a;

    async fn with_tx<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Self::Tx<'_>) -> Result<R, E> + Send,
        E: From<StoreError> + Send,
        R: Send,
    {
        let mut guard = self.state.lock();
        let mut staged = guard.clone();
        let mut tx = MemoryTx { state: &mut staged };
        match f(&mut tx) {
            Ok(value) => {
                *guard = staged;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }
}

/// One transaction's mutable view over the staged state.
#[derive(Debug)]
pub struct MemoryTx<'a> {
    state: &'a mut State,
}

impl MemoryTx<'_> {
    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn check_unique_ref(
        &self,
        op: &'static str,
        entity: &'static str,
        reference_id: &str,
    ) -> Result<(), StoreError> {
        if reference_id.is_empty() {
            return Err(StoreError::InvalidData {
                op,
                entity,
                reason: "empty reference id".to_string(),
            });
        }
        let taken = self.state.templates.values().any(|t| t.reference_id == reference_id)
            || self.state.deployments.values().any(|d| d.reference_id == reference_id)
            || self.state.nodes.values().any(|n| n.reference_id == reference_id)
            || self.state.ssh_keys.values().any(|k| k.reference_id == reference_id)
            || self.state.credentials.values().any(|c| c.reference_id == reference_id)
            || self.state.provisions.values().any(|p| p.reference_id == reference_id);
        if taken {
            return Err(StoreError::DuplicateId {
                op,
                entity,
                id: reference_id.to_string(),
            });
        }
        Ok(())
    }

    fn live_deployments_on_node(&self, node_id: i64) -> impl Iterator<Item = &Deployment> {
        self.state
            .deployments
            .values()
            .filter(move |d| d.node_id == Some(node_id) && d.status != DeploymentStatus::Deleted)
    }
}

impl StoreTx for MemoryTx<'_> {
    fn resolve_user(
        &mut self,
        reference_id: &str,
        email: &str,
        name: &str,
        plan_id: &str,
    ) -> Result<i64, StoreError> {
        if reference_id.is_empty() {
            return Err(StoreError::InvalidData {
                op: "resolve_user",
                entity: "user",
                reason: "empty reference id".to_string(),
            });
        }
        if let Some(existing) = self
            .state
            .users
            .values_mut()
            .find(|u| u.reference_id == reference_id)
        {
            if !email.is_empty() {
                existing.email = email.to_string();
            }
            if !name.is_empty() {
                existing.name = name.to_string();
            }
            if !plan_id.is_empty() {
                existing.plan_id = plan_id.to_string();
            }
            return Ok(existing.id);
        }
        let id = self.state.next_id();
        self.state.users.insert(
            id,
            User {
                id,
                reference_id: reference_id.to_string(),
                email: email.to_string(),
                name: name.to_string(),
                plan_id: plan_id.to_string(),
                created_at: Self::now(),
            },
        );
        Ok(id)
    }

    fn user(&mut self, id: i64) -> Result<User, StoreError> {
        self.state
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", "user", id))
    }

    fn insert_template(&mut self, template: &mut Template) -> Result<(), StoreError> {
        self.check_unique_ref("insert_template", "template", &template.reference_id)?;
        if self.state.templates.values().any(|t| t.slug == template.slug) {
            return Err(StoreError::DuplicateSlug {
                op: "insert_template",
                slug: template.slug.clone(),
            });
        }
        template.id = self.state.next_id();
        template.created_at = Self::now();
        template.updated_at = template.created_at;
        self.state.templates.insert(template.id, template.clone());
        Ok(())
    }

    fn update_template(&mut self, template: &Template) -> Result<(), StoreError> {
        let existing = self.state.templates.get(&template.id).ok_or_else(|| {
            StoreError::not_found("update_template", "template", template.id)
        })?;
        if self
            .state
            .templates
            .values()
            .any(|t| t.id != template.id && t.slug == template.slug)
        {
            return Err(StoreError::DuplicateSlug {
                op: "update_template",
                slug: template.slug.clone(),
            });
        }
        let mut updated = template.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Self::now();
        self.state.templates.insert(updated.id, updated);
        Ok(())
    }

    fn template(&mut self, id: i64) -> Result<Template, StoreError> {
        self.state
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("template", "template", id))
    }

    fn template_by_ref(&mut self, reference_id: &str) -> Result<Template, StoreError> {
        self.state
            .templates
            .values()
            .find(|t| t.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("template_by_ref", "template", reference_id))
    }

    fn template_by_slug(&mut self, slug: &str) -> Result<Template, StoreError> {
        self.state
            .templates
            .values()
            .find(|t| t.slug == slug)
            .cloned()
            .ok_or_else(|| StoreError::not_found("template_by_slug", "template", slug))
    }

    fn list_templates(&mut self) -> Result<Vec<Template>, StoreError> {
        Ok(self.state.templates.values().cloned().collect())
    }

    fn delete_template(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.state.templates.contains_key(&id) {
            return Err(StoreError::not_found("delete_template", "template", id));
        }
        let referenced = self
            .state
            .deployments
            .values()
            .any(|d| d.template_id == id && d.status != DeploymentStatus::Deleted);
        if referenced {
            return Err(StoreError::ForeignKey {
                op: "delete_template",
                entity: "template",
                constraint: "template has non-deleted deployments".to_string(),
            });
        }
        self.state.templates.remove(&id);
        Ok(())
    }

    fn insert_deployment(&mut self, deployment: &mut Deployment) -> Result<(), StoreError> {
        self.check_unique_ref("insert_deployment", "deployment", &deployment.reference_id)?;
        if deployment.template_id == 0 && !deployment.template_ref.is_empty() {
            deployment.template_id = self.template_by_ref(&deployment.template_ref)?.id;
        }
        if !self.state.templates.contains_key(&deployment.template_id) {
            return Err(StoreError::ForeignKey {
                op: "insert_deployment",
                entity: "deployment",
                constraint: format!("template {} does not exist", deployment.template_id),
            });
        }
        deployment.id = self.state.next_id();
        deployment.created_at = Self::now();
        deployment.updated_at = deployment.created_at;
        self.state.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    fn update_deployment(&mut self, deployment: &Deployment) -> Result<(), StoreError> {
        let existing = self.state.deployments.get(&deployment.id).ok_or_else(|| {
            StoreError::not_found("update_deployment", "deployment", deployment.id)
        })?;
        let mut updated = deployment.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Self::now();
        self.state.deployments.insert(updated.id, updated);
        Ok(())
    }

    fn deployment(&mut self, id: i64) -> Result<Deployment, StoreError> {
        self.state
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment", "deployment", id))
    }

    fn deployment_by_ref(&mut self, reference_id: &str) -> Result<Deployment, StoreError> {
        self.state
            .deployments
            .values()
            .find(|d| d.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment_by_ref", "deployment", reference_id))
    }

    fn deployment_by_domain(&mut self, hostname: &str) -> Result<Deployment, StoreError> {
        self.state
            .deployments
            .values()
            .find(|d| {
                d.status != DeploymentStatus::Deleted
                    && d.domains.iter().any(|dom| dom.hostname == hostname)
            })
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment_by_domain", "deployment", hostname))
    }

    fn deployments_by_customer(&mut self, customer_id: i64) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .state
            .deployments
            .values()
            .filter(|d| d.customer_id == customer_id)
            .cloned()
            .collect())
    }

    fn deployments_by_template(&mut self, template_id: i64) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .state
            .deployments
            .values()
            .filter(|d| d.template_id == template_id && d.status != DeploymentStatus::Deleted)
            .cloned()
            .collect())
    }

    fn deployments_by_node(&mut self, node_id: i64) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.live_deployments_on_node(node_id).cloned().collect())
    }

    fn deployments_with_custom_domains(&mut self) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .state
            .deployments
            .values()
            .filter(|d| {
                d.status != DeploymentStatus::Deleted
                    && d.domains.iter().any(|dom| dom.kind == DomainKind::Custom)
            })
            .cloned()
            .collect())
    }

    fn used_proxy_ports(&mut self, node_id: i64) -> Result<Vec<u16>, StoreError> {
        let mut ports: Vec<u16> = self
            .live_deployments_on_node(node_id)
            .filter_map(|d| d.proxy_port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    fn count_routable_deployments(&mut self) -> Result<u64, StoreError> {
        Ok(self
            .state
            .deployments
            .values()
            .filter(|d| d.status == DeploymentStatus::Running && d.proxy_port.is_some())
            .count() as u64)
    }

    fn insert_node(&mut self, node: &mut Node) -> Result<(), StoreError> {
        self.check_unique_ref("insert_node", "node", &node.reference_id)?;
        if node.ssh_key_id.is_none() && !node.ssh_key_ref.is_empty() {
            node.ssh_key_id = Some(self.ssh_key_by_ref(&node.ssh_key_ref)?.id);
        }
        if let Some(key_id) = node.ssh_key_id {
            if !self.state.ssh_keys.contains_key(&key_id) {
                return Err(StoreError::ForeignKey {
                    op: "insert_node",
                    entity: "node",
                    constraint: format!("ssh key {key_id} does not exist"),
                });
            }
        }
        if self
            .state
            .nodes
            .values()
            .any(|n| n.creator_id == node.creator_id && n.name == node.name)
        {
            return Err(StoreError::DuplicateId {
                op: "insert_node",
                entity: "node",
                id: node.name.clone(),
            });
        }
        node.id = self.state.next_id();
        node.created_at = Self::now();
        node.updated_at = node.created_at;
        self.state.nodes.insert(node.id, node.clone());
        Ok(())
    }

    fn update_node(&mut self, node: &Node) -> Result<(), StoreError> {
        let existing = self
            .state
            .nodes
            .get(&node.id)
            .ok_or_else(|| StoreError::not_found("update_node", "node", node.id))?;
        let mut updated = node.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Self::now();
        self.state.nodes.insert(updated.id, updated);
        Ok(())
    }

    fn node(&mut self, id: i64) -> Result<Node, StoreError> {
        self.state
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", "node", id))
    }

    fn node_by_ref(&mut self, reference_id: &str) -> Result<Node, StoreError> {
        self.state
            .nodes
            .values()
            .find(|n| n.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node_by_ref", "node", reference_id))
    }

    fn nodes_by_creator(&mut self, creator_id: i64) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .nodes
            .values()
            .filter(|n| n.creator_id == creator_id)
            .cloned()
            .collect())
    }

    fn online_nodes(&mut self) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .cloned()
            .collect())
    }

    fn checkable_nodes(&mut self) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .nodes
            .values()
            .filter(|n| n.status.is_checkable())
            .cloned()
            .collect())
    }

    fn nodes_by_ssh_key(&mut self, key_id: i64) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .state
            .nodes
            .values()
            .filter(|n| n.ssh_key_id == Some(key_id))
            .cloned()
            .collect())
    }

    fn delete_node(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.state.nodes.contains_key(&id) {
            return Err(StoreError::not_found("delete_node", "node", id));
        }
        if self.live_deployments_on_node(id).next().is_some() {
            return Err(StoreError::ForeignKey {
                op: "delete_node",
                entity: "node",
                constraint: "node has non-deleted deployments".to_string(),
            });
        }
        self.state.nodes.remove(&id);
        Ok(())
    }

    fn insert_ssh_key(&mut self, key: &mut SshKey) -> Result<(), StoreError> {
        self.check_unique_ref("insert_ssh_key", "ssh_key", &key.reference_id)?;
        key.id = self.state.next_id();
        key.created_at = Self::now();
        self.state.ssh_keys.insert(key.id, key.clone());
        Ok(())
    }

    fn ssh_key(&mut self, id: i64) -> Result<SshKey, StoreError> {
        self.state
            .ssh_keys
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ssh_key", "ssh_key", id))
    }

    fn ssh_key_by_ref(&mut self, reference_id: &str) -> Result<SshKey, StoreError> {
        self.state
            .ssh_keys
            .values()
            .find(|k| k.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ssh_key_by_ref", "ssh_key", reference_id))
    }

    fn ssh_keys_by_creator(&mut self, creator_id: i64) -> Result<Vec<SshKey>, StoreError> {
        Ok(self
            .state
            .ssh_keys
            .values()
            .filter(|k| k.creator_id == creator_id)
            .cloned()
            .collect())
    }

    fn delete_ssh_key(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.state.ssh_keys.contains_key(&id) {
            return Err(StoreError::not_found("delete_ssh_key", "ssh_key", id));
        }
        if self.state.nodes.values().any(|n| n.ssh_key_id == Some(id)) {
            return Err(StoreError::ForeignKey {
                op: "delete_ssh_key",
                entity: "ssh_key",
                constraint: "key is referenced by a node".to_string(),
            });
        }
        self.state.ssh_keys.remove(&id);
        Ok(())
    }

    fn insert_credential(&mut self, credential: &mut CloudCredential) -> Result<(), StoreError> {
        self.check_unique_ref("insert_credential", "credential", &credential.reference_id)?;
        credential.id = self.state.next_id();
        credential.created_at = Self::now();
        self.state.credentials.insert(credential.id, credential.clone());
        Ok(())
    }

    fn credential(&mut self, id: i64) -> Result<CloudCredential, StoreError> {
        self.state
            .credentials
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("credential", "credential", id))
    }

    fn credential_by_ref(&mut self, reference_id: &str) -> Result<CloudCredential, StoreError> {
        self.state
            .credentials
            .values()
            .find(|c| c.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("credential_by_ref", "credential", reference_id))
    }

    fn credentials_by_creator(
        &mut self,
        creator_id: i64,
    ) -> Result<Vec<CloudCredential>, StoreError> {
        Ok(self
            .state
            .credentials
            .values()
            .filter(|c| c.creator_id == creator_id)
            .cloned()
            .collect())
    }

    fn delete_credential(&mut self, id: i64) -> Result<(), StoreError> {
        if !self.state.credentials.contains_key(&id) {
            return Err(StoreError::not_found("delete_credential", "credential", id));
        }
        let referenced = self
            .state
            .provisions
            .values()
            .any(|p| p.credential_id == id && p.status != ProvisionStatus::Destroyed);
        if referenced {
            return Err(StoreError::ForeignKey {
                op: "delete_credential",
                entity: "credential",
                constraint: "credential has non-destroyed provisions".to_string(),
            });
        }
        self.state.credentials.remove(&id);
        Ok(())
    }

    fn insert_provision(&mut self, provision: &mut CloudProvision) -> Result<(), StoreError> {
        self.check_unique_ref("insert_provision", "provision", &provision.reference_id)?;
        if provision.credential_id == 0 && !provision.credential_ref.is_empty() {
            provision.credential_id = self.credential_by_ref(&provision.credential_ref)?.id;
        }
        if !self.state.credentials.contains_key(&provision.credential_id) {
            return Err(StoreError::ForeignKey {
                op: "insert_provision",
                entity: "provision",
                constraint: format!("credential {} does not exist", provision.credential_id),
            });
        }
        provision.id = self.state.next_id();
        provision.created_at = Self::now();
        provision.updated_at = provision.created_at;
        self.state.provisions.insert(provision.id, provision.clone());
        Ok(())
    }

    fn update_provision(&mut self, provision: &CloudProvision) -> Result<(), StoreError> {
        let existing = self.state.provisions.get(&provision.id).ok_or_else(|| {
            StoreError::not_found("update_provision", "provision", provision.id)
        })?;
        let mut updated = provision.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Self::now();
        self.state.provisions.insert(updated.id, updated);
        Ok(())
    }

    fn provision(&mut self, id: i64) -> Result<CloudProvision, StoreError> {
        self.state
            .provisions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("provision", "provision", id))
    }

    fn provision_by_ref(&mut self, reference_id: &str) -> Result<CloudProvision, StoreError> {
        self.state
            .provisions
            .values()
            .find(|p| p.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("provision_by_ref", "provision", reference_id))
    }

    fn provisions_by_creator(
        &mut self,
        creator_id: i64,
    ) -> Result<Vec<CloudProvision>, StoreError> {
        Ok(self
            .state
            .provisions
            .values()
            .filter(|p| p.creator_id == creator_id)
            .cloned()
            .collect())
    }

    fn provisions_by_credential(
        &mut self,
        credential_id: i64,
    ) -> Result<Vec<CloudProvision>, StoreError> {
        Ok(self
            .state
            .provisions
            .values()
            .filter(|p| p.credential_id == credential_id)
            .cloned()
            .collect())
    }

    fn active_provisions(&mut self) -> Result<Vec<CloudProvision>, StoreError> {
        Ok(self
            .state
            .provisions
            .values()
            .filter(|p| p.status.is_active())
            .cloned()
            .collect())
    }

    fn append_usage_event(&mut self, event: &mut UsageEvent) -> Result<(), StoreError> {
        if event.reference_id.is_empty() {
            return Err(StoreError::InvalidData {
                op: "append_usage_event",
                entity: "usage_event",
                reason: "empty reference id".to_string(),
            });
        }
        event.id = self.state.next_id();
        self.state.usage_events.insert(event.id, event.clone());
        Ok(())
    }

    fn unreported_events(&mut self, limit: usize) -> Result<Vec<UsageEvent>, StoreError> {
        let mut events: Vec<UsageEvent> = self
            .state
            .usage_events
            .values()
            .filter(|e| e.reported_at.is_none())
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        events.truncate(limit);
        Ok(events)
    }

    fn mark_events_reported(
        &mut self,
        ids: &[i64],
        reported_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for id in ids {
            let event = self.state.usage_events.get_mut(id).ok_or_else(|| {
                StoreError::not_found("mark_events_reported", "usage_event", id)
            })?;
            if event.reported_at.is_none() {
                event.reported_at = Some(reported_at);
            }
        }
        Ok(())
    }

    fn append_container_event(&mut self, event: &mut ContainerEvent) -> Result<(), StoreError> {
        if !self.state.deployments.contains_key(&event.deployment_id) {
            return Err(StoreError::ForeignKey {
                op: "append_container_event",
                entity: "container_event",
                constraint: format!("deployment {} does not exist", event.deployment_id),
            });
        }
        event.id = self.state.next_id();
        event.created_at = Self::now();
        self.state.container_events.insert(event.id, event.clone());
        Ok(())
    }

    fn container_events(
        &mut self,
        deployment_id: i64,
        limit: usize,
    ) -> Result<Vec<ContainerEvent>, StoreError> {
        let mut events: Vec<ContainerEvent> = self
            .state
            .container_events
            .values()
            .filter(|e| e.deployment_id == deployment_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(limit);
        Ok(events)
    }
}
