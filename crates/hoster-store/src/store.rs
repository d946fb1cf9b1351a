//! The storage interface the control plane is written against.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    CloudCredential, CloudProvision, ContainerEvent, Deployment, Node, SshKey, Template, UsageEvent,
    User,
};

/// The operations available inside a transaction.
///
/// Methods are synchronous: a transaction is a short critical section over
/// row state, and implementations serialize access per row (the in-memory
/// store serializes whole transactions). Reference-ID resolution happens
/// here: inserts that receive a zero integer FK alongside a non-empty
/// reference-ID resolve the reference inside the same transaction and write
/// the integer back onto the entity. This is the single authorized crossing
/// from string IDs into integer space.
pub trait StoreTx {
    // Users

    /// Upsert by auth reference-ID: insert on first sight, update non-empty
    /// fields on later sights. Idempotent; returns the integer ID.
    fn resolve_user(
        &mut self,
        reference_id: &str,
        email: &str,
        name: &str,
        plan_id: &str,
    ) -> Result<i64, StoreError>;

    fn user(&mut self, id: i64) -> Result<User, StoreError>;

    // Templates

    /// Assigns `id` (and `created_at`/`updated_at`) on the way in.
    fn insert_template(&mut self, template: &mut Template) -> Result<(), StoreError>;
    fn update_template(&mut self, template: &Template) -> Result<(), StoreError>;
    fn template(&mut self, id: i64) -> Result<Template, StoreError>;
    fn template_by_ref(&mut self, reference_id: &str) -> Result<Template, StoreError>;
    fn template_by_slug(&mut self, slug: &str) -> Result<Template, StoreError>;
    fn list_templates(&mut self) -> Result<Vec<Template>, StoreError>;
    /// Fails with `ForeignKey` while any non-deleted deployment references
    /// the template.
    fn delete_template(&mut self, id: i64) -> Result<(), StoreError>;

    // Deployments

    fn insert_deployment(&mut self, deployment: &mut Deployment) -> Result<(), StoreError>;
    fn update_deployment(&mut self, deployment: &Deployment) -> Result<(), StoreError>;
    fn deployment(&mut self, id: i64) -> Result<Deployment, StoreError>;
    fn deployment_by_ref(&mut self, reference_id: &str) -> Result<Deployment, StoreError>;
    /// The unique deployment whose domain list contains `hostname`.
    fn deployment_by_domain(&mut self, hostname: &str) -> Result<Deployment, StoreError>;
    fn deployments_by_customer(&mut self, customer_id: i64) -> Result<Vec<Deployment>, StoreError>;
    /// Non-deleted deployments referencing the template.
    fn deployments_by_template(&mut self, template_id: i64) -> Result<Vec<Deployment>, StoreError>;
    /// Non-deleted deployments scheduled to the node.
    fn deployments_by_node(&mut self, node_id: i64) -> Result<Vec<Deployment>, StoreError>;
    /// Non-deleted deployments carrying at least one custom domain.
    fn deployments_with_custom_domains(&mut self) -> Result<Vec<Deployment>, StoreError>;
    /// Ports reserved by non-deleted deployments on the node.
    fn used_proxy_ports(&mut self, node_id: i64) -> Result<Vec<u16>, StoreError>;
    /// Running deployments with a proxy port assigned.
    fn count_routable_deployments(&mut self) -> Result<u64, StoreError>;

    // Nodes

    fn insert_node(&mut self, node: &mut Node) -> Result<(), StoreError>;
    fn update_node(&mut self, node: &Node) -> Result<(), StoreError>;
    fn node(&mut self, id: i64) -> Result<Node, StoreError>;
    fn node_by_ref(&mut self, reference_id: &str) -> Result<Node, StoreError>;
    fn nodes_by_creator(&mut self, creator_id: i64) -> Result<Vec<Node>, StoreError>;
    fn online_nodes(&mut self) -> Result<Vec<Node>, StoreError>;
    /// All nodes except those in maintenance.
    fn checkable_nodes(&mut self) -> Result<Vec<Node>, StoreError>;
    fn nodes_by_ssh_key(&mut self, key_id: i64) -> Result<Vec<Node>, StoreError>;
    /// Fails with `ForeignKey` while non-deleted deployments are scheduled
    /// to the node.
    fn delete_node(&mut self, id: i64) -> Result<(), StoreError>;

    // SSH keys

    fn insert_ssh_key(&mut self, key: &mut SshKey) -> Result<(), StoreError>;
    fn ssh_key(&mut self, id: i64) -> Result<SshKey, StoreError>;
    fn ssh_key_by_ref(&mut self, reference_id: &str) -> Result<SshKey, StoreError>;
    fn ssh_keys_by_creator(&mut self, creator_id: i64) -> Result<Vec<SshKey>, StoreError>;
    /// Fails with `ForeignKey` while any node references the key.
    fn delete_ssh_key(&mut self, id: i64) -> Result<(), StoreError>;

    // Cloud credentials

    fn insert_credential(&mut self, credential: &mut CloudCredential) -> Result<(), StoreError>;
    fn credential(&mut self, id: i64) -> Result<CloudCredential, StoreError>;
    fn credential_by_ref(&mut self, reference_id: &str) -> Result<CloudCredential, StoreError>;
    fn credentials_by_creator(&mut self, creator_id: i64)
    -> Result<Vec<CloudCredential>, StoreError>;
    /// Fails with `ForeignKey` while a non-destroyed provision references
    /// the credential.
    fn delete_credential(&mut self, id: i64) -> Result<(), StoreError>;

    // Provisions

    fn insert_provision(&mut self, provision: &mut CloudProvision) -> Result<(), StoreError>;
    fn update_provision(&mut self, provision: &CloudProvision) -> Result<(), StoreError>;
    fn provision(&mut self, id: i64) -> Result<CloudProvision, StoreError>;
    fn provision_by_ref(&mut self, reference_id: &str) -> Result<CloudProvision, StoreError>;
    fn provisions_by_creator(&mut self, creator_id: i64)
    -> Result<Vec<CloudProvision>, StoreError>;
    fn provisions_by_credential(
        &mut self,
        credential_id: i64,
    ) -> Result<Vec<CloudProvision>, StoreError>;
    /// Provisions in `pending | creating | configuring | destroying`.
    fn active_provisions(&mut self) -> Result<Vec<CloudProvision>, StoreError>;

    // Usage events

    fn append_usage_event(&mut self, event: &mut UsageEvent) -> Result<(), StoreError>;
    /// Unreported events in timestamp order, up to `limit`.
    fn unreported_events(&mut self, limit: usize) -> Result<Vec<UsageEvent>, StoreError>;
    /// Stamps `reported_at` on the given events. Already-reported events are
    /// left untouched.
    fn mark_events_reported(
        &mut self,
        ids: &[i64],
        reported_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Container events

    fn append_container_event(&mut self, event: &mut ContainerEvent) -> Result<(), StoreError>;
    /// Newest first, up to `limit`.
    fn container_events(
        &mut self,
        deployment_id: i64,
        limit: usize,
    ) -> Result<Vec<ContainerEvent>, StoreError>;
}

/// A durable store. `with_tx` is the only entry point; the convenience
/// wrappers below are single-operation transactions.
///
/// The closure's error type only has to be convertible from [`StoreError`],
/// so callers abort transactions with their own error kinds and `?` still
/// works on every tx operation.
pub trait Store: Send + Sync + 'static {
    type Tx<'a>: StoreTx + Send
    where
        Self: 'a;

    fn with_tx<R, E, F>(&self, f: F) -> impl Future<Output = Result<R, E>> + Send
    where
        F: FnOnce(&mut Self::Tx<'_>) -> Result<R, E> + Send,
        E: From<StoreError> + Send,
        R: Send;

    fn get_deployment(&self, id: i64) -> impl Future<Output = Result<Deployment, StoreError>> + Send
    where
        Self: Sized,
    {
        self.with_tx(move |tx| tx.deployment(id))
    }

    fn get_node(&self, id: i64) -> impl Future<Output = Result<Node, StoreError>> + Send
    where
        Self: Sized,
    {
        self.with_tx(move |tx| tx.node(id))
    }

    fn list_checkable_nodes(&self) -> impl Future<Output = Result<Vec<Node>, StoreError>> + Send
    where
        Self: Sized,
    {
        self.with_tx(|tx| tx.checkable_nodes())
    }

    fn list_active_provisions(
        &self,
    ) -> impl Future<Output = Result<Vec<CloudProvision>, StoreError>> + Send
    where
        Self: Sized,
    {
        self.with_tx(|tx| tx.active_provisions())
    }
}
