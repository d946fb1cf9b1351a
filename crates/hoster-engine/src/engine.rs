//! The engine: shared wiring for services and workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use hoster_cloud::CloudProvider;
use hoster_core::config::HosterConfig;
use hoster_core::id::{self, ResourceKind};
use hoster_core::{Error, Result};
use hoster_runtime::pool::{NodeEndpoint, NodePool};
use hoster_store::model::{ContainerEvent, Deployment, DeploymentStatus, Node, UsageEvent};
use hoster_store::{Store, StoreTx};

use crate::dns::DnsResolver;
use crate::vault::CryptoVault;

/// Builds a provider client from a credential's kind and decrypted payload.
/// Injected so tests and dev mode can swap clouds out.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, kind: &str, payload_json: &str) -> Result<Arc<dyn CloudProvider>>;
}

/// Production factory backed by the provider registry.
pub struct RegistryProviderFactory;

impl ProviderFactory for RegistryProviderFactory {
    fn provider(&self, kind: &str, payload_json: &str) -> Result<Arc<dyn CloudProvider>> {
        let provider = hoster_cloud::provider_for(kind, payload_json)?;
        Ok(Arc::from(provider))
    }
}

/// External billing sink. Returns the IDs it acknowledged; only those get
/// marked reported.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn report(&self, batch: &[UsageEvent]) -> Result<Vec<i64>>;
}

/// Everything request-scoped operations and workers share. Constructed once
/// at startup and cloned by `Arc`.
pub struct Engine<S> {
    pub(crate) store: Arc<S>,
    pub(crate) pool: Arc<NodePool>,
    pub(crate) vault: Arc<CryptoVault>,
    pub(crate) config: HosterConfig,
    pub(crate) providers: Arc<dyn ProviderFactory>,
    pub(crate) sink: Arc<dyn UsageSink>,
    pub(crate) resolver: Arc<dyn DnsResolver>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
            vault: Arc::clone(&self.vault),
            config: self.config.clone(),
            providers: Arc::clone(&self.providers),
            sink: Arc::clone(&self.sink),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(
        store: Arc<S>,
        pool: Arc<NodePool>,
        vault: Arc<CryptoVault>,
        config: HosterConfig,
        providers: Arc<dyn ProviderFactory>,
        sink: Arc<dyn UsageSink>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::validation("config", e.to_string()))?;
        Ok(Self {
            store,
            pool,
            vault,
            config,
            providers,
            sink,
            resolver,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &HosterConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Upsert the caller into the user table, returning the integer ID the
    /// rest of the API uses.
    pub async fn resolve_user(
        &self,
        reference_id: &str,
        email: &str,
        name: &str,
        plan_id: &str,
    ) -> Result<i64> {
        self.store
            .with_tx(|tx| Ok(tx.resolve_user(reference_id, email, name, plan_id)?))
            .await
    }

    /// Apply one legal status transition in its own transaction, appending
    /// the audit event. Concurrent conflicting transitions serialize here;
    /// the loser observes the winner's state and gets `InvalidTransition`.
    pub(crate) async fn transition_deployment(
        &self,
        deployment_id: i64,
        to: DeploymentStatus,
    ) -> Result<Deployment> {
        self.store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                if !deployment.status.can_transition_to(to) {
                    return Err(Error::InvalidTransition {
                        entity: "deployment",
                        from: deployment.status.to_string(),
                        to: to.to_string(),
                    });
                }
                deployment.status = to;
                if to == DeploymentStatus::Running {
                    deployment.error_message = None;
                }
                tx.update_deployment(&deployment)?;
                append_deployment_event(tx, deployment.id, &format!("deployment.{to}"), "")?;
                Ok(deployment)
            })
            .await
    }

    /// Drive a deployment to `failed`, recording the user-safe reason and a
    /// `container.error` event. No-op if the deployment is already terminal.
    pub(crate) async fn fail_deployment(&self, deployment_id: i64, reason: &str) {
        let reason = reason.to_string();
        let outcome: Result<()> = self
            .store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                if !deployment.status.can_transition_to(DeploymentStatus::Failed) {
                    return Ok(());
                }
                deployment.status = DeploymentStatus::Failed;
                deployment.error_message = Some(reason.clone());
                tx.update_deployment(&deployment)?;
                append_deployment_event(tx, deployment.id, "container.error", &reason)?;
                append_deployment_event(tx, deployment.id, "deployment.failed", &reason)?;
                Ok(())
            })
            .await;
        if let Err(err) = outcome {
            tracing::error!(deployment_id, %err, "failed to record deployment failure");
        }
    }

    /// Append a usage event for billing.
    pub(crate) async fn emit_usage(
        &self,
        user_id: i64,
        event_type: &str,
        resource_id: &str,
        resource_type: &str,
        quantity: f64,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let event_type = event_type.to_string();
        let resource_id = resource_id.to_string();
        let resource_type = resource_type.to_string();
        self.store
            .with_tx(move |tx| {
                let mut event = UsageEvent {
                    id: 0,
                    reference_id: id::new_ref(ResourceKind::Event),
                    user_id,
                    event_type,
                    resource_id,
                    resource_type,
                    quantity,
                    metadata,
                    timestamp: Utc::now(),
                    reported_at: None,
                };
                Ok(tx.append_usage_event(&mut event)?)
            })
            .await
    }

    /// Build the pool endpoint for a node, decrypting its SSH key when one
    /// is attached.
    pub(crate) async fn endpoint_for_node(&self, node: &Node) -> Result<NodeEndpoint> {
        let private_key = match node.ssh_key_id {
            Some(key_id) => {
                let key = self
                    .store
                    .with_tx(move |tx| Ok::<_, Error>(tx.ssh_key(key_id)?))
                    .await?;
                let opened = self.vault.open_string(&key.encrypted_private_key)?;
                Some(zeroize::Zeroizing::new(opened.to_string()))
            }
            None => None,
        };
        Ok(NodeEndpoint {
            node_ref: node.reference_id.clone(),
            host: node.ssh_host.clone(),
            ssh_port: node.ssh_port,
            ssh_user: node.ssh_user.clone(),
            socket_path: node.container_socket.clone(),
            private_key,
        })
    }

    /// Release pooled clients and tunnels. The daemon calls this once after
    /// the workers have stopped.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!("engine shut down");
    }
}

/// Append a lifecycle event inside an existing transaction.
pub(crate) fn append_deployment_event<T: StoreTx>(
    tx: &mut T,
    deployment_id: i64,
    event_type: &str,
    message: &str,
) -> Result<()> {
    let mut event = ContainerEvent {
        id: 0,
        deployment_id,
        event_type: event_type.to_string(),
        message: message.to_string(),
        created_at: Utc::now(),
    };
    tx.append_container_event(&mut event)?;
    Ok(())
}
