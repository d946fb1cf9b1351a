//! Cloud provision reconciliation.
//!
//! Each tick advances every active provision by at most one step:
//! `pending → creating → configuring → ready` on the create path,
//! `destroying → destroyed` on the teardown path. External identifiers are
//! persisted the moment the provider hands them out, so a process restart
//! resumes instead of re-creating.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hoster_cloud::{CloudProvider, InstanceRequest, InstanceStatus};
use hoster_core::id::{self, ResourceKind};
use hoster_core::resources::{Capacity, ResourceSpec};
use hoster_core::{Error, Result};
use hoster_runtime::ssh::{self, SshTarget};
use hoster_store::model::{CloudProvision, Node, NodeStatus, ProvisionStatus, SshKey};
use hoster_store::{Store, StoreTx};

use crate::engine::Engine;

/// No provider progress for this long during `creating` fails the provision.
const READINESS_STALL: chrono::Duration = chrono::Duration::minutes(5);
const SSH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_OVERALL_TIMEOUT: Duration = Duration::from_secs(120);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(300);

/// Installs the container runtime and reports its socket path on the last
/// output line.
const BOOTSTRAP_SCRIPT: &str = "set -e\n\
export DEBIAN_FRONTEND=noninteractive\n\
if ! command -v docker >/dev/null 2>&1; then\n\
  apt-get update -qq >/dev/null\n\
  apt-get install -y -qq docker.io >/dev/null\n\
fi\n\
systemctl enable --now docker >/dev/null 2>&1 || true\n\
echo /var/run/docker.sock\n";

/// Turns a fresh instance into a node that can run containers, reporting
/// the runtime's socket path. Swapped out in tests.
#[async_trait::async_trait]
pub trait Bootstrap: Send + Sync {
    async fn prepare(&self, host: &str, private_key: &str) -> Result<String>;
}

/// The production bootstrap: SSH in with the generated key and run the
/// install script, tolerating first-boot delays.
pub struct SshBootstrap {
    workdir: tempfile::TempDir,
}

impl SshBootstrap {
    pub fn new() -> Self {
        Self {
            workdir: tempfile::Builder::new()
                .prefix("hoster-provisioner-")
                .tempdir()
                .expect("temp dir for bootstrap keys"),
        }
    }
}

impl Default for SshBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Bootstrap for SshBootstrap {
    async fn prepare(&self, host: &str, private_key: &str) -> Result<String> {
        let key_file = ssh::write_key_file(self.workdir.path(), private_key)
            .map_err(|e| Error::unavailable("bootstrap key file", e))?;
        let target = SshTarget::new(host.to_string(), 22, "root", key_file.to_path_buf())
            .map_err(Error::internal)?;

        target
            .wait_ready(SSH_ATTEMPT_TIMEOUT, SSH_OVERALL_TIMEOUT)
            .await
            .map_err(|e| Error::unavailable("ssh session", e))?;

        let output = target
            .run(BOOTSTRAP_SCRIPT, BOOTSTRAP_TIMEOUT)
            .await
            .map_err(|e| Error::unavailable("bootstrap script", e))?;
        Ok(output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("/var/run/docker.sock")
            .trim()
            .to_string())
    }
}

pub struct ProvisionerWorker<S> {
    engine: Engine<S>,
    interval: Duration,
    bootstrap: Arc<dyn Bootstrap>,
}

impl<S: Store> ProvisionerWorker<S> {
    pub fn new(engine: Engine<S>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            bootstrap: Arc::new(SshBootstrap::new()),
        }
    }

    /// Swap the node bootstrap implementation. Test wiring.
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "provisioner worker running");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "provisioner tick failed");
                    }
                }
            }
        }
        debug!("provisioner worker stopped");
    }

    /// One reconciliation pass over every active provision.
    pub async fn tick(&self) -> Result<()> {
        let provisions = self.engine.store().list_active_provisions().await?;
        for provision in provisions {
            if let Err(err) = self.advance(&provision).await {
                if provision.status == ProvisionStatus::Destroying || err.is_retryable() {
                    // Destroys converge under retry; transient failures get
                    // the next tick.
                    warn!(
                        provision = %provision.reference_id,
                        status = %provision.status,
                        %err,
                        "step failed, will retry"
                    );
                } else {
                    self.mark_failed(provision.id, &err.user_message()).await;
                }
            }
        }
        Ok(())
    }

    async fn advance(&self, provision: &CloudProvision) -> Result<()> {
        match provision.status {
            ProvisionStatus::Pending => self.step_prepare_key(provision).await,
            ProvisionStatus::Creating => self.step_create_or_poll(provision).await,
            ProvisionStatus::Configuring => self.step_bootstrap(provision).await,
            ProvisionStatus::Destroying => self.step_destroy(provision).await,
            _ => Ok(()),
        }
    }

    /// `pending → creating`: mint a key pair for this provision and register
    /// the public half with the provider.
    async fn step_prepare_key(&self, provision: &CloudProvision) -> Result<()> {
        self.set_step(provision, "Generating SSH key").await?;

        let key_id = match provision.ssh_key_id {
            Some(key_id) => key_id,
            None => {
                let generated = self
                    .engine
                    .vault
                    .generate_ssh_key(&provision.reference_id)?;
                let creator_id = provision.creator_id;
                let name = format!("{}-bootstrap", provision.instance_name);
                let provision_id = provision.id;
                self.engine
                    .store()
                    .with_tx(move |tx| {
                        let mut key = SshKey {
                            id: 0,
                            reference_id: id::new_ref(ResourceKind::SshKey),
                            creator_id,
                            name,
                            public_key: generated.public_key.clone(),
                            fingerprint: generated.fingerprint.clone(),
                            encrypted_private_key: generated.encrypted_private_key.clone(),
                            created_at: Utc::now(),
                        };
                        tx.insert_ssh_key(&mut key)?;
                        let mut provision = tx.provision(provision_id)?;
                        provision.ssh_key_id = Some(key.id);
                        tx.update_provision(&provision)?;
                        Ok::<_, Error>(key.id)
                    })
                    .await?
            }
        };

        let provider = self.provider_for(provision).await?;
        let provider_key_id = match &provision.provider_key_id {
            Some(existing) => existing.clone(),
            None => {
                self.set_step(provision, "Registering SSH key").await?;
                let key = self
                    .engine
                    .store()
                    .with_tx(move |tx| Ok::<_, Error>(tx.ssh_key(key_id)?))
                    .await?;
                provider
                    .create_ssh_key(&provision.reference_id, &key.public_key)
                    .await?
            }
        };

        let provision_id = provision.id;
        self.engine
            .store()
            .with_tx(move |tx| {
                let mut provision = tx.provision(provision_id)?;
                transition(&mut provision, ProvisionStatus::Creating)?;
                provision.provider_key_id = Some(provider_key_id);
                provision.current_step = Some("Creating instance".to_string());
                tx.update_provision(&provision)?;
                Ok(())
            })
            .await
    }

    /// `creating`: create the instance if we have no provider ID yet,
    /// otherwise poll until it is running with a routable address.
    async fn step_create_or_poll(&self, provision: &CloudProvision) -> Result<()> {
        let provider = self.provider_for(provision).await?;

        let Some(instance_id) = provision.provider_instance_id.clone() else {
            let request = InstanceRequest {
                name: provision.instance_name.clone(),
                region: provision.region.clone(),
                size: provision.size.clone(),
                ssh_key_ids: provision.provider_key_id.iter().cloned().collect(),
            };
            let instance = provider.create_instance(&request).await?;
            info!(provision = %provision.reference_id, instance = %instance.id, "instance created");

            let provision_id = provision.id;
            return self
                .engine
                .store()
                .with_tx(move |tx| {
                    let mut provision = tx.provision(provision_id)?;
                    provision.provider_instance_id = Some(instance.id);
                    provision.public_ip = instance.public_ip;
                    provision.current_step = Some("Waiting for instance".to_string());
                    tx.update_provision(&provision)?;
                    Ok(())
                })
                .await;
        };

        let instance = provider.get_instance(&instance_id).await?;
        match (instance.status, instance.public_ip) {
            (InstanceStatus::Running, Some(public_ip)) => {
                let provision_id = provision.id;
                self.engine
                    .store()
                    .with_tx(move |tx| {
                        let mut provision = tx.provision(provision_id)?;
                        transition(&mut provision, ProvisionStatus::Configuring)?;
                        provision.public_ip = Some(public_ip);
                        provision.current_step = Some("Waiting for SSH".to_string());
                        tx.update_provision(&provision)?;
                        Ok(())
                    })
                    .await
            }
            _ => {
                if Utc::now() - provision.updated_at > READINESS_STALL {
                    self.mark_failed(
                        provision.id,
                        "instance never became ready at the provider",
                    )
                    .await;
                }
                Ok(())
            }
        }
    }

    /// `configuring → ready`: SSH in with the generated key, install the
    /// container runtime, and materialize the node row.
    async fn step_bootstrap(&self, provision: &CloudProvision) -> Result<()> {
        let Some(public_ip) = provision.public_ip.clone() else {
            self.mark_failed(provision.id, "no public address recorded").await;
            return Ok(());
        };
        let Some(key_id) = provision.ssh_key_id else {
            self.mark_failed(provision.id, "no bootstrap key recorded").await;
            return Ok(());
        };

        let key = self
            .engine
            .store()
            .with_tx(move |tx| Ok::<_, Error>(tx.ssh_key(key_id)?))
            .await?;
        let private_key = self.engine.vault.open_string(&key.encrypted_private_key)?;

        self.set_step(provision, "Installing container runtime").await?;
        let socket_path = match self.bootstrap.prepare(&public_ip, &private_key).await {
            Ok(socket_path) => socket_path,
            Err(err) => {
                // The bootstrap's own retry window already absorbed
                // first-boot delays; whatever is left is a real failure.
                self.mark_failed(provision.id, &format!("bootstrap failed: {err}")).await;
                return Ok(());
            }
        };

        self.set_step(provision, "Registering node").await?;
        let capacity = self.size_capacity(provision).await;
        let base_domain = self.engine.config().base_domain.clone();
        let provision_id = provision.id;
        let creator_id = provision.creator_id;
        let instance_name = provision.instance_name.clone();

        self.engine
            .store()
            .with_tx(move |tx| {
                let mut node = Node {
                    id: 0,
                    reference_id: id::new_ref(ResourceKind::Node),
                    creator_id,
                    name: instance_name,
                    ssh_host: public_ip.clone(),
                    ssh_port: 22,
                    ssh_user: "root".to_string(),
                    ssh_key_id: Some(key_id),
                    ssh_key_ref: String::new(),
                    container_socket: socket_path,
                    status: NodeStatus::Offline,
                    capabilities: ["standard".to_string()].into(),
                    capacity,
                    base_domain,
                    public_ips: public_ip.parse().map(|ip| vec![ip]).unwrap_or_default(),
                    provision_id: Some(provision_id),
                    last_health_check: None,
                    error_message: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                tx.insert_node(&mut node)?;
                let mut provision = tx.provision(provision_id)?;
                transition(&mut provision, ProvisionStatus::Ready)?;
                provision.node_id = Some(node.id);
                provision.current_step = Some("Ready".to_string());
                tx.update_provision(&provision)?;
                info!(node = %node.reference_id, "node registered from provision");
                Ok(())
            })
            .await
    }

    /// `destroying → destroyed`: tear down provider-side state. Never fails
    /// the provision; every error is retried until teardown converges.
    async fn step_destroy(&self, provision: &CloudProvision) -> Result<()> {
        let provider = self.provider_for(provision).await?;
        if let Some(instance_id) = &provision.provider_instance_id {
            provider.destroy_instance(instance_id).await?;
        }
        if let Some(provider_key_id) = &provision.provider_key_id {
            provider.delete_ssh_key(provider_key_id).await?;
        }

        let provision_id = provision.id;
        self.engine
            .store()
            .with_tx(move |tx| {
                let mut provision = tx.provision(provision_id)?;
                if let Some(node_id) = provision.node_id {
                    if let Ok(mut node) = tx.node(node_id) {
                        node.provision_id = None;
                        tx.update_node(&node)?;
                    }
                }
                transition(&mut provision, ProvisionStatus::Destroyed)?;
                provision.current_step = Some("Destroyed".to_string());
                tx.update_provision(&provision)?;
                Ok::<(), hoster_core::Error>(())
            })
            .await?;
        info!(provision = %provision.reference_id, "provision destroyed");
        Ok(())
    }

    async fn provider_for(&self, provision: &CloudProvision) -> Result<Arc<dyn CloudProvider>> {
        let credential_id = provision.credential_id;
        let credential = self
            .engine
            .store()
            .with_tx(move |tx| Ok::<_, Error>(tx.credential(credential_id)?))
            .await?;
        let payload = self.engine.vault.open_string(&credential.encrypted_payload)?;
        self.engine.providers.provider(&credential.provider, &payload)
    }

    /// Capacity for the requested size, best-effort via the provider's size
    /// catalog. Unknown sizes leave the node at zero capacity for the
    /// operator to correct.
    async fn size_capacity(&self, provision: &CloudProvision) -> Capacity {
        let provider = match self.provider_for(provision).await {
            Ok(provider) => provider,
            Err(_) => return Capacity::default(),
        };
        match provider.list_sizes(&provision.region).await {
            Ok(sizes) => sizes
                .into_iter()
                .find(|s| s.slug == provision.size)
                .map(|s| {
                    Capacity::new(ResourceSpec::new(
                        f64::from(s.vcpus),
                        s.memory_mb,
                        s.disk_gb * 1024,
                    ))
                })
                .unwrap_or_default(),
            Err(_) => Capacity::default(),
        }
    }

    /// Update `current_step` only when it changes, so `updated_at` keeps
    /// marking real progress.
    async fn set_step(&self, provision: &CloudProvision, step: &str) -> Result<()> {
        if provision.current_step.as_deref() == Some(step) {
            return Ok(());
        }
        let provision_id = provision.id;
        let step = step.to_string();
        self.engine
            .store()
            .with_tx(move |tx| {
                let mut provision = tx.provision(provision_id)?;
                provision.current_step = Some(step);
                tx.update_provision(&provision)?;
                Ok(())
            })
            .await
    }

    async fn mark_failed(&self, provision_id: i64, reason: &str) {
        let reason = reason.to_string();
        let outcome: Result<()> = self
            .engine
            .store()
            .with_tx(move |tx| {
                let mut provision = tx.provision(provision_id)?;
                if !provision.status.can_transition_to(ProvisionStatus::Failed) {
                    return Ok(());
                }
                provision.status = ProvisionStatus::Failed;
                provision.error_message = Some(reason);
                tx.update_provision(&provision)?;
                Ok(())
            })
            .await;
        if let Err(err) = outcome {
            error!(provision_id, %err, "failed to record provision failure");
        }
    }
}

fn transition(provision: &mut CloudProvision, to: ProvisionStatus) -> Result<()> {
    if !provision.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            entity: "provision",
            from: provision.status.to_string(),
            to: to.to_string(),
        });
    }
    provision.status = to;
    Ok(())
}
