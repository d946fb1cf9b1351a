//! Deployment lifecycle intents: create, start, stop, delete, domains,
//! logs, and stats.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::warn;

use hoster_core::auth::AuthContext;
use hoster_core::id::{self, ResourceKind};
use hoster_core::{Error, Result};
use hoster_runtime::client::{ContainerClient, ContainerStats, LogChunk, LogOptions};
use hoster_store::model::{
    ContainerEvent, Deployment, DeploymentDomain, DeploymentStatus, DomainKind, Node, Template,
    VariableType,
};
use hoster_store::{Store, StoreTx};

use crate::authz;
use crate::domains;
use crate::engine::{append_deployment_event, Engine};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub template_ref: String,
    pub name: String,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct DeploymentLogs {
    pub service: String,
    pub chunks: Vec<LogChunk>,
}

#[derive(Debug)]
pub struct DeploymentStats {
    pub service: String,
    pub stats: ContainerStats,
}

impl<S: Store> Engine<S> {
    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(&self.config.config_dir)
    }

    pub async fn create_deployment(
        &self,
        auth: &AuthContext,
        new: NewDeployment,
    ) -> Result<Deployment> {
        if !auth.authenticated {
            return Err(Error::forbidden("create deployments"));
        }
        if !Deployment::name_is_valid(&new.name) {
            return Err(Error::validation("name", "must match ^[a-z][a-z0-9-]{0,62}$"));
        }

        let auth = auth.clone();
        let base_domain = self.config.base_domain.clone();
        let max_deployments = auth.plan_limits.max_deployments as usize;

        self.store
            .with_tx(move |tx| {
                let template = tx.template_by_ref(&new.template_ref)?;
                if !authz::can_view_template(&auth, &template) {
                    return Err(Error::not_found("template", new.template_ref.clone()));
                }
                validate_variables(&template, &new.variables)?;

                let live: Vec<_> = tx
                    .deployments_by_customer(auth.user_id)?
                    .into_iter()
                    .filter(|d| d.status != DeploymentStatus::Deleted)
                    .collect();
                if live.len() >= max_deployments {
                    return Err(Error::forbidden(format!(
                        "run more than {max_deployments} deployments on this plan"
                    )));
                }
                let reserved = live
                    .iter()
                    .fold(template.resources, |acc, d| acc.plus(&d.resources));
                let limits = &auth.plan_limits;
                if reserved.cpu_cores > limits.max_cpu_cores
                    || reserved.memory_mb > limits.max_memory_mb
                {
                    return Err(Error::forbidden(format!(
                        "reserve more than {} cores / {} MB on this plan",
                        limits.max_cpu_cores, limits.max_memory_mb
                    )));
                }

                let reference_id = id::new_ref(ResourceKind::Deployment);
                let suffix = reference_id
                    .rsplit('_')
                    .next()
                    .expect("reference ids contain an underscore");
                let auto_domain = format!("{}-{suffix}.{base_domain}", new.name);

                let mut deployment = Deployment {
                    id: 0,
                    reference_id,
                    customer_id: auth.user_id,
                    template_id: template.id,
                    template_ref: String::new(),
                    template_version: template.version.clone(),
                    name: new.name.clone(),
                    variables: new.variables.clone(),
                    domains: vec![DeploymentDomain::auto(auto_domain, Utc::now())],
                    containers: vec![],
                    node_id: None,
                    proxy_port: None,
                    resources: template.resources,
                    status: DeploymentStatus::Pending,
                    error_message: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                tx.insert_deployment(&mut deployment)?;
                append_deployment_event(tx, deployment.id, "deployment.created", "")?;
                Ok(deployment)
            })
            .await
    }

    /// Drive a deployment to `running`, traversing the intermediate states
    /// one persisted transition at a time. Any failure past scheduling
    /// drives the deployment to `failed` with a user-safe reason.
    pub async fn start_deployment(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Deployment> {
        let (deployment, template) = self.deployment_for_manage(auth, reference_id).await?;

        if deployment.status.start_path().is_none() {
            return Err(Error::InvalidTransition {
                entity: "deployment",
                from: deployment.status.to_string(),
                to: DeploymentStatus::Starting.to_string(),
            });
        }

        // Restart case: try the previous node first.
        let preferred = deployment.node_id;
        let selection = match self.schedule(&template, &deployment, preferred).await {
            Ok(selection) => selection,
            Err(err) => {
                self.fail_deployment(deployment.id, &err.user_message()).await;
                return Err(err);
            }
        };

        // A concurrent request racing us loses here with InvalidTransition
        // and must not fail the deployment under the winner.
        let deployment = self
            .transition_deployment(deployment.id, DeploymentStatus::Starting)
            .await?;

        match self
            .orchestrator()
            .start_deployment(selection.client.as_ref(), &deployment, &template)
            .await
        {
            Ok(containers) => {
                let deployment_id = deployment.id;
                let running = self
                    .store
                    .with_tx(move |tx| {
                        let mut deployment = tx.deployment(deployment_id)?;
                        if !deployment
                            .status
                            .can_transition_to(DeploymentStatus::Running)
                        {
                            return Err(Error::InvalidTransition {
                                entity: "deployment",
                                from: deployment.status.to_string(),
                                to: DeploymentStatus::Running.to_string(),
                            });
                        }
                        deployment.status = DeploymentStatus::Running;
                        deployment.containers = containers;
                        deployment.error_message = None;
                        tx.update_deployment(&deployment)?;
                        append_deployment_event(tx, deployment.id, "deployment.running", "")?;
                        Ok(deployment)
                    })
                    .await?;

                self.emit_usage(
                    running.customer_id,
                    "deployment.start",
                    &running.reference_id,
                    "deployment",
                    1.0,
                    BTreeMap::new(),
                )
                .await?;
                Ok(running)
            }
            Err(err) => {
                self.fail_deployment(deployment.id, &err.user_message()).await;
                Err(err)
            }
        }
    }

    /// Stop a running deployment. Per-container stop errors are collected
    /// and reported without blocking the remaining containers.
    pub async fn stop_deployment(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Deployment> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        if !deployment.status.can_stop() {
            return Err(Error::InvalidTransition {
                entity: "deployment",
                from: deployment.status.to_string(),
                to: DeploymentStatus::Stopping.to_string(),
            });
        }

        let running_seconds = self.seconds_since_running(deployment.id).await;
        let deployment = self
            .transition_deployment(deployment.id, DeploymentStatus::Stopping)
            .await?;

        match self.node_client(&deployment).await {
            Ok((client, _)) => {
                let failures = self
                    .orchestrator()
                    .stop_deployment(client.as_ref(), &deployment)
                    .await;
                for (service, err) in &failures {
                    warn!(deployment = %deployment.reference_id, service, %err, "container stop error");
                }
            }
            Err(err) => {
                self.fail_deployment(deployment.id, &err.user_message()).await;
                return Err(err);
            }
        }

        let deployment_id = deployment.id;
        let stopped = self
            .store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                if !deployment
                    .status
                    .can_transition_to(DeploymentStatus::Stopped)
                {
                    return Err(Error::InvalidTransition {
                        entity: "deployment",
                        from: deployment.status.to_string(),
                        to: DeploymentStatus::Stopped.to_string(),
                    });
                }
                deployment.status = DeploymentStatus::Stopped;
                for container in &mut deployment.containers {
                    container.status = "exited".to_string();
                }
                tx.update_deployment(&deployment)?;
                append_deployment_event(tx, deployment.id, "deployment.stopped", "")?;
                Ok(deployment)
            })
            .await?;

        self.emit_usage(
            stopped.customer_id,
            "deployment.stop",
            &stopped.reference_id,
            "deployment",
            running_seconds,
            BTreeMap::new(),
        )
        .await?;
        Ok(stopped)
    }

    /// Soft-delete. Running deployments must be stopped first; container
    /// and network teardown is best-effort.
    pub async fn delete_deployment(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Deployment> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        if !deployment
            .status
            .can_transition_to(DeploymentStatus::Deleted)
        {
            return Err(Error::InvalidTransition {
                entity: "deployment",
                from: deployment.status.to_string(),
                to: DeploymentStatus::Deleted.to_string(),
            });
        }

        if !deployment.containers.is_empty() {
            match self.node_client(&deployment).await {
                Ok((client, _)) => {
                    if let Err(err) = self
                        .orchestrator()
                        .remove_deployment(client.as_ref(), &deployment)
                        .await
                    {
                        warn!(deployment = %deployment.reference_id, %err, "best-effort teardown failed");
                    }
                }
                Err(err) => {
                    warn!(deployment = %deployment.reference_id, %err, "node unreachable during delete");
                }
            }
        }

        self.transition_deployment(deployment.id, DeploymentStatus::Deleted)
            .await
    }

    pub async fn get_deployment(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Deployment> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        Ok(deployment)
    }

    pub async fn list_deployments(&self, auth: &AuthContext) -> Result<Vec<Deployment>> {
        if !auth.authenticated {
            return Err(Error::forbidden("list deployments"));
        }
        let user_id = auth.user_id;
        self.store
            .with_tx(move |tx| {
                Ok(tx
                    .deployments_by_customer(user_id)?
                    .into_iter()
                    .filter(|d| d.status != DeploymentStatus::Deleted)
                    .collect())
            })
            .await
    }

    /// Attach a custom domain (unverified) and return the ordered DNS setups
    /// the customer may use.
    pub async fn add_domain(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        hostname: &str,
    ) -> Result<Vec<String>> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        if !hostname_is_valid(&hostname) {
            return Err(Error::validation("hostname", "not a valid dns name"));
        }

        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let deployment_id = deployment.id;
        let hostname_for_tx = hostname.clone();

        self.store
            .with_tx(move |tx| {
                match tx.deployment_by_domain(&hostname_for_tx) {
                    Ok(_) => {
                        return Err(Error::conflict(format!(
                            "domain {hostname_for_tx} is already attached to a deployment"
                        )));
                    }
                    Err(hoster_store::StoreError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
                let mut deployment = tx.deployment(deployment_id)?;
                deployment
                    .domains
                    .push(DeploymentDomain::custom(hostname_for_tx.clone()));
                tx.update_deployment(&deployment)?;
                Ok(())
            })
            .await?;

        let node_ip = self.first_node_ip(&deployment).await;
        let auto = deployment.auto_domain().unwrap_or_default().to_string();
        Ok(domains::instructions(&hostname, &auto, node_ip))
    }

    pub async fn remove_domain(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        hostname: &str,
    ) -> Result<()> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let deployment_id = deployment.id;
        let hostname = hostname.to_ascii_lowercase();
        self.store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                let Some(domain) = deployment.domain(&hostname) else {
                    return Err(Error::not_found("domain", hostname.clone()));
                };
                if domain.kind == DomainKind::Auto {
                    return Err(Error::validation(
                        "hostname",
                        "the auto-domain cannot be removed",
                    ));
                }
                deployment.domains.retain(|d| d.hostname != hostname);
                tx.update_deployment(&deployment)?;
                Ok(())
            })
            .await
    }

    /// On-demand verification of one custom domain.
    pub async fn verify_domain(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        hostname: &str,
    ) -> Result<domains::Verdict> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let hostname = hostname.to_ascii_lowercase();
        let Some(domain) = deployment.domain(&hostname) else {
            return Err(Error::not_found("domain", hostname));
        };
        if domain.kind == DomainKind::Auto {
            return Err(Error::validation(
                "hostname",
                "the auto-domain needs no verification",
            ));
        }

        let auto = deployment.auto_domain().unwrap_or_default().to_string();
        let expected = self.expected_ips(&deployment).await;
        let verdict = match self.resolver.resolve(&hostname).await {
            Ok(records) => domains::verify(&records, &auto, &expected),
            Err(err) => domains::Verdict {
                verified: false,
                method: None,
                error: Some(err.user_message()),
            },
        };

        self.record_verdict(deployment.id, &hostname, &verdict).await?;
        Ok(verdict)
    }

    pub async fn deployment_logs(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        service: &str,
        opts: LogOptions,
    ) -> Result<DeploymentLogs> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let container = deployment
            .containers
            .iter()
            .find(|c| c.service_name == service)
            .ok_or_else(|| Error::not_found("service", service))?;

        let (client, _) = self.node_client(&deployment).await?;
        let mut stream = client.container_logs(&container.container_id, &opts).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(DeploymentLogs {
            service: service.to_string(),
            chunks,
        })
    }

    pub async fn deployment_stats(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<Vec<DeploymentStats>> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let (client, _) = self.node_client(&deployment).await?;
        let mut out = Vec::with_capacity(deployment.containers.len());
        for container in &deployment.containers {
            let stats = client.container_stats(&container.container_id).await?;
            out.push(DeploymentStats {
                service: container.service_name.clone(),
                stats,
            });
        }
        Ok(out)
    }

    /// The audit trail, newest first.
    pub async fn deployment_events(
        &self,
        auth: &AuthContext,
        reference_id: &str,
        limit: usize,
    ) -> Result<Vec<ContainerEvent>> {
        let (deployment, _) = self.deployment_for_manage(auth, reference_id).await?;
        let deployment_id = deployment.id;
        self.store
            .with_tx(move |tx| Ok(tx.container_events(deployment_id, limit)?))
            .await
    }

    // Shared plumbing

    pub(crate) async fn deployment_for_manage(
        &self,
        auth: &AuthContext,
        reference_id: &str,
    ) -> Result<(Deployment, Template)> {
        let auth = auth.clone();
        let reference_id = reference_id.to_string();
        self.store
            .with_tx(move |tx| {
                let deployment = tx.deployment_by_ref(&reference_id)?;
                if !authz::can_manage_deployment(&auth, &deployment)
                    || deployment.status == DeploymentStatus::Deleted
                {
                    return Err(Error::not_found("deployment", reference_id));
                }
                let template = tx.template(deployment.template_id)?;
                Ok((deployment, template))
            })
            .await
    }

    pub(crate) async fn node_client(
        &self,
        deployment: &Deployment,
    ) -> Result<(Arc<dyn ContainerClient>, Node)> {
        let node_id = deployment.node_id.ok_or_else(|| {
            Error::validation("deployment", "not scheduled to any node")
        })?;
        let node = self
            .store
            .with_tx(move |tx| Ok::<_, Error>(tx.node(node_id)?))
            .await?;
        let endpoint = self.endpoint_for_node(&node).await?;
        let (client, _) = self.pool.client_for(&endpoint).await?;
        Ok((client, node))
    }

    /// IPs a correctly configured A record may point at.
    pub(crate) async fn expected_ips(&self, deployment: &Deployment) -> Vec<std::net::Ipv4Addr> {
        let Some(node_id) = deployment.node_id else {
            return Vec::new();
        };
        let node = self.store.with_tx(move |tx| Ok::<_, Error>(tx.node(node_id)?)).await;
        match node {
            Ok(node) if !node.public_ips.is_empty() => node.public_ips,
            Ok(node) => node.ssh_host.parse().map(|ip| vec![ip]).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn first_node_ip(&self, deployment: &Deployment) -> Option<std::net::Ipv4Addr> {
        self.expected_ips(deployment).await.into_iter().next()
    }

    /// Persist a verification verdict onto the domain entry, emitting the
    /// audit event when a previously verified domain drops to failed.
    pub(crate) async fn record_verdict(
        &self,
        deployment_id: i64,
        hostname: &str,
        verdict: &domains::Verdict,
    ) -> Result<()> {
        let hostname = hostname.to_string();
        let verdict = verdict.clone();
        self.store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                let Some(domain) = deployment.domain_mut(&hostname) else {
                    return Ok(());
                };
                let dropped = domains::apply_verdict(domain, &verdict, Utc::now());
                tx.update_deployment(&deployment)?;
                if dropped {
                    append_deployment_event(
                        tx,
                        deployment_id,
                        "container.domain_unverified",
                        &hostname,
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Seconds since the deployment last entered `running`, for the stop
    /// usage event. Falls back to zero when no running event is on record.
    async fn seconds_since_running(&self, deployment_id: i64) -> f64 {
        let events: Result<Vec<ContainerEvent>> = self
            .store
            .with_tx(move |tx| Ok(tx.container_events(deployment_id, 200)?))
            .await;
        let Ok(events) = events else { return 0.0 };
        events
            .iter()
            .find(|e| e.event_type == "deployment.running")
            .map(|e| (Utc::now() - e.created_at).num_seconds().max(0) as f64)
            .unwrap_or(0.0)
    }
}

fn hostname_is_valid(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.contains('.')
        && !hostname.starts_with('.')
        && !hostname.contains("..")
        && hostname
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        && hostname
            .split('.')
            .all(|label| !label.is_empty() && !label.starts_with('-') && !label.ends_with('-'))
}

fn validate_variables(template: &Template, provided: &BTreeMap<String, String>) -> Result<()> {
    for (name, value) in provided {
        let Some(declared) = template.variables.iter().find(|v| &v.name == name) else {
            return Err(Error::validation(
                "variables",
                format!("{name} is not declared by the template"),
            ));
        };
        match declared.kind {
            VariableType::Integer => {
                if value.parse::<i64>().is_err() {
                    return Err(Error::validation(
                        "variables",
                        format!("{name} must be an integer"),
                    ));
                }
            }
            VariableType::Boolean => {
                if !matches!(value.as_str(), "true" | "false") {
                    return Err(Error::validation(
                        "variables",
                        format!("{name} must be true or false"),
                    ));
                }
            }
            VariableType::String | VariableType::Password => {}
        }
    }
    Ok(())
}
