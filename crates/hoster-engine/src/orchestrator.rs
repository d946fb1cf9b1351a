//! Side-effecting deployment lifecycle against a `ContainerClient`.
//!
//! Config files → network → images → containers → start, with best-effort
//! cleanup when a start fails partway. The reverse direction stops and
//! removes; named volumes survive removal unless explicitly deleted.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use hoster_core::{Error, Result};
use hoster_runtime::client::{ContainerClient, ContainerSpec};
use hoster_store::model::{ConfigFileSpec, Deployment, DeploymentContainer, Template};

use crate::compose::{self, ComposeService};

const PULL_OVERALL_TIMEOUT: Duration = Duration::from_secs(600);
const STOP_GRACE: Duration = Duration::from_secs(30);
const PULL_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// Label stamped on every resource we create, so stray resources are
/// attributable.
const MANAGED_LABEL: &str = "hoster.managed";

pub struct Orchestrator {
    config_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn network_name(deployment: &Deployment) -> String {
        format!("hoster_{}", deployment.reference_id)
    }

    fn deployment_dir(&self, deployment: &Deployment) -> PathBuf {
        self.config_dir.join(&deployment.reference_id)
    }

    fn labels(deployment: &Deployment) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (
                "hoster.deployment".to_string(),
                deployment.reference_id.clone(),
            ),
        ])
    }

    /// Run the start sub-protocol. On success the returned handles are ready
    /// to persist; on error the deployment's containers from this attempt
    /// are already cleaned up as far as possible.
    pub async fn start_deployment(
        &self,
        client: &dyn ContainerClient,
        deployment: &Deployment,
        template: &Template,
    ) -> Result<Vec<DeploymentContainer>> {
        // Variable values: template defaults under the deployment's own.
        let mut values: BTreeMap<String, String> = template.default_variables();
        values.extend(deployment.variables.clone());
        let required = template.required_variables().map(ToString::to_string).collect();

        let compose_text =
            compose::substitute_variables(&template.compose_spec, &values, &required)?;
        let services = compose::parse_services(&compose_text)?;

        self.materialize_config_files(deployment, &template.config_files, &values, &required)
            .await?;

        // A restart after stop leaves the previous containers behind; free
        // their names before creating the new set.
        for stale in &deployment.containers {
            if let Err(err) = client.remove_container(&stale.container_id, true).await {
                warn!(container = %stale.container_id, %err, "stale container removal failed");
            }
        }

        let network = Self::network_name(deployment);
        client
            .create_network(&network, &Self::labels(deployment))
            .await?;

        for service in &services {
            pull_with_retry(client, &service.image).await?;
        }

        let config_mount = format!(
            "{}:/config:ro",
            self.deployment_dir(deployment).display()
        );

        let mut created: Vec<DeploymentContainer> = Vec::with_capacity(services.len());
        let mut start_error: Option<Error> = None;

        for (index, service) in services.iter().enumerate() {
            let spec = self.container_spec(deployment, service, index == 0, &network, &config_mount);
            let container_id = match client.create_container(&spec).await {
                Ok(id) => id,
                Err(err) => {
                    start_error = Some(err.into());
                    break;
                }
            };
            created.push(DeploymentContainer {
                service_name: service.name.clone(),
                container_id,
                status: "created".to_string(),
            });

            for volume in &service.volumes {
                if let Some(name) = compose::named_volume_source(volume) {
                    client
                        .create_volume(
                            &format!("{}_{name}", deployment.reference_id),
                            &Self::labels(deployment),
                        )
                        .await?;
                }
            }
        }

        if start_error.is_none() {
            for container in &mut created {
                match client.start_container(&container.container_id).await {
                    Ok(()) => container.status = "running".to_string(),
                    Err(err) => {
                        start_error = Some(err.into());
                        break;
                    }
                }
            }
        }

        if let Some(err) = start_error {
            warn!(
                deployment = %deployment.reference_id,
                %err,
                "start failed, cleaning up partial containers"
            );
            self.cleanup_partial(client, &created).await;
            return Err(err);
        }

        info!(
            deployment = %deployment.reference_id,
            containers = created.len(),
            "deployment started"
        );
        Ok(created)
    }

    fn container_spec(
        &self,
        deployment: &Deployment,
        service: &ComposeService,
        is_primary: bool,
        network: &str,
        config_mount: &str,
    ) -> ContainerSpec {
        let mut binds = vec![config_mount.to_string()];
        for volume in &service.volumes {
            if compose::named_volume_source(volume).is_some() {
                binds.push(format!("{}_{volume}", deployment.reference_id));
            }
        }

        let mut port_bindings = Vec::new();
        if is_primary {
            if let Some(proxy_port) = deployment.proxy_port {
                port_bindings.push((proxy_port, service.container_port.unwrap_or(80)));
            }
        }

        ContainerSpec {
            name: format!("{}_{}", deployment.reference_id, service.name),
            image: service.image.clone(),
            env: service.environment.clone(),
            labels: Self::labels(deployment),
            network: Some(network.to_string()),
            network_alias: Some(service.name.clone()),
            binds,
            port_bindings,
            command: service.command.clone(),
            memory_limit_bytes: (deployment.resources.memory_mb > 0)
                .then(|| (deployment.resources.memory_mb as i64) << 20),
            nano_cpus: (deployment.resources.cpu_cores > 0.0)
                .then(|| (deployment.resources.cpu_cores * 1e9) as i64),
        }
    }

    /// Best-effort teardown of containers from a failed start attempt, so a
    /// retry does not trip over leftover names.
    async fn cleanup_partial(&self, client: &dyn ContainerClient, created: &[DeploymentContainer]) {
        for container in created {
            if container.status == "running" {
                if let Err(err) = client
                    .stop_container(&container.container_id, STOP_GRACE)
                    .await
                {
                    warn!(container = %container.container_id, %err, "cleanup stop failed");
                }
            }
            if let Err(err) = client.remove_container(&container.container_id, true).await {
                warn!(container = %container.container_id, %err, "cleanup remove failed");
            }
        }
    }

    /// Stop every container with the 30-second grace period. Errors are
    /// collected per service and reported, never short-circuiting.
    pub async fn stop_deployment(
        &self,
        client: &dyn ContainerClient,
        deployment: &Deployment,
    ) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for container in &deployment.containers {
            if let Err(err) = client
                .stop_container(&container.container_id, STOP_GRACE)
                .await
            {
                warn!(
                    deployment = %deployment.reference_id,
                    service = %container.service_name,
                    %err,
                    "stop failed"
                );
                failures.push((container.service_name.clone(), err.into()));
            }
        }
        failures
    }

    /// Remove containers, network, and config directory. Named volumes are
    /// preserved; deleting them is a separate, explicit operation.
    pub async fn remove_deployment(
        &self,
        client: &dyn ContainerClient,
        deployment: &Deployment,
    ) -> Result<()> {
        let _ = self.stop_deployment(client, deployment).await;
        for container in &deployment.containers {
            client.remove_container(&container.container_id, true).await?;
        }
        client.remove_network(&Self::network_name(deployment)).await?;

        let dir = self.deployment_dir(deployment);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::internal(err)),
        }
        info!(deployment = %deployment.reference_id, "deployment removed");
        Ok(())
    }

    /// Delete the named volumes belonging to a deployment. Separate from
    /// removal by design.
    pub async fn remove_volumes(
        &self,
        client: &dyn ContainerClient,
        deployment: &Deployment,
        template: &Template,
    ) -> Result<()> {
        let services = compose::parse_services(&template.compose_spec).unwrap_or_default();
        for service in services {
            for volume in &service.volumes {
                if let Some(name) = compose::named_volume_source(volume) {
                    client
                        .remove_volume(&format!("{}_{name}", deployment.reference_id))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn materialize_config_files(
        &self,
        deployment: &Deployment,
        files: &[ConfigFileSpec],
        values: &BTreeMap<String, String>,
        required: &std::collections::BTreeSet<String>,
    ) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = self.deployment_dir(deployment);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(Error::internal)?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(Error::internal)?;

        for file in files {
            let relative = sanitize_relative_path(&file.path)?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::internal)?;
            }
            let content = compose::substitute_variables(&file.content, values, required)?;
            tokio::fs::write(&target, content).await.map_err(Error::internal)?;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(file.mode))
                .await
                .map_err(Error::internal)?;
        }
        Ok(())
    }
}

/// Reject absolute paths and parent traversal in config-file paths.
fn sanitize_relative_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let escapes = p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if path.is_empty() || escapes {
        return Err(Error::validation(
            "config_files",
            format!("illegal path {path:?}"),
        ));
    }
    Ok(p)
}

/// Pull with 3 retries and exponential backoff for transient failures;
/// permanent failures (missing image, auth) surface immediately.
async fn pull_with_retry(client: &dyn ContainerClient, image: &str) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..PULL_BACKOFF_SECS.len() {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(PULL_BACKOFF_SECS[attempt - 1])).await;
        }
        match timeout(PULL_OVERALL_TIMEOUT, client.pull_image(image)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) if !err.is_transient() => return Err(err.into()),
            Ok(Err(err)) => {
                warn!(image, attempt, %err, "transient pull failure");
                last_err = Some(Error::from(err));
            }
            Err(_) => {
                last_err = Some(Error::unavailable(
                    format!("pull {image}"),
                    std::io::Error::other("pull timed out"),
                ));
            }
        }
    }
    Err(last_err.expect("loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_sanitizer_blocks_escape_attempts() {
        assert!(sanitize_relative_path("nginx/nginx.conf").is_ok());
        assert!(sanitize_relative_path("app.env").is_ok());
        assert!(sanitize_relative_path("/etc/passwd").is_err());
        assert!(sanitize_relative_path("../outside").is_err());
        assert!(sanitize_relative_path("a/../../b").is_err());
        assert!(sanitize_relative_path("").is_err());
    }
}
