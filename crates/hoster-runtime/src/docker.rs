//! `ContainerClient` over a Docker socket via bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use bollard::volume::CreateVolumeOptions;
use chrono::DateTime;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use crate::client::{
    ContainerClient, ContainerSpec, ContainerState, ContainerStats, ContainerSummary, LogChunk,
    LogOptions, StdStream,
};
use crate::error::{Result, RuntimeError};

const API_TIMEOUT_SECS: u64 = 120;

/// Docker-backed client. One instance per node, shared by everything that
/// touches the node; bollard's client is internally reference-counted and
/// safe to use concurrently.
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect over a unix socket path (`/var/run/docker.sock`, or a locally
    /// forwarded one for remote nodes).
    pub fn connect_unix(socket_path: &str) -> Result<Self> {
        let endpoint = format!("unix://{socket_path}");
        let docker =
            Docker::connect_with_unix(&endpoint, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    /// Connect using the environment's default socket.
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

fn classify_pull_error(image: &str, err: bollard::errors::Error) -> RuntimeError {
    match &err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::ImageNotFound(image.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            ..
        } => RuntimeError::AuthFailure(image.to_string()),
        _ => err.into(),
    }
}

/// The daemon reports pull-level failures inside the progress stream rather
/// than as transport errors; "not found" and "unauthorized" have to be fished
/// out of the message text.
fn classify_pull_message(image: &str, message: &str) -> RuntimeError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("manifest unknown") {
        RuntimeError::ImageNotFound(image.to_string())
    } else if lower.contains("unauthorized") || lower.contains("authentication") {
        RuntimeError::AuthFailure(image.to_string())
    } else {
        RuntimeError::Api {
            status: 500,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ContainerClient for DockerClient {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| classify_pull_error(image, e))?;
            if let Some(status) = info.status {
                debug!(image, %status, "pull progress");
            }
            if let Some(message) = info.error {
                return Err(classify_pull_message(image, &message));
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(err) if Self::is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (host_port, container_port) in &spec.port_bindings {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            memory: spec.memory_limit_bytes,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| {
            let endpoint = EndpointSettings {
                aliases: spec.network_alias.clone().map(|a| vec![a]),
                ..Default::default()
            };
            bollard::container::NetworkingConfig {
                endpoints_config: HashMap::from([(network.clone(), endpoint)]),
            }
        });

        let config = Config {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: Some(spec.labels.clone()),
            cmd: spec.command.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| {
                if Self::is_not_found(&err) {
                    RuntimeError::ContainerNotFound(id.to_string())
                } else {
                    err.into()
                }
            })
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        // The daemon kills the container itself once the grace period lapses.
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) if Self::is_not_found(&err) => {
                Err(RuntimeError::ContainerNotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone is the outcome we wanted.
            Err(err) if Self::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| {
                if Self::is_not_found(&err) {
                    RuntimeError::ContainerNotFound(id.to_string())
                } else {
                    RuntimeError::from(err)
                }
            })?;
        let state = details.state.unwrap_or_default();
        Ok(ContainerState {
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            health: state.health.and_then(|h| h.status).map(|s| s.to_string()),
            started_at: state
                .started_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        })
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn container_logs(
        &self,
        id: &str,
        opts: &LogOptions,
    ) -> Result<BoxStream<'static, Result<LogChunk>>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: opts.timestamps,
            tail: opts.tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            since: opts.since.map_or(0, |t| t.timestamp()),
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(id, Some(options))
            .map_ok(|output| match output {
                LogOutput::StdErr { message } => LogChunk {
                    stream: StdStream::Stderr,
                    message,
                },
                LogOutput::StdOut { message }
                | LogOutput::StdIn { message }
                | LogOutput::Console { message } => LogChunk {
                    stream: StdStream::Stdout,
                    message,
                },
            })
            .map_err(RuntimeError::from);
        Ok(stream.boxed())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Connection("empty stats stream".to_string()))??;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_percent = if system_delta > 0.0 && cpu_delta >= 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(0);
        let memory_percent = if memory_limit > 0 {
            memory_usage as f64 / memory_limit as f64 * 100.0
        } else {
            0.0
        };

        let (net_rx, net_tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                    match entry.op.as_str() {
                        "read" | "Read" => (read + entry.value, write),
                        "write" | "Write" => (read, write + entry.value),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            cpu_percent,
            memory_usage_bytes: memory_usage,
            memory_limit_bytes: memory_limit,
            memory_percent,
            net_rx_bytes: net_rx,
            net_tx_bytes: net_tx,
            block_read_bytes: block_read,
            block_write_bytes: block_write,
            pids: stats.pids_stats.current.unwrap_or(0),
        })
    }

    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(existing) => {
                // Reuse only a network we created; anything else is a clash.
                let existing_labels = existing.labels.unwrap_or_default();
                if labels
                    .iter()
                    .all(|(k, v)| existing_labels.get(k) == Some(v))
                {
                    return Ok(());
                }
                return Err(RuntimeError::Api {
                    status: 409,
                    message: format!("network {name} exists with foreign labels"),
                });
            }
            Err(err) if Self::is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(err) if Self::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self.docker.remove_volume(name, None).await {
            Ok(()) => Ok(()),
            Err(err) if Self::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
