//! Scriptable in-memory `ContainerClient` for tests and dev mode.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;

use crate::client::{
    ContainerClient, ContainerSpec, ContainerState, ContainerStats, ContainerSummary, LogChunk,
    LogOptions, StdStream,
};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub state: String,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    containers: BTreeMap<String, MockContainer>,
    networks: BTreeMap<String, HashMap<String, String>>,
    volumes: BTreeSet<String>,
    pulled: BTreeSet<String>,
    missing_images: BTreeSet<String>,
    auth_failing_images: BTreeSet<String>,
    /// Image → remaining transient failures before a pull succeeds.
    flaky_pulls: BTreeMap<String, u32>,
    fail_ping: bool,
    /// Container names whose start call fails.
    fail_start: BTreeSet<String>,
    logs: BTreeMap<String, Vec<LogChunk>>,
    ops: Vec<String>,
}

/// Every operation is recorded in order, so tests can assert on protocol
/// (pull before create, create before start, cleanup after failure).
#[derive(Debug, Default)]
pub struct MockContainerClient {
    inner: Mutex<Inner>,
}

impl MockContainerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.inner.lock().fail_ping = fail;
    }

    /// Pulls of `image` fail permanently with `ImageNotFound`.
    pub fn set_missing_image(&self, image: &str) {
        self.inner.lock().missing_images.insert(image.to_string());
    }

    /// Pulls of `image` fail permanently with `AuthFailure`.
    pub fn set_auth_failure(&self, image: &str) {
        self.inner
            .lock()
            .auth_failing_images
            .insert(image.to_string());
    }

    /// The next `failures` pulls of `image` fail transiently, then succeed.
    pub fn set_flaky_pull(&self, image: &str, failures: u32) {
        self.inner.lock().flaky_pulls.insert(image.to_string(), failures);
    }

    /// Starting a container with this name fails.
    pub fn set_fail_start(&self, container_name: &str) {
        self.inner.lock().fail_start.insert(container_name.to_string());
    }

    pub fn set_logs(&self, container_id: &str, chunks: Vec<(StdStream, &str)>) {
        let chunks = chunks
            .into_iter()
            .map(|(stream, line)| LogChunk {
                stream,
                message: Bytes::copy_from_slice(line.as_bytes()),
            })
            .collect();
        self.inner.lock().logs.insert(container_id.to_string(), chunks);
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.inner.lock().containers.values().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.inner.lock().networks.keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<String> {
        self.inner.lock().ops.clone()
    }

    fn record(&self, op: String) {
        self.inner.lock().ops.push(op);
    }
}

#[async_trait]
impl ContainerClient for MockContainerClient {
    async fn ping(&self) -> Result<()> {
        if self.inner.lock().fail_ping {
            return Err(RuntimeError::Connection("mock ping failure".to_string()));
        }
        self.record("ping".to_string());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("pull {image}"));
        if inner.missing_images.contains(image) {
            return Err(RuntimeError::ImageNotFound(image.to_string()));
        }
        if inner.auth_failing_images.contains(image) {
            return Err(RuntimeError::AuthFailure(image.to_string()));
        }
        if let Some(remaining) = inner.flaky_pulls.get_mut(image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::Connection("mock registry flake".to_string()));
            }
        }
        inner.pulled.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.inner.lock().pulled.contains(image))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("mock-{:08x}", inner.next_id);
        inner.ops.push(format!("create {} ({id})", spec.name));
        inner.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                network: spec.network.clone(),
                state: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("start {id}"));
        let name = inner
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        if inner.fail_start.contains(&name) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("mock start failure for {name}"),
            });
        }
        inner.containers.get_mut(id).expect("checked above").state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("stop {id}"));
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.state = "exited".to_string();
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("remove {id}"));
        inner.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let inner = self.inner.lock();
        let container = inner
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        Ok(ContainerState {
            status: container.state.clone(),
            health: None,
            started_at: None,
        })
    }

    async fn list_containers(&self, _label: &str) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .inner
            .lock()
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.state.clone(),
            })
            .collect())
    }

    async fn container_logs(
        &self,
        id: &str,
        _opts: &LogOptions,
    ) -> Result<BoxStream<'static, Result<LogChunk>>> {
        let chunks = self.inner.lock().logs.get(id).cloned().unwrap_or_default();
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        if !self.inner.lock().containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }
        Ok(ContainerStats {
            cpu_percent: 1.5,
            memory_usage_bytes: 64 << 20,
            memory_limit_bytes: 512 << 20,
            memory_percent: 12.5,
            pids: 3,
            ..Default::default()
        })
    }

    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("create_network {name}"));
        if let Some(existing) = inner.networks.get(name) {
            if labels.iter().all(|(k, v)| existing.get(k) == Some(v)) {
                return Ok(());
            }
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("network {name} exists with foreign labels"),
            });
        }
        inner.networks.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(format!("remove_network {name}"));
        inner.networks.remove(name);
        Ok(())
    }

    async fn connect_network(&self, _network: &str, _container: &str) -> Result<()> {
        Ok(())
    }

    async fn disconnect_network(&self, _network: &str, _container: &str) -> Result<()> {
        Ok(())
    }

    async fn create_volume(&self, name: &str, _labels: &HashMap<String, String>) -> Result<()> {
        self.inner.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.inner.lock().volumes.remove(name);
        Ok(())
    }
}
