//! The container runtime interface the control plane is written against.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;

/// Request to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Network to attach at create time, with the service name as alias.
    pub network: Option<String>,
    pub network_alias: Option<String>,
    /// Bind mounts, `host:container[:ro]`.
    pub binds: Vec<String>,
    /// Host-port → container-port TCP publications.
    pub port_bindings: Vec<(u16, u16)>,
    pub command: Option<Vec<String>>,
    pub memory_limit_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// Observed container state, from inspect.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    /// Runtime status string: `created`, `running`, `exited`, ...
    pub status: String,
    /// Healthcheck verdict when the image defines one.
    pub health: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

/// One demultiplexed log frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: StdStream,
    pub message: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// Options for a log pull. Logs are pulled on demand, never held open, so
/// there is no follow mode.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Last N lines; `None` means everything.
    pub tail: Option<u32>,
    pub since: Option<DateTime<Utc>>,
    pub timestamps: bool,
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Per-node container runtime operations.
///
/// Implementations must be safe to call concurrently; the pool hands the same
/// client to every request handler and worker touching a node.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Lightweight liveness probe, used by the health worker.
    async fn ping(&self) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Returns the runtime's container ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Graceful stop with `timeout`, then hard kill.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerState>;
    /// Containers carrying the given label (`key=value`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    async fn container_logs(
        &self,
        id: &str,
        opts: &LogOptions,
    ) -> Result<BoxStream<'static, Result<LogChunk>>>;
    async fn container_stats(&self, id: &str) -> Result<ContainerStats>;

    /// Idempotent when the network already exists with the same labels.
    async fn create_network(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn connect_network(&self, network: &str, container: &str) -> Result<()>;
    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()>;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;
    async fn remove_volume(&self, name: &str) -> Result<()>;
}
