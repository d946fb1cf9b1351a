//! Process-wide cache of per-node container clients.
//!
//! Each node gets exactly one [`ContainerClient`]. The node matching the
//! configured local host shares the daemon's own socket; every other node is
//! reached through an SSH tunnel that forwards the remote runtime socket to
//! a local path. The pool owns those tunnels and tears them down on
//! shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::client::ContainerClient;
use crate::docker::DockerClient;
use crate::error::{Result, RuntimeError};
use crate::ssh::{self, SshTarget};

const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the pool needs to reach one node.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub node_ref: String,
    pub host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Runtime socket path on the node itself.
    pub socket_path: String,
    /// Decrypted OpenSSH private key; `None` only for the local node.
    pub private_key: Option<Zeroizing<String>>,
}

/// An `ssh -N -L` child forwarding a remote unix socket to a local one.
/// Killing the child tears the forward down; the key file is deleted on
/// drop.
#[derive(Debug)]
struct SshTunnel {
    child: Child,
    local_socket: PathBuf,
    _key_file: tempfile::TempPath,
}

impl SshTunnel {
    async fn open(
        dir: &std::path::Path,
        endpoint: &NodeEndpoint,
        key: &str,
    ) -> Result<Self> {
        let key_file = ssh::write_key_file(dir, key)?;
        let target = SshTarget::new(
            endpoint.host.clone(),
            endpoint.ssh_port,
            endpoint.ssh_user.clone(),
            key_file.to_path_buf(),
        )?;
        let local_socket = dir.join(format!("{}.sock", endpoint.node_ref));
        // A stale socket from a previous tunnel blocks the forward.
        let _ = std::fs::remove_file(&local_socket);

        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ConnectTimeout=10",
        ])
        .arg("-i")
        .arg(&target.key_path)
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-N")
        .arg("-L")
        .arg(format!(
            "{}:{}",
            local_socket.display(),
            endpoint.socket_path
        ))
        .arg(format!("{}@{}", target.user, target.host))
        .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        // The forward is usable once the local socket exists. Poll for it,
        // bailing early if ssh already died.
        let started = tokio::time::Instant::now();
        loop {
            if local_socket.exists() {
                break;
            }
            if let Some(status) = child.try_wait()? {
                return Err(RuntimeError::Tunnel {
                    host: endpoint.host.clone(),
                    reason: format!("ssh exited with {status} before forwarding"),
                });
            }
            if started.elapsed() > TUNNEL_READY_TIMEOUT {
                let _ = child.kill().await;
                return Err(RuntimeError::Tunnel {
                    host: endpoint.host.clone(),
                    reason: "forwarded socket never appeared".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        debug!(node = %endpoint.node_ref, socket = %local_socket.display(), "tunnel established");
        Ok(Self {
            child,
            local_socket,
            _key_file: key_file,
        })
    }

    async fn close(mut self) {
        let _ = self.child.kill().await;
        let _ = std::fs::remove_file(&self.local_socket);
    }
}

struct RemoteEntry {
    client: Arc<dyn ContainerClient>,
    tunnel: Option<SshTunnel>,
}

#[derive(Default)]
struct PoolState {
    local: Option<Arc<dyn ContainerClient>>,
    remote: HashMap<String, RemoteEntry>,
}

/// Shared across all request handlers and workers. The interior mutex also
/// serves as the guard against constructing two clients for one node: a
/// second caller for the same node waits and then finds the cached entry.
pub struct NodePool {
    local_host: String,
    local_socket: String,
    tunnel_dir: tempfile::TempDir,
    state: Mutex<PoolState>,
}

impl NodePool {
    pub fn new(local_host: impl Into<String>, local_socket: impl Into<String>) -> Result<Self> {
        Ok(Self {
            local_host: local_host.into(),
            local_socket: local_socket.into(),
            tunnel_dir: tempfile::Builder::new().prefix("hoster-tunnels-").tempdir()?,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Whether scheduling this endpoint uses the shared local client.
    pub fn is_local(&self, endpoint_host: &str) -> bool {
        endpoint_host == self.local_host
    }

    /// The client for a node, dialing if the pool has none yet. Returns the
    /// client and whether it is the local one.
    pub async fn client_for(
        &self,
        endpoint: &NodeEndpoint,
    ) -> Result<(Arc<dyn ContainerClient>, bool)> {
        let mut state = self.state.lock().await;

        if self.is_local(&endpoint.host) {
            if let Some(local) = &state.local {
                return Ok((Arc::clone(local), true));
            }
            let client: Arc<dyn ContainerClient> =
                Arc::new(DockerClient::connect_unix(&self.local_socket)?);
            state.local = Some(Arc::clone(&client));
            info!(socket = %self.local_socket, "local container client ready");
            return Ok((client, true));
        }

        if let Some(entry) = state.remote.get(&endpoint.node_ref) {
            return Ok((Arc::clone(&entry.client), false));
        }

        let key = endpoint.private_key.as_ref().ok_or_else(|| RuntimeError::Tunnel {
            host: endpoint.host.clone(),
            reason: "remote node has no ssh key".to_string(),
        })?;

        let tunnel = SshTunnel::open(self.tunnel_dir.path(), endpoint, key).await?;
        let client: Arc<dyn ContainerClient> = Arc::new(DockerClient::connect_unix(
            &tunnel.local_socket.display().to_string(),
        )?);

        info!(node = %endpoint.node_ref, host = %endpoint.host, "remote container client ready");
        state.remote.insert(
            endpoint.node_ref.clone(),
            RemoteEntry {
                client: Arc::clone(&client),
                tunnel: Some(tunnel),
            },
        );
        Ok((client, false))
    }

    /// Pre-register a client for a node, bypassing SSH. Dev-mode and test
    /// wiring: the in-memory session map the daemon uses when told every
    /// node is reachable through an injected client.
    pub async fn register(&self, node_ref: impl Into<String>, client: Arc<dyn ContainerClient>) {
        let mut state = self.state.lock().await;
        state.remote.insert(
            node_ref.into(),
            RemoteEntry {
                client,
                tunnel: None,
            },
        );
    }

    /// Drop a node's cached client and close its tunnel. The next
    /// `client_for` re-dials; callers evict after repeated failures.
    pub async fn evict(&self, node_ref: &str) {
        let entry = self.state.lock().await.remote.remove(node_ref);
        if let Some(entry) = entry {
            if let Some(tunnel) = entry.tunnel {
                tunnel.close().await;
            }
            warn!(node = %node_ref, "evicted container client");
        }
    }

    /// Close every tunnel. Called once during daemon shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.local = None;
        for (node_ref, entry) in state.remote.drain() {
            if let Some(tunnel) = entry.tunnel {
                tunnel.close().await;
            }
            debug!(node = %node_ref, "closed tunnel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockContainerClient;

    #[tokio::test]
    async fn registered_clients_are_reused_and_evictable() {
        let pool = NodePool::new("localhost", "/var/run/docker.sock").unwrap();
        let mock = Arc::new(MockContainerClient::new());
        pool.register("node_abcd1234", mock.clone()).await;

        let endpoint = NodeEndpoint {
            node_ref: "node_abcd1234".to_string(),
            host: "198.51.100.7".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            socket_path: "/var/run/docker.sock".to_string(),
            private_key: None,
        };
        let (client, is_local) = pool.client_for(&endpoint).await.unwrap();
        assert!(!is_local);
        client.ping().await.unwrap();

        pool.evict("node_abcd1234").await;
        // No key material: dialing now must fail rather than silently reuse.
        assert!(pool.client_for(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn local_host_detection() {
        let pool = NodePool::new("node-a.internal", "/var/run/docker.sock").unwrap();
        assert!(pool.is_local("node-a.internal"));
        assert!(!pool.is_local("node-b.internal"));
    }
}
