//! Node selection and proxy-port allocation.

use std::sync::Arc;

use tracing::{debug, info};

use hoster_core::resources::ResourceSpec;
use hoster_core::{Error, Result};
use hoster_runtime::client::ContainerClient;
use hoster_store::model::{Deployment, DeploymentStatus, Node, NodeStatus, Template};
use hoster_store::{Store, StoreTx};

use crate::engine::Engine;

/// Weighting of free-resource fractions in the placement score.
const CPU_WEIGHT: f64 = 0.4;
const MEM_WEIGHT: f64 = 0.4;
const DISK_WEIGHT: f64 = 0.2;

/// A committed placement: the port is already persisted on the deployment
/// by the time callers see this.
pub struct Selection {
    pub node: Node,
    pub client: Arc<dyn ContainerClient>,
    pub proxy_port: u16,
    pub score: f64,
    pub is_local: bool,
}

impl<S: Store> Engine<S> {
    /// Place a deployment on a node and reserve a proxy port.
    ///
    /// The restart path passes the previously assigned node as
    /// `preferred_node`; it is revalidated like any candidate and silently
    /// fallen through when it no longer qualifies. Port reservation happens
    /// inside one transaction together with the `pending → scheduled`
    /// transition (when applicable), so a concurrent allocator cannot hand
    /// out the same port.
    pub(crate) async fn schedule(
        &self,
        template: &Template,
        deployment: &Deployment,
        preferred_node: Option<i64>,
    ) -> Result<Selection> {
        let node = self.pick_node(template, deployment, preferred_node).await?;
        let score = placement_score(&node, &deployment.resources);

        let deployment_id = deployment.id;
        let node_id = node.id;
        let range = self.config.proxy_ports;
        let node_ref = node.reference_id.clone();

        let proxy_port = self
            .store
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;

                // A restart that stays on the same node keeps its port.
                let port = match deployment.proxy_port {
                    Some(port) if deployment.node_id == Some(node_id) => port,
                    _ => {
                        let used = tx.used_proxy_ports(node_id)?;
                        pick_free_port(range, &used).ok_or(Error::PortExhaustion {
                            node: node_ref.clone(),
                            start: range.start,
                            end: range.end,
                        })?
                    }
                };

                deployment.node_id = Some(node_id);
                deployment.proxy_port = Some(port);
                if deployment.status == DeploymentStatus::Pending {
                    deployment.status = DeploymentStatus::Scheduled;
                    crate::engine::append_deployment_event(
                        tx,
                        deployment.id,
                        "deployment.scheduled",
                        "",
                    )?;
                }
                tx.update_deployment(&deployment)?;
                Ok::<u16, hoster_core::Error>(port)
            })
            .await?;

        let endpoint = self.endpoint_for_node(&node).await?;
        let (client, is_local) = self.pool.client_for(&endpoint).await?;

        info!(
            deployment = %deployment.reference_id,
            node = %node.reference_id,
            proxy_port,
            score,
            is_local,
            "deployment scheduled"
        );
        Ok(Selection {
            node,
            client,
            proxy_port,
            score,
            is_local,
        })
    }

    async fn pick_node(
        &self,
        template: &Template,
        deployment: &Deployment,
        preferred_node: Option<i64>,
    ) -> Result<Node> {
        let required = template.required_capabilities.clone();
        let request = deployment.resources;
        let creator_id = template.creator_id;

        if let Some(preferred) = preferred_node {
            let node: Option<Node> = self
                .store
                .with_tx(move |tx| match tx.node(preferred) {
                    Ok(node) => Ok(Some(node)),
                    Err(hoster_store::StoreError::NotFound { .. }) => Ok(None),
                    Err(err) => Err(Error::from(err)),
                })
                .await?;
            if let Some(node) = node {
                if node_qualifies(&node, creator_id, &template.required_capabilities, &request) {
                    debug!(node = %node.reference_id, "reusing preferred node");
                    return Ok(node);
                }
                debug!(node = %node.reference_id, "preferred node no longer qualifies");
            }
        }

        let mut candidates: Vec<Node> = self
            .store
            .with_tx(|tx| Ok::<_, Error>(tx.online_nodes()?))
            .await?
            .into_iter()
            .filter(|n| node_qualifies(n, creator_id, &required, &request))
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoEligibleNode {
                reason: format!(
                    "no online node of creator {creator_id} satisfies capabilities {:?} and {:?}",
                    required, request
                ),
            });
        }

        // Highest score wins; ties break on the lower reference-ID so
        // placement is deterministic.
        candidates.sort_by(|a, b| {
            let sa = placement_score(a, &request);
            let sb = placement_score(b, &request);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.reference_id.cmp(&b.reference_id))
        });
        Ok(candidates.remove(0))
    }
}

fn node_qualifies(
    node: &Node,
    creator_id: i64,
    required: &std::collections::BTreeSet<String>,
    request: &ResourceSpec,
) -> bool {
    node.status == NodeStatus::Online
        && node.creator_id == creator_id
        && node.has_capabilities(required)
        && node.capacity.has_room_for(request)
}

/// Smallest port in the range not already reserved on the node.
pub fn pick_free_port(range: hoster_core::config::PortRange, used: &[u16]) -> Option<u16> {
    range.iter().find(|candidate| !used.contains(candidate))
}

/// Weighted free-resource fraction; higher means a better-fitting node.
fn placement_score(node: &Node, _request: &ResourceSpec) -> f64 {
    let (cpu, mem, disk) = node.capacity.free_fractions();
    CPU_WEIGHT * cpu + MEM_WEIGHT * mem + DISK_WEIGHT * disk
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hoster_core::resources::Capacity;

    fn node_with_free(reference_id: &str, used_cpu: f64) -> Node {
        let mut capacity = Capacity::new(ResourceSpec::new(4.0, 8192, 100_000));
        capacity.used = ResourceSpec::new(used_cpu, 0, 0);
        Node {
            id: 1,
            reference_id: reference_id.to_string(),
            creator_id: 1,
            name: reference_id.to_string(),
            ssh_host: "10.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_key_id: None,
            ssh_key_ref: String::new(),
            container_socket: "/var/run/docker.sock".to_string(),
            status: NodeStatus::Online,
            capabilities: ["standard".to_string()].into(),
            capacity,
            base_domain: "apps.example.com".to_string(),
            public_ips: vec![],
            provision_id: None,
            last_health_check: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn score_prefers_emptier_nodes() {
        let request = ResourceSpec::new(1.0, 512, 1024);
        let empty = placement_score(&node_with_free("node_aaaaaaaa", 0.0), &request);
        let busy = placement_score(&node_with_free("node_bbbbbbbb", 3.0), &request);
        assert!(empty > busy);
    }

    #[test]
    fn qualification_checks_all_axes() {
        let request = ResourceSpec::new(1.0, 512, 1024);
        let required: std::collections::BTreeSet<String> = ["standard".to_string()].into();
        let node = node_with_free("node_aaaaaaaa", 0.0);
        assert!(node_qualifies(&node, 1, &required, &request));
        assert!(!node_qualifies(&node, 2, &required, &request), "wrong owner");

        let mut offline = node.clone();
        offline.status = NodeStatus::Offline;
        assert!(!node_qualifies(&offline, 1, &required, &request));

        let gpu: std::collections::BTreeSet<String> = ["gpu".to_string()].into();
        assert!(!node_qualifies(&node, 1, &gpu, &request), "missing capability");

        let huge = ResourceSpec::new(8.0, 512, 1024);
        assert!(!node_qualifies(&node, 1, &required, &huge), "over capacity");
    }
}
