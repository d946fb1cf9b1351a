//! Node health probing and capacity accounting.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hoster_core::resources::ResourceSpec;
use hoster_core::{Error, Result};
use hoster_store::model::{Node, NodeStatus};
use hoster_store::{Store, StoreTx};

use crate::engine::Engine;

const PING_TIMEOUT: Duration = Duration::from_secs(1);
const FAILURE_THRESHOLD: u32 = 3;

pub struct HealthWorker<S> {
    engine: Engine<S>,
    interval: Duration,
    /// Consecutive failures per node ID. In-memory on purpose: a restart
    /// starts counting from zero, which only delays an `unreachable`
    /// verdict by a tick or two.
    failures: HashMap<i64, u32>,
}

impl<S: Store> HealthWorker<S> {
    pub fn new(engine: Engine<S>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "health worker running");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "health tick failed");
                    }
                }
            }
        }
        debug!("health worker stopped");
    }

    /// Probe every checkable node once.
    pub async fn tick(&mut self) -> Result<()> {
        let nodes = self.engine.store().list_checkable_nodes().await?;
        let checked = nodes.len();
        for node in nodes {
            self.check_node(node).await;
        }
        let routable: u64 = self
            .engine
            .store()
            .with_tx(|tx| Ok::<_, Error>(tx.count_routable_deployments()?))
            .await?;
        debug!(checked, routable, "health pass complete");
        Ok(())
    }

    async fn check_node(&mut self, node: Node) {
        let ping = async {
            let endpoint = self.engine.endpoint_for_node(&node).await?;
            let (client, _) = self.engine.pool().client_for(&endpoint).await?;
            tokio::time::timeout(PING_TIMEOUT, client.ping())
                .await
                .map_err(|_| {
                    Error::unavailable(
                        format!("ping {}", node.reference_id),
                        std::io::Error::other("timed out"),
                    )
                })??;
            Ok::<(), Error>(())
        };

        let outcome = ping.await;
        match outcome {
            Ok(()) => self.mark_healthy(&node).await,
            Err(err) => self.record_failure(&node, &err).await,
        }
    }

    /// Healthy probe: node goes `online`, used capacity is re-derived from
    /// the deployments actually scheduled there, and the failure counter
    /// resets.
    async fn mark_healthy(&mut self, node: &Node) {
        self.failures.remove(&node.id);
        let node_id = node.id;
        let was = node.status;
        let outcome: Result<()> = self
            .engine
            .store()
            .with_tx(move |tx| {
                let mut node = tx.node(node_id)?;
                let used = tx
                    .deployments_by_node(node_id)?
                    .iter()
                    .filter(|d| d.status.reserves_capacity())
                    .fold(ResourceSpec::default(), |acc, d| acc.plus(&d.resources));
                node.capacity.used = used;
                node.status = NodeStatus::Online;
                node.last_health_check = Some(Utc::now());
                node.error_message = None;
                tx.update_node(&node)?;
                Ok(())
            })
            .await;
        match outcome {
            Ok(()) if was != NodeStatus::Online => {
                info!(node = %node.reference_id, from = %was, "node online");
            }
            Ok(()) => {}
            Err(err) => error!(node = %node.reference_id, %err, "failed to record health"),
        }
    }

    async fn record_failure(&mut self, node: &Node, err: &Error) {
        let count = self.failures.entry(node.id).or_insert(0);
        *count += 1;
        warn!(node = %node.reference_id, failures = *count, %err, "health probe failed");
        if *count < FAILURE_THRESHOLD {
            return;
        }

        let node_id = node.id;
        let message = err.user_message();
        let outcome: Result<()> = self
            .engine
            .store()
            .with_tx(move |tx| {
                let mut node = tx.node(node_id)?;
                if node.status != NodeStatus::Unreachable {
                    node.status = NodeStatus::Unreachable;
                    node.error_message = Some(message);
                    tx.update_node(&node)?;
                }
                Ok(())
            })
            .await;
        match outcome {
            Ok(()) => {
                if node.status != NodeStatus::Unreachable {
                    warn!(node = %node.reference_id, "node unreachable");
                }
                // A dead tunnel would otherwise keep poisoning the probes.
                self.engine.pool().evict(&node.reference_id).await;
            }
            Err(err) => error!(node = %node.reference_id, %err, "failed to record unreachability"),
        }
    }
}
