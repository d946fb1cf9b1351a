//! Background reconciliation loops.
//!
//! Workers scan the authoritative state on a schedule instead of consuming a
//! job queue, which makes the system self-healing after a restart: whatever
//! was mid-flight is still in the store, and the next tick resumes it. A
//! single controller process is assumed; scaling out would need per-row
//! leases, which these loops deliberately do not implement.

pub mod domains;
pub mod health;
pub mod provisioner;
pub mod usage;

pub use domains::DomainVerifyWorker;
pub use health::HealthWorker;
pub use provisioner::ProvisionerWorker;
pub use usage::UsageReporterWorker;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hoster_store::Store;

use crate::engine::Engine;

/// Handles for the running workers plus their shared shutdown token.
pub struct WorkerSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel and wait for every worker to wind down.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("workers stopped");
    }
}

/// Spawn the four workers with the configured cadences.
pub fn spawn_all<S: Store>(engine: &Engine<S>) -> WorkerSet {
    let token = CancellationToken::new();
    let intervals = engine.config().workers;

    let provisioner = ProvisionerWorker::new(
        engine.clone(),
        Duration::from_secs(intervals.provisioner_secs),
    );
    let health = HealthWorker::new(engine.clone(), Duration::from_secs(intervals.health_secs));
    let domains = DomainVerifyWorker::new(
        engine.clone(),
        Duration::from_secs(intervals.domain_verify_secs),
    );
    let usage = UsageReporterWorker::new(
        engine.clone(),
        Duration::from_secs(intervals.usage_report_secs),
    );

    let handles = vec![
        tokio::spawn(provisioner.run(token.clone())),
        tokio::spawn(health.run(token.clone())),
        tokio::spawn(domains.run(token.clone())),
        tokio::spawn(usage.run(token.clone())),
    ];
    WorkerSet { token, handles }
}
