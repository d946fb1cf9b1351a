//! Usage event reporting to the external billing sink.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hoster_core::{Error, Result};
use hoster_store::model::UsageEvent;
use hoster_store::{Store, StoreTx};

use crate::engine::Engine;

const BATCH_SIZE: usize = 100;

pub struct UsageReporterWorker<S> {
    engine: Engine<S>,
    interval: Duration,
}

impl<S: Store> UsageReporterWorker<S> {
    pub fn new(engine: Engine<S>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "usage reporter running");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "usage report tick failed");
                    }
                }
            }
        }
        debug!("usage reporter stopped");
    }

    /// Forward one batch of unreported events; only acknowledged IDs are
    /// marked, so unacked events ride along in the next batch.
    pub async fn tick(&self) -> Result<()> {
        let mut batch: Vec<UsageEvent> = self
            .engine
            .store()
            .with_tx(|tx| Ok::<_, Error>(tx.unreported_events(BATCH_SIZE)?))
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        // Downstream wants monotonic timestamps per resource.
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let acked = match self.engine.sink.report(&batch).await {
            Ok(acked) => acked,
            Err(err) => {
                warn!(%err, events = batch.len(), "billing sink rejected batch");
                return Ok(());
            }
        };
        if acked.is_empty() {
            return Ok(());
        }

        let reported_at = Utc::now();
        self.engine
            .store()
            .with_tx(move |tx| Ok::<_, Error>(tx.mark_events_reported(&acked, reported_at)?))
            .await?;
        debug!(events = batch.len(), "usage batch reported");
        Ok(())
    }
}
