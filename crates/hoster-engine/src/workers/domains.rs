//! Periodic reverification of custom domains.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hoster_core::{Error, Result};
use hoster_store::model::{Deployment, DeploymentDomain, DomainKind, VerificationStatus};
use hoster_store::{Store, StoreTx};

use crate::domains;
use crate::engine::Engine;

/// Unverified domains are retried no sooner than this after an attempt.
const RETRY_AFTER: chrono::Duration = chrono::Duration::seconds(30);
/// Verified domains are re-checked on this cadence.
const RECHECK_AFTER: chrono::Duration = chrono::Duration::hours(24);

pub struct DomainVerifyWorker<S> {
    engine: Engine<S>,
    interval: Duration,
}

impl<S: Store> DomainVerifyWorker<S> {
    pub fn new(engine: Engine<S>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "domain verify worker running");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "domain verify tick failed");
                    }
                }
            }
        }
        debug!("domain verify worker stopped");
    }

    /// Verify every due custom domain once.
    pub async fn tick(&self) -> Result<()> {
        let deployments: Vec<Deployment> = self
            .engine
            .store()
            .with_tx(|tx| Ok::<_, Error>(tx.deployments_with_custom_domains()?))
            .await?;

        let now = Utc::now();
        for deployment in deployments {
            let auto_domain = deployment.auto_domain().unwrap_or_default().to_string();
            let expected_ips = self.engine.expected_ips(&deployment).await;

            for domain in deployment
                .domains
                .iter()
                .filter(|d| d.kind == DomainKind::Custom && is_due(d, now))
            {
                match self.engine.resolver.resolve(&domain.hostname).await {
                    Ok(records) => {
                        let verdict = domains::verify(&records, &auto_domain, &expected_ips);
                        if !verdict.verified {
                            debug!(
                                hostname = %domain.hostname,
                                error = verdict.error.as_deref().unwrap_or(""),
                                "domain still unverified"
                            );
                        }
                        self.engine
                            .record_verdict(deployment.id, &domain.hostname, &verdict)
                            .await?;
                    }
                    Err(err) => {
                        // A resolver outage is not evidence about the
                        // domain; record the attempt without a transition.
                        warn!(hostname = %domain.hostname, %err, "dns lookup failed");
                        self.record_outage(deployment.id, &domain.hostname, &err.user_message())
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_outage(
        &self,
        deployment_id: i64,
        hostname: &str,
        message: &str,
    ) -> Result<()> {
        let hostname = hostname.to_string();
        let message = message.to_string();
        self.engine
            .store()
            .with_tx(move |tx| {
                let mut deployment = tx.deployment(deployment_id)?;
                if let Some(domain) = deployment.domain_mut(&hostname) {
                    domain.last_checked_at = Some(Utc::now());
                    domain.last_check_error = Some(message);
                }
                tx.update_deployment(&deployment)?;
                Ok(())
            })
            .await
    }
}

fn is_due(domain: &DeploymentDomain, now: chrono::DateTime<chrono::Utc>) -> bool {
    match domain.verification_status {
        VerificationStatus::Pending | VerificationStatus::Failed => domain
            .last_checked_at
            .is_none_or(|checked| now - checked >= RETRY_AFTER),
        VerificationStatus::Verified => domain
            .verified_at
            .is_some_and(|verified| now - verified >= RECHECK_AFTER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_rules() {
        let now = Utc::now();
        let mut domain = DeploymentDomain::custom("shop.example.com");

        // Never checked: due immediately.
        assert!(is_due(&domain, now));

        // Checked seconds ago: not yet.
        domain.last_checked_at = Some(now - chrono::Duration::seconds(5));
        assert!(!is_due(&domain, now));
        domain.last_checked_at = Some(now - chrono::Duration::seconds(31));
        assert!(is_due(&domain, now));

        // Verified recently: quiet for a day.
        domain.verification_status = VerificationStatus::Verified;
        domain.verified_at = Some(now - chrono::Duration::hours(1));
        assert!(!is_due(&domain, now));
        domain.verified_at = Some(now - chrono::Duration::hours(25));
        assert!(is_due(&domain, now));
    }
}
