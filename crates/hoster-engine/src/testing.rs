//! Doubles used by the test suites and by `hosterd --dev`: a scriptable DNS
//! resolver and usage sinks that collect or just log.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use hoster_core::{Error, Result};
use hoster_store::model::UsageEvent;

use crate::dns::{DnsResolver, ResolvedRecords};
use crate::engine::UsageSink;

/// Answers from an in-memory zone map instead of the network.
#[derive(Debug, Default)]
pub struct MockDnsResolver {
    zones: Mutex<HashMap<String, ResolvedRecords>>,
}

impl MockDnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, hostname: &str, records: ResolvedRecords) {
        self.zones.lock().insert(hostname.to_string(), records);
    }

    pub fn clear(&self, hostname: &str) {
        self.zones.lock().remove(hostname);
    }
}

#[async_trait]
impl DnsResolver for MockDnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<ResolvedRecords> {
        self.zones.lock().get(hostname).cloned().ok_or_else(|| {
            Error::unavailable(
                format!("dns lookup for {hostname}"),
                std::io::Error::other("mock: no zone entry"),
            )
        })
    }
}

/// Collects every reported batch and acknowledges all of it.
#[derive(Debug, Default)]
pub struct CollectingUsageSink {
    reported: Mutex<Vec<UsageEvent>>,
    fail_next: Mutex<bool>,
}

impl CollectingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<UsageEvent> {
        self.reported.lock().clone()
    }

    pub fn fail_next_report(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl UsageSink for CollectingUsageSink {
    async fn report(&self, batch: &[UsageEvent]) -> Result<Vec<i64>> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(Error::unavailable(
                "billing sink",
                std::io::Error::other("mock sink failure"),
            ));
        }
        let mut reported = self.reported.lock();
        reported.extend(batch.iter().cloned());
        Ok(batch.iter().map(|e| e.id).collect())
    }
}

/// Dev-mode sink: acknowledges everything and leaves a log line behind.
#[derive(Debug, Default)]
pub struct LoggingUsageSink;

#[async_trait]
impl UsageSink for LoggingUsageSink {
    async fn report(&self, batch: &[UsageEvent]) -> Result<Vec<i64>> {
        for event in batch {
            info!(
                event = %event.event_type,
                resource = %event.resource_id,
                quantity = event.quantity,
                "usage event"
            );
        }
        Ok(batch.iter().map(|e| e.id).collect())
    }
}
