use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only billing input. Immutable except `reported_at`, which the usage
/// reporter sets exactly once after the sink acknowledges the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub reference_id: String,
    pub user_id: i64,
    /// E.g. `deployment.start`, `deployment.stop`.
    pub event_type: String,
    /// Reference-ID of the resource the event is about.
    pub resource_id: String,
    pub resource_type: String,
    pub quantity: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// Append-only per-deployment audit row: lifecycle transitions and container
/// errors, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub id: i64,
    pub deployment_id: i64,
    /// E.g. `deployment.starting`, `container.error`,
    /// `container.domain_unverified`.
    pub event_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
