use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External principal, upserted on first sight via `resolve_user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Opaque reference-ID assigned by the auth layer, not by us.
    pub reference_id: String,
    pub email: String,
    pub name: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
}
