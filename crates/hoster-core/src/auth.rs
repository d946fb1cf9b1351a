//! Authenticated caller context, handed in by the HTTP layer.

use serde::{Deserialize, Serialize};

/// Per-plan ceilings enforced by the service layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_deployments: u32,
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_nodes: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_deployments: 5,
            max_cpu_cores: 8.0,
            max_memory_mb: 16_384,
            max_nodes: 3,
        }
    }
}

/// The already-authenticated principal making a request. The core never sees
/// tokens or headers; it trusts these fields as parsed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub authenticated: bool,
    /// Store-assigned integer ID, resolved via `resolve_user`.
    pub user_id: i64,
    /// Opaque principal ID from the auth layer.
    pub reference_id: String,
    pub plan_id: String,
    pub plan_limits: PlanLimits,
}

impl AuthContext {
    /// An anonymous, unauthenticated caller. Only good for viewing published
    /// templates.
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            user_id: 0,
            reference_id: String::new(),
            plan_id: String::new(),
            plan_limits: PlanLimits::default(),
        }
    }
}
