//! User-facing error taxonomy.
//!
//! Every fallible public operation in the control plane resolves to one of
//! these kinds. The HTTP surface (out of tree) maps them to status codes;
//! workers use [`Error::is_retryable`] to decide between retrying locally and
//! driving the affected resource to a failed state.

use thiserror::Error;

/// Boxed cause carried by the opaque variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The referenced entity does not exist (or is invisible to the caller,
    /// which must be indistinguishable).
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// An authorization predicate failed.
    #[error("not allowed to {action}")]
    Forbidden { action: String },

    /// The state machine rejected a transition.
    #[error("{entity} cannot go from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Input violated a documented rule.
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// A uniqueness or referential constraint was violated.
    #[error("conflict: {constraint}")]
    Conflict { constraint: String },

    /// A downstream dependency (cloud API, SSH, container runtime, DNS) is
    /// unreachable. Retryable.
    #[error("{operation} unavailable")]
    Unavailable {
        operation: String,
        #[source]
        source: BoxError,
    },

    /// The scheduler found no node satisfying the template's requirements.
    #[error("no eligible node: {reason}")]
    NoEligibleNode { reason: String },

    /// Every proxy port in the configured range is reserved on the node.
    #[error("proxy ports {start}-{end} exhausted on node {node}")]
    PortExhaustion { node: String, start: u16, end: u16 },

    /// The compose text references a required variable with no value.
    #[error("missing required variable {name}")]
    MissingVariable { name: String },

    /// The operation was cancelled before completing. Distinct from failure:
    /// applied external effects stay recorded for reconciliation to resume.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// A bug or unexpected condition. The cause is captured for operators and
    /// redacted from user-visible messages.
    #[error("internal error")]
    Internal {
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub fn internal<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Internal {
            source: source.into(),
        }
    }

    pub fn unavailable<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Unavailable {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn conflict(constraint: impl Into<String>) -> Self {
        Error::Conflict {
            constraint: constraint.into(),
        }
    }

    pub fn forbidden(action: impl Into<String>) -> Self {
        Error::Forbidden {
            action: action.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether a worker loop should retry the operation rather than fail the
    /// resource it was driving.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }

    /// Message safe to persist in an entity's `error_message` and show to the
    /// owning user. Internal cause chains are redacted.
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal { .. } => "internal error".to_string(),
            Error::Unavailable { operation, .. } => format!("{operation} unavailable"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_message_is_redacted() {
        let err = Error::internal(std::io::Error::other("secret db path /var/lib/x"));
        assert_eq!(err.user_message(), "internal error");
    }

    #[test]
    fn unavailable_is_retryable() {
        let err = Error::unavailable("docker ping", std::io::Error::other("timed out"));
        assert!(err.is_retryable());
        assert!(!Error::validation("name", "bad").is_retryable());
    }

    #[test]
    fn unavailable_message_hides_cause() {
        let err = Error::unavailable("droplet create", std::io::Error::other("401 unauthorized"));
        assert_eq!(err.user_message(), "droplet create unavailable");
    }
}
