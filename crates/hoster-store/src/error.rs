//! Store error taxonomy.

use thiserror::Error;

/// Failure modes of the storage layer. Each carries the operation that was
/// attempted, the entity involved, and enough identity to debug it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op}: {entity} {id} not found")]
    NotFound {
        op: &'static str,
        entity: &'static str,
        id: String,
    },

    #[error("{op}: {entity} {id} already exists")]
    DuplicateId {
        op: &'static str,
        entity: &'static str,
        id: String,
    },

    #[error("{op}: slug {slug} already in use")]
    DuplicateSlug { op: &'static str, slug: String },

    #[error("{op}: {entity} violates {constraint}")]
    ForeignKey {
        op: &'static str,
        entity: &'static str,
        constraint: String,
    },

    #[error("{op}: invalid {entity}: {reason}")]
    InvalidData {
        op: &'static str,
        entity: &'static str,
        reason: String,
    },

    #[error("{op}: transaction failed")]
    TxFailed {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn not_found(op: &'static str, entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            op,
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for hoster_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id, .. } => hoster_core::Error::NotFound { entity, id },
            StoreError::DuplicateId { entity, id, .. } => {
                hoster_core::Error::conflict(format!("{entity} {id} already exists"))
            }
            StoreError::DuplicateSlug { slug, .. } => {
                hoster_core::Error::conflict(format!("slug {slug} already in use"))
            }
            StoreError::ForeignKey { constraint, .. } => hoster_core::Error::conflict(constraint),
            StoreError::InvalidData { reason, .. } => {
                hoster_core::Error::validation("data", reason)
            }
            err @ StoreError::TxFailed { .. } => hoster_core::Error::internal(err),
        }
    }
}
