//! Cloud API error taxonomy.

use thiserror::Error;

pub type Result<T, E = CloudError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CloudError {
    /// The provider API could not be reached. Transient.
    #[error("cloud api unreachable: {0}")]
    Connection(String),

    #[error("cloud api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The credential payload was rejected by the provider.
    #[error("cloud credentials rejected")]
    InvalidCredentials,

    #[error("{entity} {id} not found at provider")]
    NotFound { entity: &'static str, id: String },

    /// The credential names a provider kind nothing here implements.
    #[error("unsupported provider kind {0:?}")]
    UnsupportedProvider(String),

    /// The credential payload is not the JSON shape the provider expects.
    #[error("malformed credential payload: {0}")]
    MalformedPayload(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Connection(_) => true,
            CloudError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            CloudError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            CloudError::Connection(err.to_string())
        }
    }
}

impl From<CloudError> for hoster_core::Error {
    fn from(err: CloudError) -> Self {
        match &err {
            CloudError::NotFound { entity, id } => {
                hoster_core::Error::not_found(entity, id.clone())
            }
            CloudError::UnsupportedProvider(kind) => {
                hoster_core::Error::validation("provider", format!("unsupported kind {kind}"))
            }
            CloudError::MalformedPayload(reason) => {
                hoster_core::Error::validation("credential", reason.clone())
            }
            _ if err.is_transient() => hoster_core::Error::unavailable("cloud api", err),
            _ => hoster_core::Error::internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_5xx_are_transient() {
        assert!(CloudError::Api { status: 429, message: String::new() }.is_transient());
        assert!(CloudError::Api { status: 503, message: String::new() }.is_transient());
        assert!(!CloudError::Api { status: 422, message: String::new() }.is_transient());
        assert!(!CloudError::InvalidCredentials.is_transient());
    }
}
