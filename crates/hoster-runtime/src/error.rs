//! Runtime error taxonomy.

use thiserror::Error;

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime endpoint could not be reached. Transient.
    #[error("runtime connection failed: {0}")]
    Connection(String),

    /// The runtime rejected the request.
    #[error("runtime api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("container {0} not found")]
    ContainerNotFound(String),

    /// The registry does not have the image. Permanent; retrying cannot help.
    #[error("image {0} not found")]
    ImageNotFound(String),

    /// The registry refused our credentials. Permanent.
    #[error("registry authentication failed for {0}")]
    AuthFailure(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("ssh to {host} failed: {reason}")]
    Ssh { host: String, reason: String },

    #[error("ssh tunnel to {host} failed: {reason}")]
    Tunnel { host: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Transient failures are worth retrying with backoff; permanent ones
    /// (missing image, bad credentials) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::Connection(_)
            | RuntimeError::Timeout { .. }
            | RuntimeError::Ssh { .. }
            | RuntimeError::Tunnel { .. }
            | RuntimeError::Io(_) => true,
            RuntimeError::Api { status, .. } => *status >= 500,
            RuntimeError::ContainerNotFound(_)
            | RuntimeError::ImageNotFound(_)
            | RuntimeError::AuthFailure(_) => false,
        }
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as Docker;
        match err {
            Docker::DockerResponseServerError {
                status_code,
                message,
            } => RuntimeError::Api {
                status: status_code,
                message,
            },
            Docker::RequestTimeoutError => RuntimeError::Timeout {
                operation: "docker request".to_string(),
                seconds: 0,
            },
            Docker::IOError { err } => RuntimeError::Io(err),
            other => RuntimeError::Connection(other.to_string()),
        }
    }
}

impl From<RuntimeError> for hoster_core::Error {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::ContainerNotFound(id) => {
                hoster_core::Error::not_found("container", id.clone())
            }
            // Permanent image problems are the deployment owner's to fix;
            // surface them verbatim instead of redacting.
            RuntimeError::ImageNotFound(image) => {
                hoster_core::Error::validation("image", format!("image {image} not found"))
            }
            RuntimeError::AuthFailure(image) => hoster_core::Error::validation(
                "image",
                format!("registry refused credentials for {image}"),
            ),
            _ if err.is_transient() => {
                hoster_core::Error::unavailable("container runtime", err)
            }
            _ => hoster_core::Error::internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RuntimeError::Connection("refused".into()).is_transient());
        assert!(
            RuntimeError::Api {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(
            !RuntimeError::Api {
                status: 404,
                message: "no such image".into()
            }
            .is_transient()
        );
        assert!(!RuntimeError::ImageNotFound("nginx:none".into()).is_transient());
        assert!(!RuntimeError::AuthFailure("ghcr.io/x".into()).is_transient());
    }
}
