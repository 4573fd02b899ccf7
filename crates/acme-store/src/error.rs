//! Error types for the ACME store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store.
///
/// Only lookups and construction report errors to callers. Failed
/// background writes are logged by the persistence worker instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No HTTP-01 key authorization for the token/domain pair.
    #[error("cannot find challenge for token {token} and domain {domain}")]
    ChallengeNotFound { token: String, domain: String },

    /// The persisted payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The remote backend rejected or failed a request.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Invalid store configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether this error is a lookup miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ChallengeNotFound { .. } | StoreError::Backend(BackendError::NotFound { .. })
        )
    }
}

/// Errors from the remote object backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The named object does not exist.
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// Transport-level failure.
    #[error("request failed: {0}")]
    Request(String),

    /// The API server answered with a non-success status.
    #[error("API server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The backend is not reachable or refuses work.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Request(err.to_string())
        }
    }
}
