//! Core error taxonomy
//!
//! One variant per failure class named in the specification's error
//! handling design. Retry classification is a method on `ProviderErrorKind`,
//! never a substring match against an error message.

use thiserror::Error;

/// Whether a provider-side failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    ServerError,
    ConnectionFailed,
    Temporary,
    Other,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ProviderErrorKind::Other)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Out-of-range configuration on skill update. Rejected at the edge;
    /// the core should never see this, but the type exists so an HTTP
    /// layer built on top of this crate can surface a 4xx.
    #[error("validation error: {0}")]
    Validation(String),

    /// Upstream LLM provider returned 5xx, timed out, or the network
    /// connection failed. No arm stats are updated and no log is persisted.
    #[error("upstream provider failure: {0}")]
    UpstreamFailure(String),

    /// Judge LLM exhausted its retries. Carries the fallback score and
    /// reasoning that the evaluation runner degrades to.
    #[error("judge failure: {0}")]
    JudgeFailure(String),

    /// The storage backend could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A compare-and-swap write lost a race. Callers retry per component
    /// policy (§4.3/§4.6/§4.7/§4.8).
    #[error("conflicting update on {entity}")]
    ConflictingUpdate { entity: String },

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An advisory lock is held by another holder whose TTL has not
    /// expired. Benign — the calling controller simply exits.
    #[error("lock held for skill {skill_id} purpose {purpose}")]
    LockHeld { skill_id: String, purpose: String },
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(err.to_string()),
            other => CoreError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        // Retry classification only matters to callers that branch on it
        // (the judge and meta-prompt ports, which carry `ProviderErrorKind`
        // on their own error types and call `classify_reqwest_error`
        // directly); `UpstreamFailure` has no such field, so there is
        // nothing to classify here.
        CoreError::UpstreamFailure(err.to_string())
    }
}

/// Maps a `reqwest::Error` to a retry classification without ever
/// string-matching the error message.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ProviderErrorKind {
    if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_connect() {
        ProviderErrorKind::ConnectionFailed
    } else if let Some(status) = err.status() {
        if status.as_u16() == 429 {
            ProviderErrorKind::RateLimited
        } else if status.is_server_error() {
            ProviderErrorKind::ServerError
        } else {
            ProviderErrorKind::Other
        }
    } else if err.is_request() || err.is_body() {
        ProviderErrorKind::Temporary
    } else {
        ProviderErrorKind::Other
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
