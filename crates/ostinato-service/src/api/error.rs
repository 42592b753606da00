use std::time::Duration;

use thiserror::Error;

/// An error that happens while fetching data from the remote service.
///
/// Requesters absorb all lower-level errors (transport, status, decoding)
/// into this enum. Consumers treat any of these as "the local value is
/// stale, keep what we have".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request never produced a response, like connection loss or DNS
    /// resolution failure.
    ///
    /// The attached string contains the transport error's description.
    #[error("request failed: {0}")]
    Transport(String),
    /// The service rejected our credentials.
    ///
    /// The attached string contains the remote service's response.
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    /// The service asked us to slow down.
    ///
    /// Requests are retried a bounded number of times before this becomes
    /// terminal. Carries the server-provided `Retry-After`, if any.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// Any other non-success response status.
    #[error("status {status} from {url}")]
    Status { status: u16, url: String },
    /// The response body did not decode as the expected JSON document.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The request was dropped before it ran, during a purge or shutdown.
    #[error("canceled")]
    Canceled,
    /// An unexpected error in the engine itself.
    #[error("internal error")]
    InternalError,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl FetchError {
    /// Whether waiting and sending the identical request again can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

/// Shorthand for a fetch result.
pub type FetchResult<T = ()> = Result<T, FetchError>;
