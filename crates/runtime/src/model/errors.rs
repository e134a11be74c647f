use std::time::Duration;
use thiserror::Error;

/// Errors from model provider calls.
///
/// Every backend maps its native failures into this one type. All variants
/// except [`Rejected`](Self::Rejected) describe transient conditions and are
/// retried by the default policy.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// A network error occurred during the call.
    #[error("network: {0}")]
    Network(String),

    /// The provider returned an error response (5xx, rate limit, overload).
    #[error("provider api: {0}")]
    Api(String),

    /// The request-level timeout fired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The provider response could not be decoded.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The provider refused the request outright (auth, malformed request).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}
