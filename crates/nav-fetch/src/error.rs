//! Error type for the fetch orchestration.
//!
//! None of these propagate to callers of the orchestration entry points:
//! every failure resolves as a rejected cache entry with the fixed retry
//! backoff, and callers re-poll the cache.

use http::StatusCode;

use crate::convert::ConvertError;
use crate::decode::DecodeError;
use crate::transport::TransportError;

/// What went wrong while fetching and storing a response.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The payload could not be converted into a route tree.
    #[error(transparent)]
    Convert(#[from] ConvertError),

    /// Unexpected HTTP status.
    #[error("unexpected status {0}")]
    Status(StatusCode),

    /// The server signalled an intentional miss (204).
    #[error("intentional miss")]
    IntentionalMiss,

    /// The response had no body to decode.
    #[error("response body missing")]
    MissingBody,

    /// The response is not a navigation payload.
    #[error("unexpected content type {0:?}")]
    ContentType(Option<String>),

    /// The response came from a different deployment; the client must
    /// hard-navigate to pick up the new build.
    #[error("deployment mismatch: expected `{expected}`, got `{got}`")]
    DeploymentMismatch { expected: String, got: String },

    /// The response contradicts the cached route structure.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl FetchError {
    /// Structural violations indicate a server/client protocol mismatch
    /// rather than a transient condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Convert(_) | Self::Protocol(_))
    }
}

/// Log a fetch failure at the severity its class deserves.
pub(crate) fn log_fetch_failure(context: &str, err: &FetchError) {
    if err.is_protocol_violation() {
        tracing::error!(error = %err, "{context}: protocol violation; entry rejected");
    } else if matches!(err, FetchError::DeploymentMismatch { .. }) {
        tracing::warn!(error = %err, "{context}: stale deployment; entry rejected");
    } else {
        tracing::debug!(error = %err, "{context}: entry rejected with backoff");
    }
}
