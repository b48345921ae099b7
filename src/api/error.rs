//! Typed errors for API calls and the log stream.
//!
//! Callers match on these at the command boundary to choose exit wording;
//! none of them is retried automatically.

use thiserror::Error;

/// Failure of a request/response API call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No token is configured. Raised before any network traffic.
    #[error("Not authenticated. Please run 'mdk login' first")]
    NotAuthenticated,

    /// The backend rejected the request because the deployment is in the
    /// wrong lifecycle state (HTTP 400).
    #[error("{0}")]
    InvalidState(String),

    /// HTTP 404.
    #[error("{0}")]
    NotFound(String),

    /// HTTP 401. The stored token is missing, expired or revoked.
    #[error("Authentication failed. Please run 'mdk login' again")]
    Unauthorized,

    /// Any other non-2xx response.
    #[error("Backend returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Connection, DNS or protocol failure below the HTTP layer.
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body did not match the expected envelope shape.
    #[error("Unexpected response from backend: {0}")]
    Decode(String),
}

/// Failure of the live log stream.
///
/// A stream error never implies anything about the deployment itself; the
/// job keeps executing server-side and its outcome must be fetched over the
/// regular API.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No token is configured. Raised before dialing.
    #[error("Not authenticated. Please run 'mdk login' first")]
    NotAuthenticated,

    /// The server answered the subscription request with a non-success
    /// status instead of a stream.
    #[error("Log stream rejected with {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The underlying connection failed while dialing or reading.
    #[error("Log stream connection failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The connection closed before the completion signal arrived. Entries
    /// received so far remain valid.
    #[error("Log stream disconnected before the deployment finished")]
    Interrupted,
}

/// Failure while observing a deployment, from either half of the watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Api(#[from] ApiError),
}
