//! Error types for opentmux-core.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for opentmux-core.
///
/// Process and multiplexer queries deliberately do not surface here; they
/// return sentinel empties so that partial failure never cascades. This type
/// covers the boundaries where a caller can actually act on the error:
/// configuration, the control socket, and the host HTTP client.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure (socket, filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request against the host failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed, oversized, or unexpected control frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}
