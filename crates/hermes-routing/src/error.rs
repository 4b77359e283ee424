//! Error types for hermes-routing

use thiserror::Error;

/// Routing error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (fatal at startup, never at routing time)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport-level failure (connect, DNS, broken pipe)
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider returned a non-success API response
    #[error("api error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or status text
        message: String,
    },

    /// Provider signalled rate limiting
    #[error("rate limited")]
    RateLimited {
        /// Seconds suggested by a retry-after header, if present
        retry_after_secs: Option<u64>,
    },

    /// The invocation exceeded its deadline
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Request payload exceeded the provider's size limits
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Local provider process failed to spawn or exited abnormally
    #[error("provider process error: {0}")]
    Process(String),

    /// Provider response could not be parsed
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
