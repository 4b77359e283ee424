//! Error classification.
//!
//! `classify` is a pure, total function from a routing error to exactly one
//! `ErrorCategory`. Unrecognized errors default to `Permanent`, failing safe
//! toward "don't retry indefinitely". The classifier is injected into
//! breaker accounting by the engine; it holds no state of its own.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Provider fault category.
///
/// Routing implications:
/// - `Transient`: safe to retry immediately; weight 0 toward the breaker.
/// - `RateLimit`: extended cool-down for the specific provider.
/// - `Timeout`: counts toward the failure threshold at normal weight.
///   Transport-level unreachability (connection refused, DNS failure) also
///   lands here so a dead provider trips its breaker; `Transient` is
///   reserved for reachable-but-hiccuping providers.
/// - `Permanent`: elevated weight, trips the breaker faster since retrying
///   is futile.
/// - `ContextLimit`: configuration problem (payload too large); never
///   retried, surfaced distinctly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Momentary fault, retry immediately
    Transient,
    /// Provider-side rate limiting
    RateLimit,
    /// Deadline exceeded or provider unreachable
    Timeout,
    /// Fault that will not heal by retrying
    Permanent,
    /// Payload exceeds the provider's input limits
    ContextLimit,
}

impl ErrorCategory {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::ContextLimit => "context_limit",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a routing error to its category.
#[must_use]
pub fn classify(error: &Error) -> ErrorCategory {
    match error {
        Error::Timeout(_) => ErrorCategory::Timeout,
        Error::RateLimited { .. } => ErrorCategory::RateLimit,
        Error::PayloadTooLarge(_) => ErrorCategory::ContextLimit,
        Error::Transport(message) => classify_transport(message),
        Error::Api { status, message } => classify_api(*status, message),
        Error::Process(message) => classify_process(message),
        Error::InvalidResponse(_) | Error::Config(_) => ErrorCategory::Permanent,
    }
}

fn classify_transport(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    // Mid-stream interruptions are worth an immediate retry.
    if contains_any(&lower, &["reset", "broken pipe", "eof"]) {
        return ErrorCategory::Transient;
    }
    if contains_any(
        &lower,
        &["connection refused", "unreachable", "dns", "failed to resolve", "connect"],
    ) {
        // The provider is not answering at all; count it like a timed-out
        // handshake so repeated unreachability opens the circuit.
        return ErrorCategory::Timeout;
    }
    ErrorCategory::Transient
}

fn classify_api(status: u16, message: &str) -> ErrorCategory {
    match status {
        429 => ErrorCategory::RateLimit,
        408 | 504 => ErrorCategory::Timeout,
        500 | 502 | 503 => ErrorCategory::Transient,
        413 => ErrorCategory::ContextLimit,
        _ => classify_api_message(message),
    }
}

fn classify_api_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if contains_any(&lower, &["rate limit", "quota exceeded", "too many requests"]) {
        ErrorCategory::RateLimit
    } else if contains_any(&lower, &["context length", "token limit", "too many tokens", "payload too large"]) {
        ErrorCategory::ContextLimit
    } else if contains_any(&lower, &["overloaded", "temporarily", "try again"]) {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Permanent
    }
}

fn classify_process(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if contains_any(&lower, &["killed", "signal"]) {
        ErrorCategory::Transient
    } else {
        // Missing binary, bad arguments, non-zero exit: retrying is futile.
        ErrorCategory::Permanent
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
