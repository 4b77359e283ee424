//! Provider invocation transports.
//!
//! A transport takes the wire payload and a hard timeout and returns the
//! provider's structured response. Concrete transports (local process
//! stdio, HTTP) are resolved by the installation resolver; the engine only
//! sees the trait.

use crate::error::{Error, Result};
use crate::registry::TransportKind;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Maximum error-body length carried into an `Error` message.
const ERROR_BODY_LIMIT: usize = 512;

/// Abstraction over how a provider is invoked.
#[async_trait]
pub trait CapabilityTransport: Send + Sync {
    /// Transport kind (for logging and outcome records).
    fn kind(&self) -> TransportKind;

    /// Invoke the provider with a hard timeout.
    ///
    /// The future must resolve (or be cancelled) within `timeout`; local
    /// processes are killed on expiry rather than waited out.
    async fn invoke(&self, payload: &serde_json::Value, timeout: Duration)
        -> Result<serde_json::Value>;
}

// ============================================================================
// HTTP
// ============================================================================

/// HTTP transport: POSTs the payload as JSON to a fixed endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for one endpoint.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// The endpoint this transport targets.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CapabilityTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn invoke(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        debug!(endpoint = %self.endpoint, timeout_ms = timeout.as_millis() as u64, "HTTP invoke");
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(timeout.as_millis() as u64)
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(Error::RateLimited { retry_after_secs });
        }
        if status.as_u16() == 413 {
            return Err(Error::PayloadTooLarge(format!(
                "endpoint {} rejected the payload",
                self.endpoint
            )));
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_utf8(&mut body, ERROR_BODY_LIMIT);
            return Err(Error::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }
}

// ============================================================================
// Local process
// ============================================================================

/// Local process transport: spawns the provider per call, writes the
/// payload to stdin as one JSON line, and reads the response from stdout.
pub struct LocalProcessTransport {
    command: String,
    args: Vec<String>,
}

impl LocalProcessTransport {
    /// Create a transport for one executable.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl CapabilityTransport for LocalProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    async fn invoke(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        debug!(command = %self.command, timeout_ms = timeout.as_millis() as u64, "Process invoke");
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("spawn {}: {e}", self.command)))?;

        let mut line = payload.to_string();
        line.push('\n');
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Process(format!("write stdin: {e}")))?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        // Hard timeout: on expiry the future is dropped and kill_on_drop
        // reaps the child.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| Error::Process(format!("wait: {e}")))?;

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            truncate_utf8(&mut stderr, ERROR_BODY_LIMIT);
            return Err(Error::Process(format!(
                "{} exited with {}: {}",
                self.command, output.status, stderr
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::InvalidResponse(format!("stdout not valid JSON: {e}")))
    }
}

/// Truncate to at most `limit` bytes without splitting a character.
fn truncate_utf8(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ============================================================================
// Tests
// ============================================================================
