//! Best-effort metrics emission.
//!
//! Routing outcomes and provider health snapshots are pushed to an external
//! sink (usage store, dashboard) strictly best-effort: emission is
//! non-blocking and failure to emit never affects routing correctness. The
//! bounded-channel sink drops events once the consumer falls behind and
//! counts the drops instead of applying backpressure.

use crate::breaker::ProviderHealthSnapshot;
use crate::classify::ErrorCategory;
use crate::engine::{RouteMethod, RoutingOutcome};
use crate::install::InstallTier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sink for routing metrics.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    /// Record one routing outcome.
    fn record_outcome(&self, outcome: &RoutingOutcome);

    /// Record the current provider health snapshots.
    fn record_health(&self, snapshots: &[ProviderHealthSnapshot]);
}

// ============================================================================
// Records & events
// ============================================================================

/// Serializable mirror of a routing outcome, without the payload value.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    /// Request id
    pub request_id: Uuid,
    /// Provider that served the request, if any
    pub provider_used: Option<String>,
    /// How the request was served
    pub method: RouteMethod,
    /// Installation tier used for a live call
    pub tier_used: Option<InstallTier>,
    /// End-to-end routing latency in milliseconds
    pub latency_ms: u64,
    /// Whether the request produced a value
    pub success: bool,
    /// Terminal error category on failure
    pub error_category: Option<ErrorCategory>,
    /// When the outcome was recorded
    pub recorded_at: DateTime<Utc>,
}

impl From<&RoutingOutcome> for OutcomeRecord {
    fn from(outcome: &RoutingOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            provider_used: outcome.provider_used.clone(),
            method: outcome.method,
            tier_used: outcome.tier_used,
            latency_ms: outcome.latency.as_millis() as u64,
            success: outcome.success,
            error_category: outcome.error_category,
            recorded_at: Utc::now(),
        }
    }
}

/// Event shipped to the metrics consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsEvent {
    /// One routing outcome
    Outcome(OutcomeRecord),
    /// Provider health snapshots
    Health(Vec<ProviderHealthSnapshot>),
}

// ============================================================================
// Sinks
// ============================================================================

/// Sink that discards everything (tests, metrics disabled).
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_outcome(&self, _outcome: &RoutingOutcome) {}
    fn record_health(&self, _snapshots: &[ProviderHealthSnapshot]) {}
}

/// Sink that logs outcomes at debug level.
#[derive(Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record_outcome(&self, outcome: &RoutingOutcome) {
        debug!(
            request_id = %outcome.request_id,
            method = %outcome.method,
            provider = outcome.provider_used.as_deref().unwrap_or("-"),
            success = outcome.success,
            latency_ms = outcome.latency.as_millis() as u64,
            "Routing outcome"
        );
    }

    fn record_health(&self, snapshots: &[ProviderHealthSnapshot]) {
        for snapshot in snapshots {
            debug!(
                provider = %snapshot.provider_id,
                state = ?snapshot.state,
                failures = snapshot.consecutive_failures,
                "Provider health"
            );
        }
    }
}

/// Bounded-channel sink feeding an external consumer task.
#[derive(Debug)]
pub struct ChannelMetrics {
    tx: mpsc::Sender<MetricsEvent>,
    dropped: AtomicU64,
}

impl ChannelMetrics {
    /// Create the sink and the receiving half for the consumer.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricsEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: MetricsEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 1000 == 0 {
                warn!(dropped = total, "Metrics queue full, dropping events");
            }
        }
    }
}

impl MetricsSink for ChannelMetrics {
    fn record_outcome(&self, outcome: &RoutingOutcome) {
        self.push(MetricsEvent::Outcome(OutcomeRecord::from(outcome)));
    }

    fn record_health(&self, snapshots: &[ProviderHealthSnapshot]) {
        self.push(MetricsEvent::Health(snapshots.to_vec()));
    }
}

// ============================================================================
// Tests
// ============================================================================
