//! Per-provider circuit breaker.
//!
//! State machine: `Closed -> (weighted failures >= threshold) -> Open ->
//! (cool-down elapsed) -> HalfOpen -> (trial succeeds) -> Closed`, with
//! `HalfOpen -> (trial fails) -> Open` restarting the cool-down under an
//! exponential backoff multiplier.
//!
//! Health slots live in a sharded map keyed by provider id; every
//! transition happens under that slot's exclusive guard, so
//! `allow_request` and the half-open admission are atomic without a global
//! lock. Exactly one caller is admitted while `HalfOpen`; the rest are
//! short-circuited until the trial resolves.

use crate::classify::ErrorCategory;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Weighted failure count that opens the circuit.
    pub failure_threshold: u32,
    /// Weight applied to `Permanent` failures (>= 1); they trip the breaker
    /// faster since retrying is futile.
    pub permanent_weight: u32,
    /// Base cool-down after the circuit opens.
    pub cooldown: Duration,
    /// Cool-down used when the opening failure was a rate limit.
    pub rate_limit_cooldown: Duration,
    /// Multiplier applied to the cool-down on each failed half-open trial.
    pub backoff_multiplier: f64,
    /// Upper bound for the backed-off cool-down.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            permanent_weight: 2,
            cooldown: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl BreakerConfig {
    /// Validate the configuration, fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker failure_threshold must be >= 1".into(),
            ));
        }
        if self.permanent_weight == 0 {
            return Err(Error::Config("breaker permanent_weight must be >= 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "breaker backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.max_cooldown < self.cooldown {
            return Err(Error::Config(
                "breaker max_cooldown must be >= cooldown".into(),
            ));
        }
        Ok(())
    }

    /// Failure weight for a category.
    ///
    /// `Transient` and `ContextLimit` do not count: the first is safe to
    /// retry, the second is a caller configuration problem, not provider
    /// unhealth.
    #[must_use]
    pub fn weight(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Transient | ErrorCategory::ContextLimit => 0,
            ErrorCategory::RateLimit | ErrorCategory::Timeout => 1,
            ErrorCategory::Permanent => self.permanent_weight,
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Circuit state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are short-circuited until the cool-down elapses
    Open,
    /// One trial call is in flight
    HalfOpen,
}

/// Mutable health record, one per provider, owned by the breaker.
#[derive(Debug)]
struct ProviderHealth {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_count: u32,
    current_cooldown: Duration,
    trial_in_flight: bool,
    failure_counts: HashMap<ErrorCategory, u64>,
}

impl ProviderHealth {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            open_count: 0,
            current_cooldown: cooldown,
            trial_in_flight: false,
            failure_counts: HashMap::new(),
        }
    }
}

/// Read-only health view for metrics emission.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    /// Provider id
    pub provider_id: String,
    /// Current circuit state
    pub state: CircuitState,
    /// Weighted consecutive failure count
    pub consecutive_failures: u32,
    /// Seconds the circuit has been open, if open
    pub open_for_secs: Option<u64>,
    /// Total failures seen per category
    pub failure_counts: HashMap<ErrorCategory, u64>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

// ============================================================================
// CircuitBreaker
// ============================================================================

/// Per-provider circuit breaker over sharded health slots.
#[derive(Debug)]
pub struct CircuitBreaker {
    slots: DashMap<String, ProviderHealth>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker from a validated configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
        }
    }

    /// Whether a call to the provider may proceed.
    ///
    /// `Open` circuits transition to `HalfOpen` once the cool-down has
    /// elapsed, admitting exactly the caller that observed the elapse;
    /// further callers are denied until the trial resolves via
    /// `record_success` or `record_failure`.
    pub fn allow_request(&self, provider_id: &str) -> bool {
        let mut health = self.slot(provider_id);
        match health.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = health
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= health.current_cooldown {
                    health.state = CircuitState::HalfOpen;
                    health.trial_in_flight = true;
                    info!(provider = provider_id, "Circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if health.trial_in_flight {
                    false
                } else {
                    health.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, provider_id: &str) {
        let mut health = self.slot(provider_id);
        health.consecutive_failures = 0;
        if health.state == CircuitState::HalfOpen {
            info!(provider = provider_id, "Trial call succeeded, closing circuit");
            health.state = CircuitState::Closed;
            health.trial_in_flight = false;
            health.opened_at = None;
            health.open_count = 0;
            health.current_cooldown = self.config.cooldown;
        }
    }

    /// Record a failed call with its classified category.
    pub fn record_failure(&self, provider_id: &str, category: ErrorCategory) {
        let mut health = self.slot(provider_id);
        *health.failure_counts.entry(category).or_insert(0) += 1;

        match health.state {
            CircuitState::HalfOpen => {
                // Trial failed: reopen with a longer cool-down.
                health.open_count += 1;
                let backed_off = mul_duration(health.current_cooldown, self.config.backoff_multiplier)
                    .min(self.config.max_cooldown);
                health.current_cooldown = if category == ErrorCategory::RateLimit {
                    backed_off.max(self.config.rate_limit_cooldown)
                } else {
                    backed_off
                };
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                health.trial_in_flight = false;
                warn!(
                    provider = provider_id,
                    category = %category,
                    cooldown_secs = health.current_cooldown.as_secs(),
                    "Trial call failed, reopening circuit"
                );
            }
            CircuitState::Closed => {
                let weight = self.config.weight(category);
                health.consecutive_failures += weight;
                debug!(
                    provider = provider_id,
                    category = %category,
                    weighted_failures = health.consecutive_failures,
                    "Recorded provider failure"
                );
                if weight > 0 && health.consecutive_failures >= self.config.failure_threshold {
                    health.state = CircuitState::Open;
                    health.opened_at = Some(Instant::now());
                    health.open_count += 1;
                    health.current_cooldown = if category == ErrorCategory::RateLimit {
                        self.config.rate_limit_cooldown.max(self.config.cooldown)
                    } else {
                        self.config.cooldown
                    };
                    warn!(
                        provider = provider_id,
                        category = %category,
                        cooldown_secs = health.current_cooldown.as_secs(),
                        "Failure threshold reached, opening circuit"
                    );
                }
            }
            CircuitState::Open => {
                // Stragglers from calls admitted before the trip; counted
                // for diagnostics only.
                health.consecutive_failures += self.config.weight(category);
            }
        }
    }

    /// Current state for a provider (`Closed` if never seen).
    #[must_use]
    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.slots
            .get(provider_id)
            .map(|h| h.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Health snapshot for one provider.
    #[must_use]
    pub fn snapshot(&self, provider_id: &str) -> Option<ProviderHealthSnapshot> {
        self.slots
            .get(provider_id)
            .map(|h| Self::to_snapshot(provider_id, &h))
    }

    /// Health snapshots for every tracked provider.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        self.slots
            .iter()
            .map(|entry| Self::to_snapshot(entry.key(), entry.value()))
            .collect()
    }

    fn to_snapshot(provider_id: &str, health: &ProviderHealth) -> ProviderHealthSnapshot {
        ProviderHealthSnapshot {
            provider_id: provider_id.to_string(),
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            open_for_secs: health.opened_at.map(|t| t.elapsed().as_secs()),
            failure_counts: health.failure_counts.clone(),
            taken_at: Utc::now(),
        }
    }

    fn slot(&self, provider_id: &str) -> dashmap::mapref::one::RefMut<'_, String, ProviderHealth> {
        self.slots
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderHealth::new(self.config.cooldown))
    }
}

fn mul_duration(d: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            permanent_weight: 2,
            cooldown: Duration::from_millis(cooldown_ms),
            rate_limit_cooldown: Duration::from_millis(cooldown_ms * 4),
            backoff_multiplier: 2.0,
            max_cooldown: Duration::from_millis(cooldown_ms * 20),
        })
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());

        let zero_threshold = BreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(zero_threshold.validate().is_err());

        let bad_multiplier = BreakerConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad_multiplier.validate().is_err());
    }

    #[test]
    fn test_trip_at_threshold() {
        let cb = breaker(10_000);
        for _ in 0..4 {
            cb.record_failure("p1", ErrorCategory::Timeout);
            assert_eq!(cb.state("p1"), CircuitState::Closed);
        }
        cb.record_failure("p1", ErrorCategory::Timeout);
        assert_eq!(cb.state("p1"), CircuitState::Open);
        assert!(!cb.allow_request("p1"));
    }

    #[test]
    fn test_permanent_weight_trips_faster() {
        let cb = breaker(10_000);
        // Weight 2: three permanent failures reach the threshold of 5.
        cb.record_failure("p1", ErrorCategory::Permanent);
        cb.record_failure("p1", ErrorCategory::Permanent);
        assert_eq!(cb.state("p1"), CircuitState::Closed);
        cb.record_failure("p1", ErrorCategory::Permanent);
        assert_eq!(cb.state("p1"), CircuitState::Open);
    }

    #[test]
    fn test_transient_never_trips() {
        let cb = breaker(10_000);
        for _ in 0..50 {
            cb.record_failure("p1", ErrorCategory::Transient);
        }
        assert_eq!(cb.state("p1"), CircuitState::Closed);
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breaker(10_000);
        for _ in 0..4 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        cb.record_success("p1");
        for _ in 0..4 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        assert_eq!(cb.state("p1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_close() {
        let cb = breaker(20);
        for _ in 0..5 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        assert!(!cb.allow_request("p1"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request("p1"));
        assert_eq!(cb.state("p1"), CircuitState::HalfOpen);

        cb.record_success("p1");
        assert_eq!(cb.state("p1"), CircuitState::Closed);
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn test_half_open_failure_reopens_with_backoff() {
        let cb = breaker(20);
        for _ in 0..5 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request("p1"));

        cb.record_failure("p1", ErrorCategory::Timeout);
        assert_eq!(cb.state("p1"), CircuitState::Open);

        // Cool-down doubled: the original 20ms is no longer enough.
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cb.allow_request("p1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn test_half_open_single_admission_concurrent() {
        let cb = Arc::new(breaker(10));
        for _ in 0..5 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        std::thread::sleep(Duration::from_millis(20));

        let admitted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = Arc::clone(&cb);
            let admitted = Arc::clone(&admitted);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                if cb.allow_request("p1") {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state("p1"), CircuitState::HalfOpen);

        // Still denied until the trial resolves.
        assert!(!cb.allow_request("p1"));
        cb.record_success("p1");
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn test_rate_limit_extended_cooldown() {
        let cb = breaker(20);
        for _ in 0..5 {
            cb.record_failure("p1", ErrorCategory::RateLimit);
        }
        assert_eq!(cb.state("p1"), CircuitState::Open);

        // Base cool-down elapsed, but the rate-limit cool-down (80ms) has not.
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cb.allow_request("p1"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn test_snapshot() {
        let cb = breaker(10_000);
        cb.record_failure("p1", ErrorCategory::Timeout);
        cb.record_failure("p1", ErrorCategory::Permanent);

        let snap = cb.snapshot("p1").unwrap();
        assert_eq!(snap.provider_id, "p1");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.failure_counts.get(&ErrorCategory::Timeout), Some(&1));
        assert_eq!(snap.failure_counts.get(&ErrorCategory::Permanent), Some(&1));
        assert!(cb.snapshot("unknown").is_none());
        assert_eq!(cb.snapshots().len(), 1);
    }

    #[test]
    fn test_providers_tracked_independently() {
        let cb = breaker(10_000);
        for _ in 0..5 {
            cb.record_failure("p1", ErrorCategory::Timeout);
        }
        assert_eq!(cb.state("p1"), CircuitState::Open);
        assert_eq!(cb.state("p2"), CircuitState::Closed);
        assert!(cb.allow_request("p2"));
    }
}
