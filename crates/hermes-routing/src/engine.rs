//! Routing decision engine.
//!
//! Top-level orchestrator: given a capability request, consults the cache,
//! the registry, the circuit breaker, and the installation resolver to
//! produce a result, and records metrics. Provider-level errors are fully
//! contained here: `route` always returns an outcome, never an error.

use crate::breaker::CircuitBreaker;
use crate::classify::{classify, ErrorCategory};
use crate::config::RoutingConfig;
use crate::error::Result;
use crate::install::{InstallResolver, InstallTier, StrategyResolver};
use crate::metrics::MetricsSink;
use crate::registry::{ProbeStatus, Prober, ProviderRegistry, TransportKind};
use crate::request::{CapabilityFamily, CapabilityRequest};
use hermes_cache::ResultCache;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Outcomes
// ============================================================================

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    /// Served from the result cache
    Cache,
    /// Served by a primary provider
    Live,
    /// Served (or attempted) via the Tier-3 fallback endpoint
    FallbackApi,
}

impl RouteMethod {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Live => "live",
            Self::FallbackApi => "fallback_api",
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once result record for one routing call.
///
/// Downstream consumers rely on `method` to disclose degraded-mode
/// operation, so the Cache/Live/FallbackApi distinction is preserved
/// end-to-end. The enhancement payload rides along in `value`.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    /// Id of the originating request
    pub request_id: Uuid,
    /// Provider that handled (or last attempted) the request
    pub provider_used: Option<String>,
    /// How the request was served
    pub method: RouteMethod,
    /// Installation tier used for a live call
    pub tier_used: Option<InstallTier>,
    /// End-to-end latency of the routing call
    pub latency: Duration,
    /// Whether a value was produced
    pub success: bool,
    /// Terminal error category when `success` is false (or the category
    /// that stopped the candidate loop)
    pub error_category: Option<ErrorCategory>,
    /// The enhancement payload
    pub value: Option<serde_json::Value>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL for live-query results populated into the cache.
    pub live_ttl: Duration,
    /// Minimum time budget granted to the fallback call even when the
    /// request deadline is already spent.
    pub min_fallback_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            live_ttl: Duration::from_secs(300),
            min_fallback_timeout: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Routing decision engine; the composition root owns every collaborator
/// explicitly; there is no ambient global state.
pub struct RoutingEngine {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResultCache>,
    resolver: Arc<dyn StrategyResolver>,
    prober: Prober,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl RoutingEngine {
    /// Create an engine from explicitly constructed collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ResultCache>,
        resolver: Arc<dyn StrategyResolver>,
        prober: Prober,
        metrics: Arc<dyn MetricsSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            cache,
            resolver,
            prober,
            metrics,
            config,
        }
    }

    /// Build an engine (and its collaborators) from a validated
    /// configuration. Fails fast on configuration errors; this is the only
    /// point where routing setup may abort.
    pub fn from_config(config: &RoutingConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ProviderRegistry::new(
            config.descriptors(),
            config.fallback_endpoints(),
        )?);
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let cache = Arc::new(ResultCache::new(config.cache_config()));
        let resolver = Arc::new(InstallResolver::new(config.install_config()));
        let prober = Prober::new(config.probe_timeout());
        Ok(Self::new(
            registry,
            breaker,
            cache,
            resolver,
            prober,
            metrics,
            config.engine_config(),
        ))
    }

    /// The result cache (for sweeper spawning and namespace invalidation).
    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Drop every cached result for a family. Returns the entry count removed.
    pub fn invalidate_family(&self, family: CapabilityFamily) -> usize {
        self.cache.invalidate_prefix(&format!("{}:", family.as_str()))
    }

    /// Route one capability request.
    ///
    /// Never returns an error and never panics: total failure surfaces as
    /// an outcome with `success == false` and a category attached.
    #[instrument(skip(self, request), fields(request_id = %request.id, family = %request.family))]
    pub async fn route(&self, request: &CapabilityRequest) -> RoutingOutcome {
        let started = Instant::now();
        let cache_key = request.cache_key();

        if let Some(value) = self.cache.get(&cache_key) {
            debug!("Cache hit");
            return self.finish(RoutingOutcome {
                request_id: request.id,
                provider_used: None,
                method: RouteMethod::Cache,
                tier_used: None,
                latency: started.elapsed(),
                success: true,
                error_category: None,
                value: Some(value),
            });
        }

        let payload = request.to_payload();
        let mut last_category: Option<ErrorCategory> = None;
        // Probe results are intentionally scoped to this one decision so a
        // recovering provider is re-checked on the next request.
        let mut probe_memo: HashMap<String, ProbeStatus> = HashMap::new();

        for descriptor in self.registry.candidates(request.family) {
            let remaining = request.deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                debug!("Deadline exhausted, short-circuiting to fallback");
                break;
            }

            if !self.breaker.allow_request(&descriptor.id) {
                debug!(provider = %descriptor.id, "Skipping provider, circuit open");
                continue;
            }

            if descriptor.transport == TransportKind::Network {
                let status = match probe_memo.get(&descriptor.id) {
                    Some(status) => *status,
                    None => {
                        let status = self.prober.probe(descriptor).await;
                        probe_memo.insert(descriptor.id.clone(), status);
                        status
                    }
                };
                if status != ProbeStatus::Available {
                    // A failed handshake counts like a timed-out call so a
                    // dead provider eventually opens its circuit.
                    self.breaker
                        .record_failure(&descriptor.id, ErrorCategory::Timeout);
                    last_category = Some(ErrorCategory::Timeout);
                    continue;
                }
            }

            let strategy = match self.resolver.resolve(descriptor).await {
                Ok(strategy) => strategy,
                Err(e) => {
                    let category = classify(&e);
                    warn!(provider = %descriptor.id, error = %e, "Failed to resolve provider");
                    self.breaker.record_failure(&descriptor.id, category);
                    last_category = Some(category);
                    continue;
                }
            };
            if strategy.tier == InstallTier::Temporary {
                // Hint is informational only; it must not alter this call.
                let _ = self.resolver.note_temporary_use(&descriptor.id);
            }

            match strategy.transport.invoke(&payload, remaining).await {
                Ok(value) => {
                    self.breaker.record_success(&descriptor.id);
                    self.cache
                        .set(&cache_key, value.clone(), self.config.live_ttl);
                    info!(provider = %descriptor.id, tier = %strategy.tier, "Live call succeeded");
                    return self.finish(RoutingOutcome {
                        request_id: request.id,
                        provider_used: Some(descriptor.id.clone()),
                        method: RouteMethod::Live,
                        tier_used: Some(strategy.tier),
                        latency: started.elapsed(),
                        success: true,
                        error_category: None,
                        value: Some(value),
                    });
                }
                Err(e) => {
                    let category = classify(&e);
                    warn!(provider = %descriptor.id, error = %e, category = %category, "Live call failed");
                    self.breaker.record_failure(&descriptor.id, category);
                    last_category = Some(category);
                    if category == ErrorCategory::ContextLimit {
                        // The payload is oversized for the family; retrying
                        // elsewhere (including the fallback) cannot help.
                        return self.finish(RoutingOutcome {
                            request_id: request.id,
                            provider_used: Some(descriptor.id.clone()),
                            method: RouteMethod::Live,
                            tier_used: Some(strategy.tier),
                            latency: started.elapsed(),
                            success: false,
                            error_category: Some(category),
                            value: None,
                        });
                    }
                }
            }
        }

        self.finish(
            self.route_fallback(request, &payload, started, last_category)
                .await,
        )
    }

    /// Tier-3 fallback: always attempted once the candidates are exhausted
    /// or blocked, and never subject to the circuit breaker.
    async fn route_fallback(
        &self,
        request: &CapabilityRequest,
        payload: &serde_json::Value,
        started: Instant,
        last_category: Option<ErrorCategory>,
    ) -> RoutingOutcome {
        let failure = |category: Option<ErrorCategory>| RoutingOutcome {
            request_id: request.id,
            provider_used: None,
            method: RouteMethod::FallbackApi,
            tier_used: Some(InstallTier::FallbackApi),
            latency: started.elapsed(),
            success: false,
            error_category: category.or(Some(ErrorCategory::Permanent)),
            value: None,
        };

        let Some(endpoint) = self.registry.fallback_endpoint(request.family) else {
            warn!("No fallback endpoint configured for family");
            return failure(last_category);
        };
        let strategy = match self.resolver.fallback(endpoint) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(error = %e, "Failed to build fallback strategy");
                return failure(Some(classify(&e)));
            }
        };

        // The fallback gets a floor budget even when the deadline is spent.
        let timeout = request
            .deadline
            .saturating_sub(started.elapsed())
            .max(self.config.min_fallback_timeout);

        match strategy.transport.invoke(payload, timeout).await {
            Ok(value) => {
                info!("Fallback call succeeded (degraded mode)");
                RoutingOutcome {
                    request_id: request.id,
                    provider_used: None,
                    method: RouteMethod::FallbackApi,
                    tier_used: Some(InstallTier::FallbackApi),
                    latency: started.elapsed(),
                    success: true,
                    error_category: None,
                    // Degraded-mode data is not cached; a healthy provider
                    // should repopulate the entry.
                    value: Some(value),
                }
            }
            Err(e) => {
                let category = classify(&e);
                warn!(error = %e, category = %category, "Fallback call failed");
                failure(Some(category))
            }
        }
    }

    /// Emit metrics for a finished outcome. Best-effort: sink failures are
    /// invisible to the caller.
    fn finish(&self, outcome: RoutingOutcome) -> RoutingOutcome {
        self.metrics.record_outcome(&outcome);
        self.metrics.record_health(&self.breaker.snapshots());
        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::error::Error;
    use crate::install::ExecutionStrategy;
    use crate::metrics::{MockMetricsSink, NullMetrics};
    use crate::registry::ProviderDescriptor;
    use crate::transport::CapabilityTransport;
    use async_trait::async_trait;
    use hermes_cache::CacheConfig;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ── Stubs ───────────────────────────────────────────────────

    /// Transport that returns a fixed response or error per call.
    struct ScriptedTransport {
        response: std::result::Result<serde_json::Value, fn() -> Error>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn ok(value: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(value),
                calls: AtomicU32::new(0),
            })
        }

        fn failing(make_error: fn() -> Error) -> Arc<Self> {
            Arc::new(Self {
                response: Err(make_error),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CapabilityTransport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::LocalProcess
        }

        async fn invoke(
            &self,
            _payload: &serde_json::Value,
            _timeout: Duration,
        ) -> crate::error::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(value) => Ok(value.clone()),
                Err(make_error) => Err(make_error()),
            }
        }
    }

    /// Resolver wired to canned transports instead of real processes.
    struct StubResolver {
        by_provider: StdHashMap<String, Arc<ScriptedTransport>>,
        fallback: Arc<ScriptedTransport>,
    }

    #[async_trait]
    impl StrategyResolver for StubResolver {
        async fn resolve(
            &self,
            descriptor: &ProviderDescriptor,
        ) -> crate::error::Result<ExecutionStrategy> {
            let transport = self
                .by_provider
                .get(&descriptor.id)
                .cloned()
                .ok_or_else(|| Error::Transport(format!("unknown provider {}", descriptor.id)))?;
            Ok(ExecutionStrategy {
                tier: descriptor.install_tier,
                transport,
            })
        }

        fn fallback(&self, _endpoint: &str) -> crate::error::Result<ExecutionStrategy> {
            Ok(ExecutionStrategy {
                tier: InstallTier::FallbackApi,
                transport: self.fallback.clone(),
            })
        }

        fn note_temporary_use(&self, _provider_id: &str) -> Option<crate::install::UpgradeHint> {
            None
        }
    }

    // ── Fixtures ────────────────────────────────────────────────

    fn descriptor(id: &str, priority: u32) -> ProviderDescriptor {
        ProviderDescriptor {
            id: id.to_string(),
            family: CapabilityFamily::PatternAnalysis,
            priority,
            transport: TransportKind::LocalProcess,
            install_tier: InstallTier::Permanent,
            capabilities: vec![],
            command: Some("unused".to_string()),
            args: vec![],
            endpoint: None,
            fallback_endpoint: None,
        }
    }

    fn registry(descriptors: Vec<ProviderDescriptor>) -> Arc<ProviderRegistry> {
        let fallbacks = CapabilityFamily::all()
            .iter()
            .map(|f| (*f, format!("https://fallback.example/{f}")))
            .collect();
        Arc::new(ProviderRegistry::new(descriptors, fallbacks).unwrap())
    }

    fn engine(
        descriptors: Vec<ProviderDescriptor>,
        resolver: StubResolver,
        metrics: Arc<dyn MetricsSink>,
    ) -> RoutingEngine {
        RoutingEngine::new(
            registry(descriptors),
            Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            })),
            Arc::new(ResultCache::new(CacheConfig::default())),
            Arc::new(resolver),
            Prober::new(Duration::from_millis(250)),
            metrics,
            EngineConfig::default(),
        )
    }

    fn request() -> CapabilityRequest {
        CapabilityRequest::new(CapabilityFamily::PatternAnalysis, "find repetition")
    }

    // ── Scenarios ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_cold_start_then_warm_cache() {
        let primary = ScriptedTransport::ok(json!({"insight": "cycles"}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([("primary".to_string(), primary.clone())]),
            fallback: ScriptedTransport::ok(json!({})),
        };
        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(NullMetrics));

        let cold = engine.route(&request()).await;
        assert_eq!(cold.method, RouteMethod::Live);
        assert_eq!(cold.provider_used.as_deref(), Some("primary"));
        assert!(cold.success);
        assert_eq!(cold.value, Some(json!({"insight": "cycles"})));
        assert_eq!(cold.tier_used, Some(InstallTier::Permanent));

        let warm = engine.route(&request()).await;
        assert_eq!(warm.method, RouteMethod::Cache);
        assert!(warm.success);
        assert_eq!(warm.value, Some(json!({"insight": "cycles"})));
        // The provider was only invoked once.
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_primary_down_secondary_serves() {
        let primary = ScriptedTransport::failing(|| Error::Timeout(100));
        let secondary = ScriptedTransport::ok(json!({"via": "secondary"}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([
                ("primary".to_string(), primary.clone()),
                ("secondary".to_string(), secondary.clone()),
            ]),
            fallback: ScriptedTransport::ok(json!({})),
        };
        let engine = engine(
            vec![descriptor("primary", 1), descriptor("secondary", 2)],
            resolver,
            Arc::new(NullMetrics),
        );

        let outcome = engine.route(&request()).await;
        assert_eq!(outcome.method, RouteMethod::Live);
        assert_eq!(outcome.provider_used.as_deref(), Some("secondary"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_blocks_primary_after_trip() {
        let primary = ScriptedTransport::failing(|| Error::Timeout(100));
        let secondary = ScriptedTransport::ok(json!({"via": "secondary"}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([
                ("primary".to_string(), primary.clone()),
                ("secondary".to_string(), secondary.clone()),
            ]),
            fallback: ScriptedTransport::ok(json!({})),
        };
        let engine = engine(
            vec![descriptor("primary", 1), descriptor("secondary", 2)],
            resolver,
            Arc::new(NullMetrics),
        );

        // Threshold is 2: two distinct queries trip the primary's breaker.
        for i in 0..2 {
            let req =
                CapabilityRequest::new(CapabilityFamily::PatternAnalysis, format!("q{i}"));
            let outcome = engine.route(&req).await;
            assert_eq!(outcome.provider_used.as_deref(), Some("secondary"));
        }
        assert_eq!(primary.calls(), 2);

        // Third query: primary skipped without an invoke.
        let req = CapabilityRequest::new(CapabilityFamily::PatternAnalysis, "q-final");
        let outcome = engine.route(&req).await;
        assert_eq!(outcome.provider_used.as_deref(), Some("secondary"));
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_total_outage_uses_fallback() {
        let primary = ScriptedTransport::failing(|| Error::Timeout(100));
        let fallback = ScriptedTransport::ok(json!({"degraded": true}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([("primary".to_string(), primary.clone())]),
            fallback: fallback.clone(),
        };
        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(NullMetrics));

        let outcome = engine.route(&request()).await;
        assert_eq!(outcome.method, RouteMethod::FallbackApi);
        assert!(outcome.success);
        assert_eq!(outcome.value, Some(json!({"degraded": true})));
        assert_eq!(outcome.tier_used, Some(InstallTier::FallbackApi));
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_results_not_cached() {
        let fallback = ScriptedTransport::ok(json!({"degraded": true}));
        let resolver = StubResolver {
            by_provider: StdHashMap::new(),
            fallback: fallback.clone(),
        };
        let engine = engine(
            vec![descriptor("primary", 1)],
            resolver,
            Arc::new(NullMetrics),
        );

        let first = engine.route(&request()).await;
        assert_eq!(first.method, RouteMethod::FallbackApi);
        let second = engine.route(&request()).await;
        assert_eq!(second.method, RouteMethod::FallbackApi);
        assert_eq!(fallback.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_structured() {
        let primary = ScriptedTransport::failing(|| Error::Timeout(100));
        let fallback = ScriptedTransport::failing(|| Error::Transport("connection refused".into()));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([("primary".to_string(), primary)]),
            fallback,
        };
        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(NullMetrics));

        let outcome = engine.route(&request()).await;
        assert_eq!(outcome.method, RouteMethod::FallbackApi);
        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Timeout));
        assert!(outcome.value.is_none());
    }

    #[tokio::test]
    async fn test_context_limit_stops_routing() {
        let primary = ScriptedTransport::failing(|| Error::PayloadTooLarge("2MB".into()));
        let secondary = ScriptedTransport::ok(json!({"via": "secondary"}));
        let fallback = ScriptedTransport::ok(json!({}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([
                ("primary".to_string(), primary.clone()),
                ("secondary".to_string(), secondary.clone()),
            ]),
            fallback: fallback.clone(),
        };
        let engine = engine(
            vec![descriptor("primary", 1), descriptor("secondary", 2)],
            resolver,
            Arc::new(NullMetrics),
        );

        let outcome = engine.route(&request()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::ContextLimit));
        // Neither the next candidate nor the fallback was attempted.
        assert_eq!(secondary.calls(), 0);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_spent_deadline_short_circuits_to_fallback() {
        let primary = ScriptedTransport::ok(json!({"never": "reached"}));
        let fallback = ScriptedTransport::ok(json!({"degraded": true}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([("primary".to_string(), primary.clone())]),
            fallback: fallback.clone(),
        };
        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(NullMetrics));

        let req = request().with_deadline(Duration::ZERO);
        let outcome = engine.route(&req).await;
        assert_eq!(outcome.method, RouteMethod::FallbackApi);
        assert_eq!(primary.calls(), 0);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_metrics_emitted_per_route() {
        let resolver = StubResolver {
            by_provider: StdHashMap::from([(
                "primary".to_string(),
                ScriptedTransport::ok(json!({})),
            )]),
            fallback: ScriptedTransport::ok(json!({})),
        };

        let mut sink = MockMetricsSink::new();
        sink.expect_record_outcome()
            .withf(|outcome| outcome.method == RouteMethod::Live && outcome.success)
            .times(1)
            .return_const(());
        sink.expect_record_health().times(1).return_const(());

        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(sink));
        let outcome = engine.route(&request()).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_invalidate_family() {
        let primary = ScriptedTransport::ok(json!({"v": 1}));
        let resolver = StubResolver {
            by_provider: StdHashMap::from([("primary".to_string(), primary.clone())]),
            fallback: ScriptedTransport::ok(json!({})),
        };
        let engine = engine(vec![descriptor("primary", 1)], resolver, Arc::new(NullMetrics));

        engine.route(&request()).await;
        assert_eq!(engine.invalidate_family(CapabilityFamily::PatternAnalysis), 1);

        // Next call is live again.
        let outcome = engine.route(&request()).await;
        assert_eq!(outcome.method, RouteMethod::Live);
        assert_eq!(primary.calls(), 2);
    }
}
