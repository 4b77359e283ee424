//! Routing configuration.
//!
//! Loaded once at startup from TOML, validated fail-fast, and immutable
//! thereafter. An invalid configuration is the only condition allowed to
//! abort startup; everything after `validate()` succeeds is handled inside
//! the routing loop.

use crate::breaker::BreakerConfig;
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::install::InstallConfig;
use crate::registry::ProviderDescriptor;
use crate::request::CapabilityFamily;
use hermes_cache::CacheConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Sections
// ============================================================================

/// `[breaker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    /// Weighted failure count that opens a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Weight applied to permanent failures.
    #[serde(default = "default_permanent_weight")]
    pub permanent_weight: u32,
    /// Base cool-down in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cool-down in seconds after a rate-limit trip.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Backoff multiplier for repeated trips.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for the backed-off cool-down, in seconds.
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_permanent_weight() -> u32 {
    2
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_rate_limit_cooldown_secs() -> u64 {
    120
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_cooldown_secs() -> u64 {
    600
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            permanent_weight: default_permanent_weight(),
            cooldown_secs: default_cooldown_secs(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Entry ceiling before LRU eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Background sweep interval in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// TTL for short-lived live-query results, in seconds.
    #[serde(default = "default_live_ttl_secs")]
    pub live_ttl_secs: u64,
    /// TTL for long-lived pattern data, in seconds.
    #[serde(default = "default_pattern_ttl_secs")]
    pub pattern_ttl_secs: u64,
}

fn default_max_entries() -> usize {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_live_ttl_secs() -> u64 {
    300
}
fn default_pattern_ttl_secs() -> u64 {
    86_400
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            live_ttl_secs: default_live_ttl_secs(),
            pattern_ttl_secs: default_pattern_ttl_secs(),
        }
    }
}

/// `[install]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallSection {
    /// Tier-2 uses before an upgrade hint.
    #[serde(default = "default_hint_threshold")]
    pub hint_threshold: u32,
    /// Hint cool-down in seconds.
    #[serde(default = "default_hint_cooldown_secs")]
    pub hint_cooldown_secs: u64,
}

fn default_hint_threshold() -> u32 {
    3
}
fn default_hint_cooldown_secs() -> u64 {
    86_400
}

impl Default for InstallSection {
    fn default() -> Self {
        Self {
            hint_threshold: default_hint_threshold(),
            hint_cooldown_secs: default_hint_cooldown_secs(),
        }
    }
}

/// `[probe]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSection {
    /// Per-probe time box in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    250
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// `[fallback]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackSection {
    /// Minimum time budget for the fallback call, in seconds.
    #[serde(default = "default_min_fallback_timeout_secs")]
    pub min_timeout_secs: u64,
    /// Per-family fallback endpoint URLs.
    #[serde(default)]
    pub endpoints: HashMap<CapabilityFamily, String>,
}

fn default_min_fallback_timeout_secs() -> u64 {
    2
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            min_timeout_secs: default_min_fallback_timeout_secs(),
            endpoints: HashMap::new(),
        }
    }
}

// ============================================================================
// RoutingConfig
// ============================================================================

/// Complete routing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    /// Circuit breaker thresholds and cool-downs.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Cache ceiling and tier TTLs.
    #[serde(default)]
    pub cache: CacheSection,
    /// Installation-hint thresholds.
    #[serde(default)]
    pub install: InstallSection,
    /// Availability probe time box.
    #[serde(default)]
    pub probe: ProbeSection,
    /// Fallback endpoints and floor timeout.
    #[serde(default)]
    pub fallback: FallbackSection,
    /// Provider descriptors.
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

impl RoutingConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Validate everything that must hold before serving requests.
    pub fn validate(&self) -> Result<()> {
        self.breaker_config().validate()?;
        self.install_config().validate()?;
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache max_entries must be >= 1".into()));
        }
        if self.probe.timeout_ms == 0 {
            return Err(Error::Config("probe timeout_ms must be >= 1".into()));
        }
        // Descriptor and fallback coherence is enforced by the registry.
        Ok(())
    }

    /// Breaker configuration.
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            permanent_weight: self.breaker.permanent_weight,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            rate_limit_cooldown: Duration::from_secs(self.breaker.rate_limit_cooldown_secs),
            backoff_multiplier: self.breaker.backoff_multiplier,
            max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
        }
    }

    /// Cache configuration.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache.max_entries,
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    /// Install-hint configuration.
    #[must_use]
    pub fn install_config(&self) -> InstallConfig {
        InstallConfig {
            hint_threshold: self.install.hint_threshold,
            hint_cooldown: Duration::from_secs(self.install.hint_cooldown_secs),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            live_ttl: Duration::from_secs(self.cache.live_ttl_secs),
            min_fallback_timeout: Duration::from_secs(self.fallback.min_timeout_secs),
        }
    }

    /// Probe time box.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    /// TTL for long-lived pattern-data cache entries.
    #[must_use]
    pub fn pattern_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.pattern_ttl_secs)
    }

    /// Owned provider descriptors for registry construction.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.clone()
    }

    /// Owned fallback endpoint map for registry construction.
    #[must_use]
    pub fn fallback_endpoints(&self) -> HashMap<CapabilityFamily, String> {
        self.fallback.endpoints.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
