//! Tiered installation resolver.
//!
//! Maps a provider descriptor to an execution strategy:
//! - Tier 1 `Permanent`: provider already resident; fastest path, verified
//!   with a quick existence check.
//! - Tier 2 `Temporary`: on-demand provisioning (ephemeral process spawn
//!   per call); slower, but works without prior setup.
//! - Tier 3 `FallbackApi`: plain HTTP to the stable fallback endpoint;
//!   always constructible, always tried last.
//!
//! Repeated Tier-2 use surfaces a one-time, rate-limited upgrade hint so
//! the user can install the provider permanently; the hint never blocks or
//! alters the current call.

use crate::error::{Error, Result};
use crate::registry::{find_in_path, ProviderDescriptor, TransportKind};
use crate::transport::{CapabilityTransport, HttpTransport, LocalProcessTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ============================================================================
// Tiers & strategies
// ============================================================================

/// Installation tier of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallTier {
    /// Pre-installed and resident
    Permanent,
    /// Provisioned on demand per call
    Temporary,
    /// Pure network fallback
    FallbackApi,
}

impl InstallTier {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Temporary => "temporary",
            Self::FallbackApi => "fallback_api",
        }
    }
}

impl std::fmt::Display for InstallTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one invocation will be executed.
pub struct ExecutionStrategy {
    /// Tier the call runs at
    pub tier: InstallTier,
    /// Transport carrying the call
    pub transport: Arc<dyn CapabilityTransport>,
}

/// One-time suggestion to install a frequently-provisioned provider.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeHint {
    /// Provider that keeps getting provisioned on demand
    pub provider_id: String,
    /// Temporary invocations seen so far
    pub temporary_uses: u32,
}

// ============================================================================
// Configuration
// ============================================================================

/// Installation-hint configuration.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Tier-2 invocations before an upgrade hint is surfaced.
    pub hint_threshold: u32,
    /// Minimum interval between hints for the same provider.
    pub hint_cooldown: Duration,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            hint_threshold: 3,
            hint_cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl InstallConfig {
    /// Validate the configuration, fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.hint_threshold == 0 {
            return Err(Error::Config("install hint_threshold must be >= 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Seam between the engine and concrete transports.
#[async_trait]
pub trait StrategyResolver: Send + Sync {
    /// Resolve the execution strategy for a candidate provider.
    async fn resolve(&self, descriptor: &ProviderDescriptor) -> Result<ExecutionStrategy>;

    /// Build the Tier-3 strategy for a family fallback endpoint.
    fn fallback(&self, endpoint: &str) -> Result<ExecutionStrategy>;

    /// Record one Tier-2 use; returns a hint when one is due.
    fn note_temporary_use(&self, provider_id: &str) -> Option<UpgradeHint>;
}

#[derive(Debug, Default)]
struct TempUse {
    count: u32,
    last_hint: Option<Instant>,
}

/// Default resolver over real transports.
pub struct InstallResolver {
    config: InstallConfig,
    temp_uses: DashMap<String, TempUse>,
}

impl InstallResolver {
    /// Create a resolver from a validated configuration.
    #[must_use]
    pub fn new(config: InstallConfig) -> Self {
        Self {
            config,
            temp_uses: DashMap::new(),
        }
    }

    fn local_transport(descriptor: &ProviderDescriptor) -> Result<Arc<dyn CapabilityTransport>> {
        let command = descriptor.command.as_ref().ok_or_else(|| {
            Error::Config(format!("provider '{}' has no command", descriptor.id))
        })?;
        Ok(Arc::new(LocalProcessTransport::new(
            command.clone(),
            descriptor.args.clone(),
        )))
    }

    fn network_transport(descriptor: &ProviderDescriptor) -> Result<Arc<dyn CapabilityTransport>> {
        let endpoint = descriptor.endpoint.as_ref().ok_or_else(|| {
            Error::Config(format!("provider '{}' has no endpoint", descriptor.id))
        })?;
        Ok(Arc::new(HttpTransport::new(endpoint.clone())?))
    }
}

#[async_trait]
impl StrategyResolver for InstallResolver {
    async fn resolve(&self, descriptor: &ProviderDescriptor) -> Result<ExecutionStrategy> {
        let transport = match (descriptor.install_tier, descriptor.transport) {
            (InstallTier::Permanent, TransportKind::LocalProcess) => {
                // Resident means the binary must already be on PATH.
                let command = descriptor.command.as_deref().unwrap_or_default();
                if find_in_path(command).is_none() {
                    return Err(Error::Transport(format!(
                        "provider '{}' is marked permanent but '{}' is not installed",
                        descriptor.id, command
                    )));
                }
                Self::local_transport(descriptor)?
            }
            (InstallTier::Temporary, TransportKind::LocalProcess) => {
                Self::local_transport(descriptor)?
            }
            (_, TransportKind::Network) => Self::network_transport(descriptor)?,
            (InstallTier::FallbackApi, TransportKind::LocalProcess) => {
                return Err(Error::Config(format!(
                    "provider '{}': fallback_api tier requires a network transport",
                    descriptor.id
                )));
            }
        };

        debug!(
            provider = %descriptor.id,
            tier = %descriptor.install_tier,
            "Resolved execution strategy"
        );
        Ok(ExecutionStrategy {
            tier: descriptor.install_tier,
            transport,
        })
    }

    fn fallback(&self, endpoint: &str) -> Result<ExecutionStrategy> {
        Ok(ExecutionStrategy {
            tier: InstallTier::FallbackApi,
            transport: Arc::new(HttpTransport::new(endpoint)?),
        })
    }

    fn note_temporary_use(&self, provider_id: &str) -> Option<UpgradeHint> {
        let mut usage = self.temp_uses.entry(provider_id.to_string()).or_default();
        usage.count += 1;

        if usage.count < self.config.hint_threshold {
            return None;
        }
        let hint_due = match usage.last_hint {
            None => true,
            Some(at) => at.elapsed() >= self.config.hint_cooldown,
        };
        if !hint_due {
            return None;
        }
        usage.last_hint = Some(Instant::now());

        let hint = UpgradeHint {
            provider_id: provider_id.to_string(),
            temporary_uses: usage.count,
        };
        info!(
            provider = provider_id,
            uses = usage.count,
            "Provider is repeatedly provisioned on demand, consider installing it permanently"
        );
        Some(hint)
    }
}

// ============================================================================
// Tests
// ============================================================================
