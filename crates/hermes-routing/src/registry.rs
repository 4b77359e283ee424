//! Provider registry and availability prober.
//!
//! The registry holds the ordered candidate providers per capability family
//! plus the per-family Tier-3 fallback endpoints. Descriptors are loaded
//! once from configuration, validated, and immutable for the process
//! lifetime, so `candidates` needs no locking.
//!
//! Probing verifies reachability only (a version handshake, time-boxed to a
//! few hundred milliseconds); it never invokes the capability itself, and
//! its results are not cached beyond a single routing decision.

use crate::error::{Error, Result};
use crate::install::InstallTier;
use crate::request::CapabilityFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Descriptors
// ============================================================================

/// How a provider is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawned local process, JSON over stdio
    LocalProcess,
    /// HTTP endpoint
    Network,
}

/// Static description of one provider, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique provider id
    pub id: String,
    /// Capability family this provider serves
    pub family: CapabilityFamily,
    /// Candidate order within the family (lower = tried first)
    pub priority: u32,
    /// Transport used to reach the provider
    pub transport: TransportKind,
    /// Installation tier
    pub install_tier: InstallTier,
    /// Capability tags (informational)
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Executable for `LocalProcess` transports
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for `LocalProcess` transports
    #[serde(default)]
    pub args: Vec<String>,
    /// Base URL for `Network` transports
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Provider-specific fallback URL overriding the family fallback
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
}

impl ProviderDescriptor {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("provider id must not be empty".into()));
        }
        match self.transport {
            TransportKind::LocalProcess if self.command.is_none() => Err(Error::Config(format!(
                "provider '{}' uses local_process transport but has no command",
                self.id
            ))),
            TransportKind::Network if self.endpoint.is_none() => Err(Error::Config(format!(
                "provider '{}' uses network transport but has no endpoint",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable, read-mostly provider registry.
#[derive(Debug)]
pub struct ProviderRegistry {
    by_family: HashMap<CapabilityFamily, Vec<ProviderDescriptor>>,
    fallbacks: HashMap<CapabilityFamily, String>,
}

impl ProviderRegistry {
    /// Build a registry from descriptors and per-family fallback endpoints.
    ///
    /// Fails fast on invalid descriptors, duplicate ids, or a family that
    /// has candidates but no fallback endpoint.
    pub fn new(
        descriptors: Vec<ProviderDescriptor>,
        fallbacks: HashMap<CapabilityFamily, String>,
    ) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        let mut by_family: HashMap<CapabilityFamily, Vec<ProviderDescriptor>> = HashMap::new();

        for descriptor in descriptors {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(Error::Config(format!(
                    "duplicate provider id '{}'",
                    descriptor.id
                )));
            }
            by_family.entry(descriptor.family).or_default().push(descriptor);
        }

        for (family, candidates) in &mut by_family {
            if !fallbacks.contains_key(family) {
                return Err(Error::Config(format!(
                    "family '{family}' has providers but no fallback endpoint"
                )));
            }
            // Priority ascending, id as a deterministic tie-break.
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        }

        Ok(Self { by_family, fallbacks })
    }

    /// Ordered candidates for a family (empty if none configured).
    #[must_use]
    pub fn candidates(&self, family: CapabilityFamily) -> &[ProviderDescriptor] {
        self.by_family.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tier-3 fallback endpoint for a family.
    #[must_use]
    pub fn fallback_endpoint(&self, family: CapabilityFamily) -> Option<&str> {
        self.fallbacks.get(&family).map(String::as_str)
    }

    /// Look up a descriptor by id.
    #[must_use]
    pub fn descriptor(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.by_family
            .values()
            .flat_map(|candidates| candidates.iter())
            .find(|d| d.id == id)
    }

    /// Families with at least one candidate.
    #[must_use]
    pub fn families(&self) -> Vec<CapabilityFamily> {
        self.by_family.keys().copied().collect()
    }
}

// ============================================================================
// Prober
// ============================================================================

/// Probe result for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Provider answered the handshake
    Available,
    /// Provider is not reachable/resident
    Unavailable,
    /// Provider answered, but abnormally
    Error,
}

/// Time-boxed reachability prober.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    /// Create a prober with the given per-probe time box.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Probe one provider.
    pub async fn probe(&self, descriptor: &ProviderDescriptor) -> ProbeStatus {
        let status = match descriptor.transport {
            TransportKind::Network => self.probe_network(descriptor).await,
            TransportKind::LocalProcess => self.probe_local(descriptor).await,
        };
        debug!(provider = %descriptor.id, status = ?status, "Probed provider");
        status
    }

    async fn probe_network(&self, descriptor: &ProviderDescriptor) -> ProbeStatus {
        let Some(endpoint) = &descriptor.endpoint else {
            return ProbeStatus::Error;
        };
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) if resp.status().is_success() => ProbeStatus::Available,
            Ok(_) => ProbeStatus::Error,
            Err(e) if e.is_timeout() || e.is_connect() => ProbeStatus::Unavailable,
            Err(_) => ProbeStatus::Error,
        }
    }

    async fn probe_local(&self, descriptor: &ProviderDescriptor) -> ProbeStatus {
        let Some(command) = &descriptor.command else {
            return ProbeStatus::Error;
        };
        if find_in_path(command).is_none() {
            return ProbeStatus::Unavailable;
        }

        let mut cmd = tokio::process::Command::new(command);
        cmd.arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(_) => return ProbeStatus::Error,
        };
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => ProbeStatus::Available,
            Ok(Ok(_)) => ProbeStatus::Error,
            Ok(Err(_)) => ProbeStatus::Error,
            Err(_) => ProbeStatus::Unavailable,
        }
    }
}

/// Resolve an executable name against `PATH` (or verify an explicit path).
#[must_use]
pub fn find_in_path(command: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|full| full.is_file())
}

// ============================================================================
// Tests
// ============================================================================
