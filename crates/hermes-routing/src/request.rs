//! Capability request model.
//!
//! A `CapabilityRequest` is created by a request originator (persona or
//! workflow logic), is immutable, and is scoped to a single routing call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Default routing deadline when the originator does not set one.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// A category of external enhancement with interchangeable providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityFamily {
    /// Structural/pattern analysis of user material
    PatternAnalysis,
    /// Step-by-step systematic reasoning
    SystematicReasoning,
    /// External knowledge lookup
    KnowledgeRetrieval,
    /// Long-form condensation
    Summarization,
}

impl CapabilityFamily {
    /// Returns the string representation (also the cache namespace).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternAnalysis => "pattern_analysis",
            Self::SystematicReasoning => "systematic_reasoning",
            Self::KnowledgeRetrieval => "knowledge_retrieval",
            Self::Summarization => "summarization",
        }
    }

    /// All known families.
    #[must_use]
    pub fn all() -> &'static [CapabilityFamily] {
        &[
            Self::PatternAnalysis,
            Self::SystematicReasoning,
            Self::KnowledgeRetrieval,
            Self::Summarization,
        ]
    }
}

impl std::fmt::Display for CapabilityFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency hint supplied by the originator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Background work, latency does not matter
    Low,
    /// Interactive default
    #[default]
    Normal,
    /// User is actively waiting
    High,
}

/// A single capability routing request.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    /// Unique request id (threaded through the routing outcome)
    pub id: Uuid,
    /// Capability family to route within
    pub family: CapabilityFamily,
    /// Query text for the provider
    pub query: String,
    /// Structured context forwarded to the provider; part of the cache key
    pub context: BTreeMap<String, serde_json::Value>,
    /// Urgency hint
    pub urgency: Urgency,
    /// Hard wall-clock budget for the whole routing call
    pub deadline: Duration,
}

impl CapabilityRequest {
    /// Create a request with defaults (normal urgency, 30s deadline).
    #[must_use]
    pub fn new(family: CapabilityFamily, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            family,
            query: query.into(),
            context: BTreeMap::new(),
            urgency: Urgency::default(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Attach a context value.
    #[must_use]
    pub fn with_context_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }

    /// Set the urgency hint.
    #[must_use]
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    /// Set the routing deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Derive the cache key for this request.
    ///
    /// Identical `(family, query, context)` triples always produce the same
    /// key; `id`, `urgency`, and `deadline` do not participate.
    #[must_use]
    pub fn cache_key(&self) -> String {
        hermes_cache::derive_key(self.family.as_str(), &[self.query.as_str()], &self.context)
    }

    /// Wire payload sent to providers and to the fallback endpoint.
    ///
    /// Primary providers and the Tier-3 fallback receive the same shape.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "family": self.family.as_str(),
            "query": self.query,
            "context": self.context,
            "urgency": self.urgency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let req = CapabilityRequest::new(CapabilityFamily::PatternAnalysis, "find repetition")
            .with_context_value("depth", json!(2))
            .with_urgency(Urgency::High)
            .with_deadline(Duration::from_secs(5));

        assert_eq!(req.family, CapabilityFamily::PatternAnalysis);
        assert_eq!(req.urgency, Urgency::High);
        assert_eq!(req.deadline, Duration::from_secs(5));
        assert_eq!(req.context.get("depth"), Some(&json!(2)));
    }

    #[test]
    fn test_cache_key_ignores_id_and_urgency() {
        let a = CapabilityRequest::new(CapabilityFamily::Summarization, "q")
            .with_urgency(Urgency::High);
        let b = CapabilityRequest::new(CapabilityFamily::Summarization, "q")
            .with_urgency(Urgency::Low)
            .with_deadline(Duration::from_secs(1));
        assert_ne!(a.id, b.id);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_varies_with_inputs() {
        let base = CapabilityRequest::new(CapabilityFamily::Summarization, "q");
        let other_query = CapabilityRequest::new(CapabilityFamily::Summarization, "q2");
        let other_family = CapabilityRequest::new(CapabilityFamily::KnowledgeRetrieval, "q");
        let other_context =
            CapabilityRequest::new(CapabilityFamily::Summarization, "q")
                .with_context_value("k", json!(1));

        assert_ne!(base.cache_key(), other_query.cache_key());
        assert_ne!(base.cache_key(), other_family.cache_key());
        assert_ne!(base.cache_key(), other_context.cache_key());
    }

    #[test]
    fn test_payload_shape() {
        let req = CapabilityRequest::new(CapabilityFamily::PatternAnalysis, "q")
            .with_context_value("depth", json!(2));
        let payload = req.to_payload();
        assert_eq!(payload["family"], "pattern_analysis");
        assert_eq!(payload["query"], "q");
        assert_eq!(payload["context"]["depth"], 2);
        assert_eq!(payload["urgency"], "normal");
    }

    #[test]
    fn test_family_serde_round_trip() {
        for family in CapabilityFamily::all() {
            let s = serde_json::to_string(family).unwrap();
            let back: CapabilityFamily = serde_json::from_str(&s).unwrap();
            assert_eq!(*family, back);
        }
    }
}
