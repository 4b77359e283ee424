//! Concurrent TTL/LRU cache.
//!
//! Entries past their TTL are logically expired immediately (lazy check on
//! `get`); a background sweep additionally removes expired entries and, when
//! the entry count exceeds the configured ceiling, evicts the
//! least-recently-accessed entries until occupancy falls back to the target.
//!
//! The map is sharded (`DashMap`), so concurrent reads and writes on
//! different keys do not contend on a single lock. Writes to the same key
//! are last-writer-wins.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fraction of the ceiling the sweep evicts down to once it is exceeded.
const OCCUPANCY_TARGET: f64 = 0.8;

// ============================================================================
// Configuration
// ============================================================================

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry-count ceiling that triggers LRU eviction during a sweep.
    pub max_entries: usize,
    /// Interval between background sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Entries & stats
// ============================================================================

/// A single cached value with its bookkeeping fields.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Point-in-time counters for cache effectiveness.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that returned a live value.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries removed by LRU pressure.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Current entry count.
    pub entries: usize,
}

// ============================================================================
// ResultCache
// ============================================================================

/// Concurrent TTL/LRU cache for capability results.
///
/// Operations never return errors to the caller; anything unexpected is
/// logged and behaves as a miss.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResultCache {
    /// Create a new cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Create a cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Look up a value. Expired entries count as a miss and are dropped.
    ///
    /// Updates `last_accessed` and `access_count` on a hit.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_accessed = now;
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            // Expired. The guard must drop before the removal below, or the
            // shard would deadlock.
            drop(entry);
            self.entries
                .remove_if(key, |_, candidate| candidate.is_expired(now));
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value with the caller's tier-appropriate TTL.
    ///
    /// Last-writer-wins on key collision.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                last_accessed: now,
                access_count: 0,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`. Returns the number
    /// of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(prefix = %prefix, removed, "Invalidated cache prefix");
        }
        removed
    }

    /// Current entry count (including not-yet-swept expired entries).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Run one sweep pass: drop expired entries, then evict by LRU if the
    /// entry count still exceeds the ceiling.
    pub fn sweep(&self) {
        let now = Instant::now();

        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before.saturating_sub(self.entries.len());
        if expired > 0 {
            self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        }

        let len = self.entries.len();
        if len <= self.config.max_entries {
            return;
        }

        // LRU by last access, ties broken by creation time ascending.
        let target = (self.config.max_entries as f64 * OCCUPANCY_TARGET) as usize;
        let mut candidates: Vec<(String, Instant, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed, entry.created_at))
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut evicted = 0u64;
        for (key, _, _) in candidates {
            if self.entries.len() <= target {
                break;
            }
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, expired, occupancy = self.entries.len(), "Cache sweep evicted entries");
        }
    }

    /// Spawn the background sweep task.
    ///
    /// The task holds only a weak reference and exits once the cache is
    /// dropped, so callers do not have to abort the handle.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep(),
                    None => {
                        warn!("Result cache dropped, stopping sweep task");
                        break;
                    }
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
