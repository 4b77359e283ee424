//! Hermes Cache - Content-Addressed Result Memoization
//!
//! This crate provides the result cache for Hermes capability routing:
//! - Key: deterministic content-hash key derivation
//! - Cache: concurrent TTL/LRU cache with a background sweep task
//!
//! The cache is tier-agnostic: callers pass the TTL appropriate to their
//! tier (long-lived pattern data vs. short-lived live-query data). Cache
//! operations never return errors to the caller; internal failures are
//! logged and treated as a miss.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod key;

pub use cache::{CacheConfig, CacheStats, ResultCache};
pub use key::derive_key;
