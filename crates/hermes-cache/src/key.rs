//! Deterministic cache key derivation.
//!
//! Keys are a content hash of `(namespace, positional args, sorted keyword
//! args)`. Identical logical requests always collide to the same key, which
//! is what makes memoization correct. The namespace survives as a visible
//! prefix so a whole namespace can be invalidated at once.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Field separator inside the hash pre-image.
///
/// `\x1f` (unit separator) cannot appear in JSON-serialized values, so
/// `("ab", "c")` and `("a", "bc")` hash differently.
const SEP: u8 = 0x1f;

/// Derive a cache key from a namespace, positional arguments, and keyword
/// arguments.
///
/// Keyword arguments are iterated in `BTreeMap` order, so callers that build
/// the map in any insertion order get the same key. The returned key has the
/// shape `"{namespace}:{hex-sha256}"`.
#[must_use]
pub fn derive_key(
    namespace: &str,
    positional: &[&str],
    keyword: &BTreeMap<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for arg in positional {
        hasher.update([SEP]);
        hasher.update(arg.as_bytes());
    }
    for (name, value) in keyword {
        hasher.update([SEP]);
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
    }

    let digest: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    format!("{namespace}:{digest}")
}
