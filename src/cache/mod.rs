//! Response caching with TTL expiry and ETag association.
//!
//! [`Cache`] is the capability the client reads and writes through. Two
//! implementations ship with the crate:
//!
//! - [`NoOpCache`] stores nothing; use it to disable caching.
//! - [`MemoryCache`] keeps entries in memory and sweeps expired ones in the
//!   background.

pub mod memory;
pub mod noop;

pub use memory::{CacheConfig, MemoryCache};
pub use noop::NoOpCache;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A key/value store with per-entry TTL and optional ETag.
///
/// Implementations must be safe to share between any number of concurrent
/// tasks without external locking. Callers only ever receive copies of stored
/// values.
pub trait Cache<V>: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired.
    ///
    /// Counts a hit or a miss. An expired entry is evicted as it is observed.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    fn set(&self, key: &str, value: V, ttl: Duration);

    /// Stores `value` and its `etag` under `key` for `ttl`, replacing any
    /// previous entry.
    fn set_with_etag(&self, key: &str, value: V, etag: &str, ttl: Duration);

    /// Returns the ETag stored with `key`.
    ///
    /// Same expiry rules as [`Cache::get`], but never counts a hit or miss.
    fn get_etag(&self, key: &str) -> Option<String>;

    /// Removes `key`.
    fn delete(&self, key: &str);

    /// Removes every entry and resets all counters to zero.
    fn clear(&self);

    /// A snapshot of the cache counters.
    fn stats(&self) -> CacheStats;
}

/// Point-in-time cache statistics.
///
/// Counters are read independently, so a snapshot taken under concurrent use
/// is advisory rather than exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing, or only an expired entry.
    pub misses: u64,
    /// Entries removed because they expired.
    pub evictions: u64,
    /// Entries physically present, including expired ones not yet swept.
    pub size: usize,
    /// `hits / (hits + misses) * 100`, or `0.0` with no lookups.
    pub hit_rate: f64,
}

impl CacheStats {
    /// Builds a snapshot and derives `hit_rate` from the counters.
    pub fn new(hits: u64, misses: u64, evictions: u64, size: usize) -> Self {
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64 * 100.0
        };

        Self {
            hits,
            misses,
            evictions,
            size,
            hit_rate,
        }
    }
}

/// Derives the cache key for an HTTP read.
///
/// Without parameters the key is `METHOD:path`. With parameters it is the
/// lowercase hex SHA-256 digest of the method, the path and the parameters
/// sorted by name (then value), so insertion order never matters and key
/// length stays fixed.
///
/// # Examples
///
/// ```
/// use steadfast::generate_cache_key;
///
/// assert_eq!(generate_cache_key("GET", "/repos/acme/widgets", []), "GET:/repos/acme/widgets");
///
/// let a = generate_cache_key("GET", "/search", [("q", "rust"), ("page", "2")]);
/// let b = generate_cache_key("GET", "/search", [("page", "2"), ("q", "rust")]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn generate_cache_key<'a, I>(method: &str, path: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut params: Vec<(&str, &str)> = params.into_iter().collect();
    if params.is_empty() {
        return format!("{}:{}", method, path);
    }
    params.sort_unstable();

    let mut hasher = Sha256::new();
    hash_field(&mut hasher, method);
    hash_field(&mut hasher, path);
    for (name, value) in params {
        hash_field(&mut hasher, name);
        hash_field(&mut hasher, value);
    }
    hex::encode(hasher.finalize())
}

/// Length-prefixed so no two field sequences feed the hasher the same bytes.
fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}
