//! A cache that stores nothing.

use super::{Cache, CacheStats};
use std::time::Duration;

/// Disables caching while satisfying the [`Cache`] contract.
///
/// Every lookup misses, writes are discarded and statistics stay at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCache;

impl NoOpCache {
    /// Creates the cache.
    pub fn new() -> Self {
        Self
    }
}

impl<V> Cache<V> for NoOpCache {
    fn get(&self, _key: &str) -> Option<V> {
        None
    }

    fn set(&self, _key: &str, _value: V, _ttl: Duration) {}

    fn set_with_etag(&self, _key: &str, _value: V, _etag: &str, _ttl: Duration) {}

    fn get_etag(&self, _key: &str) -> Option<String> {
        None
    }

    fn delete(&self, _key: &str) {}

    fn clear(&self) {}

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_never_stores() {
        let cache = NoOpCache::new();
        Cache::<String>::set(&cache, "k", "v".to_string(), Duration::from_secs(60));
        Cache::<String>::set_with_etag(&cache, "e", "v".to_string(), "\"abc\"", Duration::from_secs(60));

        assert_eq!(Cache::<String>::get(&cache, "k"), None);
        assert_eq!(Cache::<String>::get_etag(&cache, "e"), None);
        assert_eq!(Cache::<String>::stats(&cache), CacheStats::default());
    }
}
