//! In-memory TTL cache with background expiry sweeping.

use super::{Cache, CacheStats};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for response caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether responses are cached at all.
    pub enabled: bool,
    /// TTL given to cached responses.
    #[serde(with = "crate::serde_millis")]
    pub default_ttl: Duration,
    /// How often the background sweep runs. Zero disables the sweep.
    #[serde(with = "crate::serde_millis")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// A configuration with caching turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Sets the TTL used when the client does not override it.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets how often the background sweep removes expired entries.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

// Stand-in expiry for TTLs too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    etag: Option<String>,
    expires_at: Instant,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct Store<V> {
    entries: DashMap<String, CacheEntry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> Store<V> {
    /// Removes `key` if it is still expired at `now`, counting the eviction.
    fn evict(&self, key: &str, now: Instant) {
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sweep(&self, now: Instant) -> u64 {
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                evicted += 1;
            }
            keep
        });
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        evicted
    }
}

/// An in-memory [`Cache`] safe for concurrent use.
///
/// Entries live in a sharded concurrent map; hit, miss and eviction counters
/// are independent atomics. When created inside a Tokio runtime a background
/// task evicts expired entries every `cleanup_interval` until
/// [`MemoryCache::close`] is called or the cache is dropped.
///
/// # Examples
///
/// ```
/// use steadfast::{Cache, MemoryCache};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = MemoryCache::new(Duration::from_secs(60));
/// cache.set_with_etag("GET:/user", "{\"login\":\"octo\"}".to_string(), "\"v1\"", Duration::from_secs(30));
///
/// assert_eq!(cache.get("GET:/user").as_deref(), Some("{\"login\":\"octo\"}"));
/// assert_eq!(cache.get_etag("GET:/user").as_deref(), Some("\"v1\""));
/// assert_eq!(cache.stats().hits, 1);
///
/// cache.close();
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryCache<V> {
    store: Arc<Store<V>>,
    shutdown: CancellationToken,
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache sweeping expired entries every `cleanup_interval`.
    pub fn new(cleanup_interval: Duration) -> Self {
        let cache = Self {
            store: Arc::new(Store {
                entries: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            shutdown: CancellationToken::new(),
        };
        cache.start_sweeper(cleanup_interval);
        cache
    }

    /// Creates a cache from a [`CacheConfig`].
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.cleanup_interval)
    }

    fn start_sweeper(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(
                    "No Tokio runtime - expired cache entries are only evicted on access"
                );
                return;
            }
        };

        let store: Weak<Store<V>> = Arc::downgrade(&self.store);
        let shutdown = self.shutdown.clone();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let evicted = store.sweep(Instant::now());
                        if evicted > 0 {
                            tracing::debug!(evicted = evicted, "Swept expired cache entries");
                        }
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        });
    }

    /// Stops the background sweep. Safe to call any number of times.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Time since `key` was last written or read, if it is present.
    pub fn idle_time(&self, key: &str) -> Option<Duration> {
        self.store
            .entries
            .get(key)
            .map(|entry| entry.last_access.elapsed())
    }

    /// Returns `true` once [`MemoryCache::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn insert(&self, key: &str, value: V, etag: Option<String>, ttl: Duration) {
        let now = Instant::now();
        self.store.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                etag,
                expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
                last_access: now,
            },
        );
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();

        match self.store.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                self.store.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => {
                self.store.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        self.store.evict(key, now);
        self.store.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        self.insert(key, value, None, ttl);
    }

    fn set_with_etag(&self, key: &str, value: V, etag: &str, ttl: Duration) {
        self.insert(key, value, Some(etag.to_string()), ttl);
    }

    fn get_etag(&self, key: &str) -> Option<String> {
        let now = Instant::now();

        match self.store.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return entry.etag.clone(),
            Some(_) => {}
            None => return None,
        }

        self.store.evict(key, now);
        None
    }

    fn delete(&self, key: &str) {
        self.store.entries.remove(key);
    }

    fn clear(&self) {
        self.store.entries.clear();
        self.store.hits.store(0, Ordering::Relaxed);
        self.store.misses.store(0, Ordering::Relaxed);
        self.store.evictions.store(0, Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        CacheStats::new(
            self.store.hits.load(Ordering::Relaxed),
            self.store.misses.load(Ordering::Relaxed),
            self.store.evictions.load(Ordering::Relaxed),
            self.store.entries.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache<String> {
        MemoryCache::new(Duration::ZERO)
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(60));

        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("absent"), None);
    }

    #[test]
    fn test_overwrite_replaces_entry() {
        let cache = cache();
        cache.set_with_etag("k", "old".to_string(), "\"1\"", Duration::from_secs(60));
        cache.set("k", "new".to_string(), Duration::from_secs(60));

        assert_eq!(cache.get("k"), Some("new".to_string()));
        assert_eq!(cache.get_etag("k"), None, "etag is not merged into the new entry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_refresh_last_access() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.idle_time("k"), Some(Duration::from_secs(5)));

        cache.get("k");
        assert_eq!(cache.idle_time("k"), Some(Duration::ZERO));
        assert_eq!(cache.idle_time("absent"), None);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::MAX);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_evicts_once() {
        let cache = cache();
        cache.set("k", "v".to_string(), Duration::from_millis(50));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(cache.stats().size, 1, "expired entries count until removed");

        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_stats_scenario() {
        let cache = cache();
        cache.set("a", "1".to_string(), Duration::from_secs(60));
        cache.set("b", "2".to_string(), Duration::from_secs(60));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_none());
        assert!(cache.get("d").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_etag_follows_expiry_without_counting() {
        let cache = cache();
        cache.set_with_etag("k", "v".to_string(), "W/\"abc\"", Duration::from_secs(1));

        assert_eq!(cache.get_etag("k").as_deref(), Some("W/\"abc\""));
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_etag("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache();
        cache.set("a", "1".to_string(), Duration::from_secs(60));
        cache.set("b", "2".to_string(), Duration::from_secs(60));
        cache.get("a");
        cache.get("zzz");

        cache.delete("a");
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.stats().size, 1);

        cache.clear();
        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let cache: MemoryCache<String> = MemoryCache::new(Duration::from_millis(10));
        cache.set("short", "v".to_string(), Duration::from_millis(5));
        cache.set("long", "v".to_string(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 0, "the sweep does not count lookups");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cache: MemoryCache<String> = MemoryCache::new(Duration::from_millis(10));
        assert!(!cache.is_closed());

        cache.close();
        cache.close();
        assert!(cache.is_closed());

        cache.set("k", "v".to_string(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().size, 1, "no sweeping after close");
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let cache: Arc<MemoryCache<u64>> = Arc::new(MemoryCache::new(Duration::from_millis(5)));

        let tasks: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..200u64 {
                        let key = format!("{}:{}", t, i % 20);
                        cache.set(&key, i, Duration::from_secs(60));
                        assert!(cache.get(&key).is_some());
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, 1600);
        assert_eq!(stats.size, 160);
    }

    #[test]
    fn test_works_without_runtime() {
        let cache: MemoryCache<String> = MemoryCache::new(Duration::from_secs(1));
        cache.set("k", "v".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }
}
