//! Capacity-bounded TTL cache with least-recently-used eviction.
//!
//! [`TtlCache`] never returns an entry past its expiry. When full, expired
//! entries are dropped first, then the least recently accessed one.
//! [`GenerationCache`] layers the prompt and image caches used by the
//! executor on top of it, keyed so that equivalent requests collide.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use podflow_core::artifacts::{theme_key, ImageRef, Prompt};
use serde::Serialize;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    expires_at: Instant,
    /// Position in `Inner::recency`.
    touched: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Access sequence number -> key, oldest first.
    recency: BTreeMap<u64, String>,
    next_touch: u64,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn touch(&mut self, key: &str) {
        let seq = self.next_touch;
        self.next_touch += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.touched);
            entry.touched = seq;
            self.recency.insert(seq, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.touched);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.stats.evictions += 1;
        Some(key)
    }
}

/// Thread-safe TTL + LRU cache keyed by string.
pub struct TtlCache<V> {
    capacity: usize,
    default_ttl: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity,
            default_ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_touch: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds consistent data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = inner.entries.get(key).map(|e| e.expires_at <= now);
        match expired {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(false) => {}
            Some(true) => {
                inner.remove(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                return None;
            }
        }

        inner.touch(key);
        inner.stats.hits += 1;
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace `key`. `ttl` of `None` uses the cache default.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let expires_at = now + ttl.unwrap_or(self.default_ttl);
        let mut inner = self.lock();

        inner.remove(&key);
        if inner.entries.len() >= self.capacity {
            inner.purge_expired(now);
        }
        while inner.entries.len() >= self.capacity {
            match inner.evict_lru() {
                Some(evicted) => tracing::debug!(key = %evicted, "Evicted least recently used cache entry"),
                None => break,
            }
        }

        inner.entries.insert(
            key.clone(),
            Entry {
                value,
                expires_at,
                touched: 0,
            },
        );
        inner.touch(&key);
        inner.stats.inserts += 1;
    }

    /// Return the cached value or produce, store and return a new one.
    ///
    /// The boolean is `true` on a cache hit. Producer errors are returned
    /// as-is and nothing is stored. Concurrent misses on the same key may
    /// each run the producer; the last write wins.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, true));
        }
        let value = producer().await?;
        self.set(key, value.clone(), ttl);
        Ok((value, false))
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            ..inner.stats.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationCache
// ---------------------------------------------------------------------------

/// Deduplicates prompt and image generation.
///
/// Prompts are keyed by the normalised theme; images by
/// [`Prompt::generation_key`].
pub struct GenerationCache {
    prompts: TtlCache<Vec<Prompt>>,
    images: TtlCache<Vec<ImageRef>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationCacheStats {
    pub prompts: CacheStats,
    pub images: CacheStats,
}

impl GenerationCache {
    pub fn new(capacity: usize, prompt_ttl: Duration, image_ttl: Duration) -> Self {
        Self {
            prompts: TtlCache::new(capacity, prompt_ttl),
            images: TtlCache::new(capacity, image_ttl),
        }
    }

    pub fn prompts_for(&self, theme: &str) -> Option<Vec<Prompt>> {
        self.prompts.get(&theme_key(theme))
    }

    pub fn store_prompts(&self, theme: &str, prompts: Vec<Prompt>) {
        self.prompts.set(theme_key(theme), prompts, None);
    }

    pub fn images_for(&self, prompt: &Prompt) -> Option<Vec<ImageRef>> {
        self.images.get(&prompt.generation_key())
    }

    pub fn store_images(&self, prompt: &Prompt, images: Vec<ImageRef>) {
        self.images.set(prompt.generation_key(), images, None);
    }

    /// Purge expired entries from both caches.
    pub fn purge_expired(&self) -> usize {
        self.prompts.purge_expired() + self.images.purge_expired()
    }

    pub fn clear(&self) {
        self.prompts.clear();
        self.images.clear();
    }

    pub fn stats(&self) -> GenerationCacheStats {
        GenerationCacheStats {
            prompts: self.prompts.stats(),
            images: self.images.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    // -- ttl -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn returns_value_before_ttl_and_misses_after() {
        let cache = TtlCache::new(4, TTL);
        cache.set("k", 1, None);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_default() {
        let cache = TtlCache::new(4, TTL);
        cache.set("short", "a", Some(Duration::from_secs(1)));
        cache.set("long", "b", None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_stale_entries() {
        let cache = TtlCache::new(4, TTL);
        cache.set("old", 1, Some(Duration::from_secs(1)));
        cache.set("new", 2, None);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    // -- lru -----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_accessed_first() {
        let cache = TtlCache::new(2, TTL);
        cache.set("a", 1, None);
        cache.set("b", 2, None);

        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, None);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_dropped_before_live_ones() {
        let cache = TtlCache::new(2, TTL);
        cache.set("live", 1, None);
        cache.set("stale", 2, Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("fresh", 3, None);
        assert_eq!(cache.get("live"), Some(1));
        assert_eq!(cache.get("fresh"), Some(3));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn overwriting_does_not_evict() {
        let cache = TtlCache::new(2, TTL);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("a", 10, None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let cache = TtlCache::new(0, TTL);
        cache.set("a", 1, None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = TtlCache::new(4, TTL);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    // -- get_or_set ----------------------------------------------------------

    #[tokio::test]
    async fn get_or_set_produces_once() {
        let cache = TtlCache::new(4, TTL);
        let counter = std::sync::atomic::AtomicU32::new(0);
        let calls = &counter;
        let produce = move || async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, String>(42)
        };

        assert_eq!(cache.get_or_set("k", None, produce).await, Ok((42, false)));
        assert_eq!(cache.get_or_set("k", None, produce).await, Ok((42, true)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_set_does_not_store_errors() {
        let cache: TtlCache<u32> = TtlCache::new(4, TTL);
        let res = cache
            .get_or_set("k", None, || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(res, Err("boom"));
        assert!(cache.is_empty());
    }

    // -- generation cache ----------------------------------------------------

    #[test]
    fn equivalent_prompts_share_cached_images() {
        let cache = GenerationCache::new(8, TTL, TTL);
        let image = ImageRef {
            id: "img-1".into(),
            url: "mem://img-1".into(),
            width: 10,
            height: 10,
            seed: None,
        };
        cache.store_images(&Prompt::from_text("Neon  Tiger"), vec![image.clone()]);

        assert_eq!(
            cache.images_for(&Prompt::from_text("neon tiger")),
            Some(vec![image])
        );
    }

    #[test]
    fn themes_are_normalised() {
        let cache = GenerationCache::new(8, TTL, TTL);
        cache.store_prompts("Retro Sunset", vec![Prompt::from_text("p")]);
        assert!(cache.prompts_for("  retro   sunset ").is_some());
        assert!(cache.prompts_for("retro sunrise").is_none());
        assert_eq!(cache.stats().prompts.hits, 1);
    }
}
