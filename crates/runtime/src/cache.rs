//! Content-addressed memoization of model calls.

use crate::config::CacheConfig;
use crate::model::{GenerateRequest, Generation, ModelProvider, ProviderError};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Key/value store used to memoize model output.
///
/// Implementations are shared across concurrent executions and must be
/// internally synchronized.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
}

#[async_trait]
impl<C: CacheProvider + ?Sized> CacheProvider for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }
}

/// How a function's model calls are cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entry lifetime; `None` keeps entries until evicted for space.
    pub ttl: Option<Duration>,
}

/// SHA-256 hex digest of the request's prompt, system prompt and options.
pub fn cache_key(request: &GenerateRequest) -> String {
    let canonical = json!({
        "prompt": request.prompt,
        "system": request.system,
        "options": request.options,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Model provider decorator that consults a cache first.
///
/// Only first attempts read from the cache, so a retry never replays the
/// answer that caused it. Cache failures are logged and treated as misses.
pub struct CachedProvider {
    inner: Arc<dyn ModelProvider>,
    cache: Arc<dyn CacheProvider>,
    ttl: Option<Duration>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, cache: Arc<dyn CacheProvider>, policy: &CachePolicy) -> Self {
        Self {
            inner,
            cache,
            ttl: policy.ttl,
        }
    }
}

#[async_trait]
impl ModelProvider for CachedProvider {
    async fn generate(&self, request: &GenerateRequest) -> std::result::Result<Generation, ProviderError> {
        let key = cache_key(request);
        if request.attempt <= 1 {
            match self.cache.get(&key).await {
                Ok(Some(raw_output)) => {
                    debug!(key = %key, "model cache hit");
                    return Ok(Generation::text(raw_output));
                }
                Ok(None) => {}
                Err(error) => warn!(error = %error, "cache read failed"),
            }
        }

        let generation = self.inner.generate(request).await?;
        if let Err(error) = self
            .cache
            .set(&key, generation.raw_output.clone(), self.ttl)
            .await
        {
            warn!(error = %error, "cache write failed");
        }
        Ok(generation)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Size- and TTL-bounded in-process cache.
///
/// Once full, each write evicts the least recently used entry. Expired
/// entries are dropped when read or by [`MemoryCache::evict_expired`].
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn capacity(&self) -> usize {
        self.entries.lock().await.cap().get()
    }

    /// The cache `[cache]` asks for.
    ///
    /// With a TTL configured and a tokio runtime available, expired entries
    /// are also swept in the background.
    pub fn from_config(config: &CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self::new(config.capacity));
        if config.ttl_secs.is_some() {
            if Handle::try_current().is_ok() {
                cache.spawn_eviction(Duration::from_secs(config.eviction_interval_secs));
            } else {
                debug!("no tokio runtime, expired cache entries are dropped on read");
            }
        }
        cache
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Evict expired entries every `period` on a background task.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    pub fn spawn_eviction(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let evicted = cache.evict_expired().await;
                if evicted > 0 {
                    debug!(evicted, "evicted expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let lookup = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.lock().await;
        let displaced = entries.push(key.to_string(), Entry { value, expires_at });
        if let Some((evicted, _)) = displaced.filter(|(old, _)| old != key) {
            debug!(key = %evicted, "evicted least recently used cache entry");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for storage::CacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        storage::CacheStore::get(self, key).map_err(Error::from)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        storage::CacheStore::set(self, key, &value, ttl).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[test]
    fn key_depends_on_prompt_system_and_options() {
        let base = GenerateRequest::new("add 1 and 2");
        let same = GenerateRequest::new("add 1 and 2").with_attempt(3);
        assert_eq!(cache_key(&base), cache_key(&same));
        assert_eq!(cache_key(&base).len(), 64);

        let system = base.clone().with_system("terse");
        assert_ne!(cache_key(&base), cache_key(&system));

        let mut options = serde_json::Map::new();
        options.insert("temperature".into(), json!(0.0));
        assert_ne!(cache_key(&base), cache_key(&base.clone().with_options(options)));
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let mock = Arc::new(MockProvider::new());
        mock.queue_text("first");
        mock.queue_text("second");
        let cached = CachedProvider::new(mock.clone(), Arc::new(MemoryCache::new(8)), &CachePolicy::default());

        let request = GenerateRequest::new("prompt");
        assert_eq!(cached.generate(&request).await.unwrap().raw_output, "first");
        assert_eq!(cached.generate(&request).await.unwrap().raw_output, "first");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_bypass_lookup_but_refresh_entry() {
        let mock = Arc::new(MockProvider::new());
        mock.queue_text("bad");
        mock.queue_text("good");
        let cache = Arc::new(MemoryCache::new(8));
        let cached = CachedProvider::new(mock.clone(), cache.clone(), &CachePolicy::default());

        let request = GenerateRequest::new("prompt");
        cached.generate(&request).await.unwrap();
        let retried = cached.generate(&request.clone().with_attempt(2)).await.unwrap();
        assert_eq!(retried.raw_output, "good");
        assert_eq!(cached.generate(&request).await.unwrap().raw_output, "good");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn provider_errors_are_not_cached() {
        let mock = Arc::new(MockProvider::new());
        mock.queue_error(ProviderError::Network("reset".into()));
        let cache = Arc::new(MemoryCache::new(8));
        let cached = CachedProvider::new(mock, cache.clone(), &CachePolicy::default());
        assert!(cached.generate(&GenerateRequest::new("p")).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new(8);
        cache.set("k", "v".into(), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.evict_expired().await, 1);
    }

    #[tokio::test]
    async fn memory_cache_evicts_least_recently_used() {
        let cache = MemoryCache::new(2);
        cache.set("a", "A".into(), None).await.unwrap();
        cache.set("b", "B".into(), None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("A"));

        cache.set("c", "C".into(), None).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("A"));
        assert_eq!(cache.get("c").await.unwrap().as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn memory_cache_overwrite_keeps_size() {
        let cache = MemoryCache::new(2);
        cache.set("a", "1".into(), None).await.unwrap();
        cache.set("a", "2".into(), None).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(MemoryCache::new(0).capacity().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_eviction_stops_with_cache() {
        let cache = Arc::new(MemoryCache::new(8));
        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await.unwrap();
        let task = cache.spawn_eviction(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.is_empty().await);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_cache_sweeps_expired_entries() {
        let config = CacheConfig {
            enabled: true,
            ttl_secs: Some(1),
            capacity: 4,
            eviction_interval_secs: 2,
        };
        let cache = MemoryCache::from_config(&config);
        assert_eq!(cache.capacity().await, 4);
        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn sqlite_store_is_a_cache_provider() {
        let store = storage::CacheStore::in_memory().unwrap();
        let provider: &dyn CacheProvider = &store;
        provider.set("k", "v".into(), None).await.unwrap();
        assert_eq!(provider.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
