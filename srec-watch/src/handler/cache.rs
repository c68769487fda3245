//! Reference-counted handler cache with idle eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{HandlerKey, LivenessResolver, ResolverFactory};
use crate::error::ResolveError;

struct CacheEntry {
    resolver: Arc<dyn LivenessResolver>,
    refcount: usize,
    last_access: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<HandlerKey, CacheEntry>,
    total_created: u64,
    total_acquired: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub current_count: usize,
    /// Entries nobody holds right now but that have not been evicted yet.
    pub idle_count: usize,
    pub total_created: u64,
    pub total_acquired: u64,
}

/// Pool of liveness resolvers keyed by [`HandlerKey`].
///
/// All mutation goes through one mutex. An entry is evicted by [`sweep`]
/// only when no lease is outstanding and it has been idle for at least the
/// configured threshold.
///
/// [`sweep`]: HandlerCache::sweep
pub struct HandlerCache {
    inner: Arc<Mutex<CacheInner>>,
    factory: Arc<dyn ResolverFactory>,
    idle_threshold: Duration,
}

impl HandlerCache {
    pub fn new(factory: Arc<dyn ResolverFactory>, idle_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            factory,
            idle_threshold,
        }
    }

    /// Platform for `url`, as decided by the resolver factory.
    pub fn platform_for(&self, url: &str) -> Option<String> {
        self.factory.platform_for(url)
    }

    /// Get the resolver for `key`, building it on a miss.
    pub fn acquire(&self, key: &HandlerKey) -> Result<HandlerLease, ResolveError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let resolver = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.refcount += 1;
                entry.last_access = now;
                entry.resolver.clone()
            }
            None => {
                let resolver = self.factory.create(key)?;
                debug!(key = %key, "Created liveness handler");
                inner.entries.insert(
                    key.clone(),
                    CacheEntry {
                        resolver: resolver.clone(),
                        refcount: 1,
                        last_access: now,
                    },
                );
                inner.total_created += 1;
                resolver
            }
        };
        inner.total_acquired += 1;

        Ok(HandlerLease {
            key: key.clone(),
            resolver,
            cache: self.inner.clone(),
        })
    }

    /// Return a lease. Equivalent to dropping it.
    pub fn release(&self, lease: HandlerLease) {
        drop(lease);
    }

    /// Evict idle, unreferenced entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let threshold = self.idle_threshold;
        let before = inner.entries.len();

        inner.entries.retain(|key, entry| {
            let evict = entry.refcount == 0 && now.duration_since(entry.last_access) >= threshold;
            if evict {
                debug!(key = %key, "Evicting idle liveness handler");
            }
            !evict
        });

        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            current_count: inner.entries.len(),
            idle_count: inner.entries.values().filter(|e| e.refcount == 0).count(),
            total_created: inner.total_created,
            total_acquired: inner.total_acquired,
        }
    }

    /// Outstanding leases for `key`, or `None` if it is not cached.
    pub fn refcount(&self, key: &HandlerKey) -> Option<usize> {
        self.inner.lock().entries.get(key).map(|e| e.refcount)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Handler cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            let stats = cache.stats();
                            info!(
                                removed,
                                current = stats.current_count,
                                created = stats.total_created,
                                acquired = stats.total_acquired,
                                "Swept idle liveness handlers"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// A borrowed resolver. Dropping it releases the reference.
pub struct HandlerLease {
    key: HandlerKey,
    resolver: Arc<dyn LivenessResolver>,
    cache: Arc<Mutex<CacheInner>>,
}

impl HandlerLease {
    pub fn resolver(&self) -> &dyn LivenessResolver {
        self.resolver.as_ref()
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        let mut inner = self.cache.lock();
        if let Some(entry) = inner.entries.get_mut(&self.key) {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.last_access = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StreamInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline;

    #[async_trait]
    impl LivenessResolver for Offline {
        async fn resolve(&self, _url: &str) -> Result<StreamInfo, ResolveError> {
            Ok(StreamInfo::default())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ResolverFactory for CountingFactory {
        fn platform_for(&self, _url: &str) -> Option<String> {
            Some("test".to_string())
        }

        fn create(&self, key: &HandlerKey) -> Result<Arc<dyn LivenessResolver>, ResolveError> {
            if key.platform == "broken" {
                return Err(ResolveError::unsupported("no handler"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Offline))
        }
    }

    fn key(platform: &str) -> HandlerKey {
        HandlerKey {
            platform: platform.to_string(),
            proxy: None,
            credentials: None,
            quality: "OD".to_string(),
        }
    }

    fn cache(factory: Arc<CountingFactory>) -> HandlerCache {
        HandlerCache::new(factory, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_acquire_reuses_instance() {
        let factory = Arc::new(CountingFactory::default());
        let cache = cache(factory.clone());

        let a = cache.acquire(&key("a")).unwrap();
        let b = cache.acquire(&key("a")).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refcount(&key("a")), Some(2));
        assert!(Arc::ptr_eq(&a.resolver, &b.resolver));

        let stats = cache.stats();
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_acquired, 2);
    }

    #[tokio::test]
    async fn test_acquire_release_restores_refcount() {
        let cache = cache(Arc::new(CountingFactory::default()));
        let held = cache.acquire(&key("a")).unwrap();
        let before = cache.refcount(&key("a")).unwrap();

        let lease = cache.acquire(&key("a")).unwrap();
        cache.release(lease);
        assert_eq!(cache.refcount(&key("a")), Some(before));
        drop(held);
        assert_eq!(cache.refcount(&key("a")), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_unreferenced() {
        let cache = cache(Arc::new(CountingFactory::default()));
        cache.release(cache.acquire(&key("idle")).unwrap());
        let _held = cache.acquire(&key("held")).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.stats().idle_count, 1);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.refcount(&key("idle")), None);
        assert_eq!(cache.refcount(&key("held")), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_refreshes_idle_time() {
        let cache = cache(Arc::new(CountingFactory::default()));
        cache.release(cache.acquire(&key("a")).unwrap());

        tokio::time::advance(Duration::from_secs(200)).await;
        cache.release(cache.acquire(&key("a")).unwrap());
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn test_factory_failure_is_not_cached() {
        let cache = cache(Arc::new(CountingFactory::default()));
        assert!(cache.acquire(&key("broken")).is_err());
        assert_eq!(cache.stats().current_count, 0);
        assert_eq!(cache.stats().total_acquired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts() {
        let cache = Arc::new(cache(Arc::new(CountingFactory::default())));
        cache.release(cache.acquire(&key("a")).unwrap());

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(180), cancel.clone());

        tokio::time::sleep(Duration::from_secs(361)).await;
        assert_eq!(cache.stats().current_count, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
