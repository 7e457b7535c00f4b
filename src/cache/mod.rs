use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::instrument;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct CacheEntry<V> {
    value: V,
    expiration_ms: i64,
    refresh_handle: Option<JoinHandle<()>>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        now_ms() > self.expiration_ms
    }
}

impl<V> Drop for CacheEntry<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
    }
}

/// Monotonic, atomically-updated counters exposed alongside each cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub refreshes: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub refreshes: u64,
    pub hit_ratio: f64,
}

/// A concurrent TTL cache with scheduled background refresh. Loader
/// invocation is at-most-once per miss per caller; concurrent callers
/// racing on the same key may both invoke the loader, and the last write
/// wins — this is documented behavior, not a defect.
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    stats: CacheStats,
    default_ttl_ms: u64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl_ms: u64) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
            default_ttl_ms,
            shutdown_tx: tx,
            shutdown_rx: rx,
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns a non-expired cached value, or invokes `loader` on a miss
    /// (including a miss caused by expiry) and installs the result with
    /// the cache's default TTL and no scheduled refresh. Use
    /// `get_or_load_with_refresh` when a refresh loop should be armed.
    #[instrument(skip(self, loader))]
    pub async fn get<F, Fut>(self: &Arc<Self>, key: K, loader: F) -> Option<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        if let Some(v) = self.peek_live(&key).await {
            return Some(v);
        }

        self.count_miss(&key).await;

        match loader(key.clone()).await {
            Some(value) => {
                self.put(key, value.clone(), self.default_ttl_ms).await;
                Some(value)
            }
            None => {
                self.remove_silent(&key).await;
                None
            }
        }
    }

    /// Like `get`, but arms a periodic refresh against `loader` when the
    /// entry is (re)installed on a miss.
    pub async fn get_or_load_with_refresh<F, Fut>(
        self: &Arc<Self>,
        key: K,
        ttl_ms: u64,
        refresh_ms: u64,
        loader: Arc<F>,
    ) -> Option<V>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send,
    {
        if let Some(v) = self.peek_live(&key).await {
            return Some(v);
        }

        self.count_miss(&key).await;

        match loader(key.clone()).await {
            Some(value) => {
                self.put_with_loader(key, value.clone(), ttl_ms, refresh_ms, loader)
                    .await;
                Some(value)
            }
            None => {
                self.remove_silent(&key).await;
                None
            }
        }
    }

    async fn peek_live(self: &Arc<Self>, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    async fn count_miss(self: &Arc<Self>, key: &K) {
        let had_stale = {
            let entries = self.entries.read().await;
            entries.get(key).map(|e| e.is_expired()).unwrap_or(false)
        };
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if had_stale {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Install a value with the given TTL and no scheduled refresh. Any
    /// prior refresh for this key is cancelled (dropped with its entry).
    pub async fn put(self: &Arc<Self>, key: K, value: V, ttl_ms: u64) {
        let expiration_ms = now_ms() + ttl_ms as i64;
        let entry = CacheEntry {
            value,
            expiration_ms,
            refresh_handle: None,
        };
        self.entries.write().await.insert(key, entry);
    }

    /// Install a value and, if `refresh_ms > 0`, arm a scheduled refresh
    /// against `loader`.
    pub async fn put_with_loader<F, Fut>(
        self: &Arc<Self>,
        key: K,
        value: V,
        ttl_ms: u64,
        refresh_ms: u64,
        loader: Arc<F>,
    ) where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send,
    {
        self.put(key.clone(), value, ttl_ms).await;
        if refresh_ms > 0 {
            self.arm_refresh(key, refresh_ms, loader).await;
        }
    }

    fn spawn_refresh_task<F, Fut>(
        self: &Arc<Self>,
        key: K,
        refresh_ms: u64,
        loader: Arc<F>,
    ) -> JoinHandle<()>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(refresh_ms)).await;
            cache.fire_refresh(key, refresh_ms, loader).await;
        })
    }

    async fn arm_refresh<F, Fut>(self: &Arc<Self>, key: K, refresh_ms: u64, loader: Arc<F>)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send,
    {
        let handle = self.spawn_refresh_task(key.clone(), refresh_ms, loader);
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.refresh_handle = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Fired when a scheduled refresh timer elapses: reload the value if
    /// the entry is still present and unexpired, then reschedule. On a
    /// null reload, remove and count an eviction; errors are the loader's
    /// own concern (swallowed and logged by the caller, per cache policy).
    async fn fire_refresh<F, Fut>(self: Arc<Self>, key: K, refresh_ms: u64, loader: Arc<F>)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send,
    {
        let still_live = {
            let entries = self.entries.read().await;
            entries.get(&key).map(|e| !e.is_expired()).unwrap_or(false)
        };
        if !still_live {
            return;
        }

        match loader(key.clone()).await {
            Some(value) => {
                {
                    let mut entries = self.entries.write().await;
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.value = value;
                        entry.expiration_ms += self.default_ttl_ms as i64;
                    } else {
                        return;
                    }
                }
                self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                self.arm_refresh(key, refresh_ms, loader).await;
            }
            None => {
                self.remove_silent(&key).await;
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove an entry and cancel its pending refresh, counting an eviction.
    pub async fn remove(self: &Arc<Self>, key: &K) {
        let removed = self.entries.write().await.remove(key);
        if removed.is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn remove_silent(self: &Arc<Self>, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Cancel every pending refresh and clear the cache, incrementing
    /// evictions by the prior size.
    pub async fn clear(self: &Arc<Self>) {
        let mut entries = self.entries.write().await;
        let size = entries.len() as u64;
        entries.clear();
        drop(entries);
        if size > 0 {
            self.stats.evictions.fetch_add(size, Ordering::Relaxed);
        }
    }

    pub async fn len(self: &Arc<Self>) -> usize {
        self.entries.read().await.len()
    }

    /// Remove expired entries not already caught by a refresh. Intended to
    /// be driven by a periodic sweeper.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let mut entries = self.entries.write().await;
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        drop(entries);
        if !expired.is_empty() {
            self.stats
                .evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the sweeper and cancel all pending refreshes within `grace`,
    /// then force-clear remaining state.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(grace.min(Duration::from_secs(5))).await;
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn miss_then_hit_records_both_counters() {
        let cache: Arc<Cache<String, i32>> = Cache::new(10_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let v = cache
            .get("k".to_string(), move |_| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Some(42)
                }
            })
            .await;
        assert_eq!(v, Some(42));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let v2 = cache.get("k".to_string(), |_| async { unreachable!() }).await;
        assert_eq!(v2, Some(42));

        let snap = cache.stats().snapshot();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_reload() {
        let cache: Arc<Cache<String, i32>> = Cache::new(1);
        cache.put("k".to_string(), 1, 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let v = cache.get("k".to_string(), |_| async { Some(2) }).await;
        assert_eq!(v, Some(2));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn null_load_removes_entry() {
        let cache: Arc<Cache<String, i32>> = Cache::new(10_000);
        cache.put("k".to_string(), 1, 10_000).await;
        let v = cache.get("k".to_string(), |_| async { None }).await;
        assert_eq!(v, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn clear_counts_prior_size_as_evictions() {
        let cache: Arc<Cache<String, i32>> = Cache::new(10_000);
        cache.put("a".to_string(), 1, 10_000).await;
        cache.put("b".to_string(), 2, 10_000).await;
        cache.clear().await;
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 2);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let cache: Arc<Cache<String, i32>> = Cache::new(10_000);
        cache.put("fresh".to_string(), 1, 10_000).await;
        cache.put("stale".to_string(), 2, 0).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let swept = cache.sweep().await;
        assert_eq!(swept, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn refresh_extends_expiration_and_counts() {
        let cache: Arc<Cache<String, i32>> = Cache::new(50);
        let loader = Arc::new(|_: String| async { Some(99) });
        cache
            .put_with_loader("k".to_string(), 1, 50, 10, Arc::clone(&loader))
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.stats().refreshes.load(Ordering::Relaxed), 1);
        let v = cache.get("k".to_string(), |_| async { unreachable!() }).await;
        assert_eq!(v, Some(99));
    }
}
