use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{instrument, warn};

use crate::error::{AppError, AppResult};

/// Lifecycle counters for a pool, observable consistently with each other
/// at shutdown per the pool's invariants.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub active_connections: AtomicU64,
    pub total_connections_created: AtomicU64,
    pub connection_timeouts: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatsSnapshot {
    pub active_connections: u64,
    pub total_connections_created: u64,
    pub connection_timeouts: u64,
    pub total_wait_time_ms: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections_created: self.total_connections_created.load(Ordering::Relaxed),
            connection_timeouts: self.connection_timeouts.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `active_connections` on drop, so the counter stays accurate
/// even if the wrapped task panics mid-await.
struct ActiveConnectionGuard<'a> {
    stats: &'a PoolStats,
}

impl Drop for ActiveConnectionGuard<'_> {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A bounded semaphore limiting concurrent access to some resource. The
/// permit is held for the duration of the supplied task and released on
/// every exit path, including the task panicking.
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    connection_timeout: Duration,
    stats: PoolStats,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize, connection_timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            connection_timeout,
            stats: PoolStats::default(),
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Acquire one permit within `connectionTimeoutMs`, run `task`, and
    /// release the permit on every exit path.
    #[instrument(skip(self, task))]
    pub async fn execute_with_connection<F, Fut, T>(&self, task: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if *self.shutdown_rx.borrow() {
            return Err(AppError::ServiceUnavailable("pool is shutting down".to_string()));
        }

        let wait_start = Instant::now();
        let permit = tokio::time::timeout(self.connection_timeout, self.semaphore.acquire()).await;

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(AppError::Internal("pool semaphore closed".to_string()));
            }
            Err(_) => {
                self.stats.connection_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("connection pool acquisition timed out");
                return Err(AppError::Timeout("connection pool acquisition timed out".to_string()));
            }
        };

        let waited_ms = wait_start.elapsed().as_millis() as u64;
        self.stats.total_wait_time_ms.fetch_add(waited_ms, Ordering::Relaxed);
        self.stats.total_connections_created.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // The permit's own Drop releases semaphore capacity even if `task`
        // panics, but a post-await fetch_sub would not: this guard decrements
        // the counter on every exit path, including unwind.
        let _active_guard = ActiveConnectionGuard { stats: &self.stats };
        let result = task().await;
        drop(permit);

        Ok(result)
    }

    /// Forbid new acquisitions and wait up to `grace` for outstanding
    /// permits to be released.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + grace;
        while self.stats.active_connections.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[tokio::test]
    async fn executes_task_and_releases_permit() {
        let pool = ConnectionPool::new(2, Duration::from_millis(500));
        let result = pool.execute_with_connection(|| async { 7 }).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(pool.stats().active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(pool.stats().total_connections_created.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn never_exceeds_max_connections() {
        let pool = Arc::new(ConnectionPool::new(2, Duration::from_millis(500)));
        let peak = Arc::new(AtomicI64::new(0));
        let current = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                pool.execute_with_connection(|| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn timeout_increments_counter_when_pool_exhausted() {
        let pool = Arc::new(ConnectionPool::new(1, Duration::from_millis(20)));
        let pool2 = Arc::clone(&pool);
        let holder = tokio::spawn(async move {
            pool2
                .execute_with_connection(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = pool.execute_with_connection(|| async {}).await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
        assert_eq!(pool.stats().connection_timeouts.load(Ordering::Relaxed), 1);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_outstanding_permits() {
        let pool = Arc::new(ConnectionPool::new(1, Duration::from_millis(500)));
        let pool2 = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            pool2
                .execute_with_connection(|| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.shutdown(Duration::from_millis(200)).await;
        assert_eq!(pool.stats().active_connections.load(Ordering::Relaxed), 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_task_still_releases_active_connection_count() {
        let pool = Arc::new(ConnectionPool::new(2, Duration::from_millis(500)));
        let pool2 = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            pool2
                .execute_with_connection(|| async { panic!("boom") })
                .await
        });

        assert!(handle.await.is_err(), "spawned task should have panicked");
        assert_eq!(pool.stats().active_connections.load(Ordering::Relaxed), 0);
    }
}
