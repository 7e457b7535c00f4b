use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the process-wide tracing subscriber at the given level
/// (falls back to "info" on parse failure rather than panicking at
/// startup over a bad config value).
pub fn init(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Lightweight counters surfaced through the detailed health endpoint.
/// Gated by `metrics.enabled`; this is not a Prometheus exporter, just
/// enough visibility to keep ambient observability honest. Cache and pool
/// activity have their own dedicated counters (`cache::CacheStats`,
/// `pool::PoolStats`) on the instances that do the work; this struct only
/// tracks the process-wide gossip/breaker activity that has no single
/// owning instance to ask.
#[derive(Debug, Default)]
pub struct Metrics {
    pub gossip_rounds: AtomicU64,
    pub gossip_messages_sent: AtomicU64,
    pub gossip_messages_dropped: AtomicU64,
    pub breaker_trips: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            gossip_messages_sent: self.gossip_messages_sent.load(Ordering::Relaxed),
            gossip_messages_dropped: self.gossip_messages_dropped.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub gossip_rounds: u64,
    pub gossip_messages_sent: u64,
    pub gossip_messages_dropped: u64,
    pub breaker_trips: u64,
}
