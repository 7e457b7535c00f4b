use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::instance::{Identity, ServiceInstance};
use super::resolver::resolve;
use super::vector_clock::VectorClock;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of applying a remote version of an instance to the local
/// registry, per the conflict resolver's three-way classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The remote version was new (no local entry existed).
    Accepted,
    /// The local version already dominates; the remote version was dropped.
    Rejected,
    /// The remote and local versions were combined via the resolver.
    Merged,
}

/// In-process map of services by `(serviceType, serviceId)`, with an
/// inverted index from service type to the set of known ids. Tombstones
/// are retained (but hidden from `find`/`find_by_id`) until they age past
/// `tombstone_grace`, to avoid resurrecting a deleted entry via stale
/// gossip.
#[derive(Debug)]
pub struct LocalRegistry {
    node_id: String,
    entries: RwLock<HashMap<Identity, ServiceInstance>>,
    by_type: RwLock<HashMap<String, BTreeSet<String>>>,
    tombstone_grace: Duration,
}

impl LocalRegistry {
    pub fn new(node_id: impl Into<String>, tombstone_grace: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            entries: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
            tombstone_grace,
        }
    }

    pub fn with_default_grace(node_id: impl Into<String>) -> Self {
        Self::new(node_id, Duration::from_secs(5 * 60))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Author a new live version for this identity. Returns `false` if an
    /// identical live version already exists (a no-op re-registration).
    #[instrument(skip(self, metadata))]
    pub async fn register(
        &self,
        service_type: &str,
        service_id: &str,
        host: &str,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> bool {
        let identity = (service_type.to_string(), service_id.to_string());
        let mut entries = self.entries.write().await;

        let mut version = entries
            .get(&identity)
            .map(|e| e.version.clone())
            .unwrap_or_default();

        if let Some(existing) = entries.get(&identity) {
            let unchanged = !existing.tombstone
                && existing.host == host
                && existing.port == port
                && existing.metadata == metadata;
            if unchanged {
                return false;
            }
        }

        version.increment_for(&self.node_id);
        let instance = ServiceInstance::new(
            service_type,
            service_id,
            host,
            port,
            Some(metadata),
            self.node_id.clone(),
            version,
            now_ms(),
        );

        entries.insert(identity, instance);
        drop(entries);

        let mut by_type = self.by_type.write().await;
        by_type
            .entry(service_type.to_string())
            .or_default()
            .insert(service_id.to_string());

        info!("registered {}/{}", service_type, service_id);
        true
    }

    /// Install a tombstone for this identity. Returns `false` if no live
    /// entry existed to deregister.
    #[instrument(skip(self))]
    pub async fn deregister(&self, service_type: &str, service_id: &str) -> bool {
        let identity = (service_type.to_string(), service_id.to_string());
        let mut entries = self.entries.write().await;

        let existing = match entries.get(&identity) {
            Some(e) if !e.tombstone => e.clone(),
            _ => return false,
        };

        let dead = existing.as_tombstone(&self.node_id, now_ms());
        entries.insert(identity, dead);
        info!("deregistered {}/{}", service_type, service_id);
        true
    }

    /// Non-tombstoned entries for a service type, copy-on-read.
    pub async fn find(&self, service_type: &str) -> Vec<ServiceInstance> {
        let by_type = self.by_type.read().await;
        let Some(ids) = by_type.get(service_type) else {
            return Vec::new();
        };
        let entries = self.entries.read().await;
        ids.iter()
            .filter_map(|id| entries.get(&(service_type.to_string(), id.clone())))
            .filter(|e| !e.tombstone)
            .cloned()
            .collect()
    }

    pub async fn find_by_id(&self, service_type: &str, service_id: &str) -> Option<ServiceInstance> {
        let entries = self.entries.read().await;
        entries
            .get(&(service_type.to_string(), service_id.to_string()))
            .filter(|e| !e.tombstone)
            .cloned()
    }

    /// Every entry including tombstones, for gossip exchange / anti-entropy.
    pub async fn snapshot_all(&self) -> Vec<ServiceInstance> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Apply an inbound version of an instance, delegating to the conflict
    /// resolver. Mutation is serialized by holding the entries write lock
    /// across the check-then-write, so concurrent `apply`/`register` calls
    /// against the same identity cannot interleave.
    #[instrument(skip(self, remote))]
    pub async fn apply(&self, remote: ServiceInstance) -> ApplyOutcome {
        let identity = remote.identity();
        let mut entries = self.entries.write().await;

        let outcome = match entries.get(&identity) {
            None => {
                entries.insert(identity.clone(), remote.clone());
                ApplyOutcome::Accepted
            }
            Some(local) => {
                let winner = resolve(local, &remote);
                let changed = winner.version != local.version
                    || winner.host != local.host
                    || winner.port != local.port
                    || winner.tombstone != local.tombstone;
                entries.insert(identity.clone(), winner);
                if changed {
                    ApplyOutcome::Merged
                } else {
                    ApplyOutcome::Rejected
                }
            }
        };
        drop(entries);

        if !matches!(outcome, ApplyOutcome::Rejected) {
            let mut by_type = self.by_type.write().await;
            by_type
                .entry(identity.0.clone())
                .or_default()
                .insert(identity.1.clone());
        }

        outcome
    }

    /// Purge tombstones that have aged past the grace period. Intended to
    /// be driven by a periodic sweeper task.
    pub async fn sweep_tombstones(&self) -> usize {
        let cutoff = now_ms() - self.tombstone_grace.as_millis() as i64;
        let mut entries = self.entries.write().await;
        let dead: Vec<Identity> = entries
            .iter()
            .filter(|(_, inst)| inst.tombstone && inst.timestamp_ms < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &dead {
            entries.remove(id);
        }
        drop(entries);

        if !dead.is_empty() {
            let mut by_type = self.by_type.write().await;
            for (service_type, service_id) in &dead {
                if let Some(ids) = by_type.get_mut(service_type) {
                    ids.remove(service_id);
                    if ids.is_empty() {
                        by_type.remove(service_type);
                    }
                }
            }
            warn!("swept {} aged tombstones", dead.len());
        }

        dead.len()
    }

    /// Spawn the periodic tombstone sweeper; stops when `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_tombstones().await;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_find_round_trips() {
        let reg = LocalRegistry::with_default_grace("node-a");
        assert!(
            reg.register("tracker", "t1", "h1", 6000, HashMap::new())
                .await
        );
        let found = reg.find("tracker").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "h1");
    }

    #[tokio::test]
    async fn duplicate_register_returns_false() {
        let reg = LocalRegistry::with_default_grace("node-a");
        assert!(reg.register("peer", "p1", "h", 1, HashMap::new()).await);
        assert!(!reg.register("peer", "p1", "h", 1, HashMap::new()).await);
    }

    #[tokio::test]
    async fn deregister_hides_from_find() {
        let reg = LocalRegistry::with_default_grace("node-a");
        reg.register("peer", "p1", "h", 1, HashMap::new()).await;
        assert!(reg.deregister("peer", "p1").await);
        assert!(reg.find("peer").await.is_empty());
        assert!(reg.find_by_id("peer", "p1").await.is_none());
    }

    #[tokio::test]
    async fn deregister_unknown_returns_false() {
        let reg = LocalRegistry::with_default_grace("node-a");
        assert!(!reg.deregister("peer", "ghost").await);
    }

    #[tokio::test]
    async fn tombstones_survive_in_snapshot_until_swept() {
        let reg = LocalRegistry::new("node-a", Duration::from_millis(0));
        reg.register("peer", "p1", "h", 1, HashMap::new()).await;
        reg.deregister("peer", "p1").await;
        assert_eq!(reg.snapshot_all().await.len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = reg.sweep_tombstones().await;
        assert_eq!(swept, 1);
        assert!(reg.snapshot_all().await.is_empty());
    }

    #[tokio::test]
    async fn apply_accepts_unknown_identity() {
        let reg = LocalRegistry::with_default_grace("node-a");
        let mut clock = VectorClock::new();
        clock.increment_for("node-b");
        let remote = super::super::instance::ServiceInstance::new(
            "tracker", "t1", "h", 1, None, "node-b", clock, 0,
        );
        assert_eq!(reg.apply(remote).await, ApplyOutcome::Accepted);
    }

    #[tokio::test]
    async fn apply_rejects_stale_version() {
        let reg = LocalRegistry::with_default_grace("node-a");
        reg.register("tracker", "t1", "h1", 6000, HashMap::new()).await;
        let local = reg.find_by_id("tracker", "t1").await.unwrap();

        // A remote version with a strictly dominated clock must be rejected.
        let stale = ServiceInstance::new(
            "tracker", "t1", "stale-host", 1, None, "node-z", VectorClock::new(), -1,
        );
        assert_eq!(reg.apply(stale).await, ApplyOutcome::Rejected);
        assert_eq!(reg.find_by_id("tracker", "t1").await.unwrap().host, local.host);
    }
}
