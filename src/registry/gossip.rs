use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::error::AppError;
use crate::pool::ConnectionPool;
use crate::resilience::{execute_with_retry_uncancellable, BackoffStrategy, CircuitBreaker};
use crate::telemetry::Metrics;

use super::instance::ServiceInstance;
use super::local::LocalRegistry;

/// Attempts and backoff bounds for the retry layer wrapping each outbound
/// gossip dispatch. Kept small: gossip is best-effort and already retried
/// at the round cadence, so this only smooths over a transient blip within
/// a single round rather than standing in for the round-level retry.
const DISPATCH_MAX_ATTEMPTS: u32 = 2;
const DISPATCH_INITIAL_BACKOFF_MS: u64 = 20;
const DISPATCH_MAX_BACKOFF_MS: u64 = 200;
const DISPATCH_POOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire message exchanged between gossip peers, per the documented JSON
/// schema. `ttl` is the chosen interpretation of message TTL: milliseconds
/// of remaining age rather than a hop count, matching the `"ttl":<ms>`
/// field name in the wire schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipMessage {
    #[serde(rename = "DIGEST")]
    Digest {
        origin: String,
        seq: u64,
        ttl: i64,
        entries: Vec<ServiceInstance>,
    },
    #[serde(rename = "SYNC")]
    Sync {
        origin: String,
        seq: u64,
        ttl: i64,
        entries: Vec<ServiceInstance>,
    },
    #[serde(rename = "ACK")]
    Ack {
        origin: String,
        seq: u64,
        ttl: i64,
        entries: Vec<ServiceInstance>,
    },
}

impl GossipMessage {
    pub fn origin(&self) -> &str {
        match self {
            GossipMessage::Digest { origin, .. }
            | GossipMessage::Sync { origin, .. }
            | GossipMessage::Ack { origin, .. } => origin,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            GossipMessage::Digest { seq, .. }
            | GossipMessage::Sync { seq, .. }
            | GossipMessage::Ack { seq, .. } => *seq,
        }
    }

    pub fn ttl(&self) -> i64 {
        match self {
            GossipMessage::Digest { ttl, .. }
            | GossipMessage::Sync { ttl, .. }
            | GossipMessage::Ack { ttl, .. } => *ttl,
        }
    }

    pub fn entries(&self) -> &[ServiceInstance] {
        match self {
            GossipMessage::Digest { entries, .. }
            | GossipMessage::Sync { entries, .. }
            | GossipMessage::Ack { entries, .. } => entries,
        }
    }
}

/// Transport abstraction so the engine can be driven over real TCP in
/// production and over an in-process loopback in tests.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send(&self, peer: &str, message: &GossipMessage) -> anyhow::Result<GossipMessage>;
}

/// Newline-delimited JSON over TCP, one request/response per connection.
pub struct TcpGossipTransport;

#[async_trait]
impl GossipTransport for TcpGossipTransport {
    async fn send(&self, peer: &str, message: &GossipMessage) -> anyhow::Result<GossipMessage> {
        let addr: SocketAddr = peer.parse()?;
        let mut stream = TcpStream::connect(addr).await?;
        let mut payload = serde_json::to_vec(message)?;
        payload.push(b'\n');
        stream.write_all(&payload).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let reply: GossipMessage = serde_json::from_str(line.trim_end())?;
        Ok(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerHealth {
    Active,
    Demoted,
}

#[derive(Debug, Clone)]
struct PeerState {
    health: PeerHealth,
    consecutive_failures: u32,
    backoff: Duration,
    /// Earliest time a demoted peer is eligible to be selected again.
    retry_after: Instant,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            health: PeerHealth::Active,
            consecutive_failures: 0,
            backoff: Duration::from_millis(500),
            retry_after: Instant::now(),
        }
    }
}

/// Drives periodic gossip rounds against a fanout of known peers, merging
/// inbound deltas into the local registry via the conflict resolver.
pub struct GossipEngine<T: GossipTransport> {
    node_id: String,
    registry: Arc<LocalRegistry>,
    transport: T,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
    peers: RwLock<HashMap<String, PeerState>>,
    seen: Mutex<HashSet<(String, u64)>>,
    seq: AtomicU64,
    metrics: Arc<Metrics>,
    fanout: usize,
    message_ttl: Duration,
    peer_failure_threshold: u32,
    anti_entropy_every: u32,
    round: AtomicU64,
}

impl<T: GossipTransport> GossipEngine<T> {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<LocalRegistry>,
        transport: T,
        metrics: Arc<Metrics>,
        bootstrap_peers: Vec<String>,
        fanout: usize,
        message_ttl: Duration,
        peer_failure_threshold: u32,
    ) -> Self {
        let peers = bootstrap_peers
            .into_iter()
            .map(|p| (p, PeerState::default()))
            .collect();
        let breaker = CircuitBreaker::new(peer_failure_threshold, Duration::from_secs(30), 1)
            .with_metrics(Arc::clone(&metrics));
        Self {
            node_id: node_id.into(),
            registry,
            transport,
            pool: ConnectionPool::new(fanout.max(1), DISPATCH_POOL_TIMEOUT),
            breaker,
            peers: RwLock::new(peers),
            seen: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
            metrics,
            fanout,
            message_ttl,
            peer_failure_threshold,
            anti_entropy_every: 10,
            round: AtomicU64::new(0),
        }
    }

    pub async fn add_peer(&self, peer: String) {
        let mut peers = self.peers.write().await;
        peers.entry(peer).or_default();
    }

    /// Accept inbound gossip connections on `addr`, one newline-delimited
    /// JSON message per connection, replying with the `Ack` from
    /// `handle_inbound`. Unknown `type` values fail to deserialize and are
    /// logged and dropped rather than taking the connection down.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>
    where
        T: 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        debug!(%addr, "gossip engine listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "gossip accept failed");
                            continue;
                        }
                    };
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_inbound_connection(stream).await {
                            debug!(%peer_addr, error = %e, "gossip connection ended");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_inbound_connection(&self, stream: tokio::net::TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let message: GossipMessage = match serde_json::from_str(line.trim_end()) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping gossip message with unrecognized shape");
                return Ok(());
            }
        };

        let reply = self.handle_inbound(message).await;
        let mut payload = serde_json::to_vec(&reply)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;
        Ok(())
    }

    /// Discover additional peers from the registry's `peer`-typed entries.
    pub async fn discover_peers_from_registry(&self) {
        let known = self.registry.find("peer").await;
        let mut peers = self.peers.write().await;
        for instance in known {
            let addr = format!("{}:{}", instance.host, instance.port);
            peers.entry(addr).or_default();
        }
    }

    async fn select_fanout(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut candidates: Vec<String> = peers
            .iter()
            .filter(|(_, state)| state.health == PeerHealth::Active)
            .map(|(addr, _)| addr.clone())
            .collect();
        // Demoted peers only re-enter the candidate pool once their
        // exponential backoff has actually elapsed, when there aren't
        // enough active peers to fill the fanout.
        if candidates.len() < self.fanout {
            let now = Instant::now();
            let demoted: Vec<String> = peers
                .iter()
                .filter(|(_, state)| state.health == PeerHealth::Demoted && now >= state.retry_after)
                .map(|(addr, _)| addr.clone())
                .collect();
            candidates.extend(demoted);
        }
        drop(peers);

        let mut rng = rand::rng();
        candidates.shuffle(&mut rng);
        candidates.truncate(self.fanout);
        candidates
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one gossip round: digest push-pull against a random fanout, or
    /// a full anti-entropy sync every `anti_entropy_every` rounds.
    #[instrument(skip(self))]
    pub async fn run_round(&self) {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        self.metrics.gossip_rounds.fetch_add(1, Ordering::Relaxed);

        let peers = self.select_fanout().await;
        if peers.is_empty() {
            return;
        }

        let full_sync = round % self.anti_entropy_every as u64 == 0 && round != 0;
        for peer in peers {
            if full_sync {
                self.anti_entropy_with(&peer).await;
            } else {
                self.digest_round_with(&peer).await;
            }
        }
    }

    async fn build_message(&self, variant: GossipKind, entries: Vec<ServiceInstance>) -> GossipMessage {
        let seq = self.next_seq();
        let ttl = self.message_ttl.as_millis() as i64;
        match variant {
            GossipKind::Digest => GossipMessage::Digest {
                origin: self.node_id.clone(),
                seq,
                ttl,
                entries,
            },
            GossipKind::Sync => GossipMessage::Sync {
                origin: self.node_id.clone(),
                seq,
                ttl,
                entries,
            },
            GossipKind::Ack => GossipMessage::Ack {
                origin: self.node_id.clone(),
                seq,
                ttl,
                entries,
            },
        }
    }

    async fn digest_round_with(&self, peer: &str) {
        let entries = self.registry.snapshot_all().await;
        let digest = self.build_message(GossipKind::Digest, entries).await;

        match self.dispatch(peer, &digest).await {
            Ok(reply) => {
                self.metrics.gossip_messages_sent.fetch_add(1, Ordering::Relaxed);
                self.handle_inbound(reply).await;
                self.mark_success(peer).await;
            }
            Err(e) => {
                debug!(%peer, error = %e, "gossip digest round failed");
                self.metrics.gossip_messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.mark_failure(peer).await;
            }
        }
    }

    async fn anti_entropy_with(&self, peer: &str) {
        let entries = self.registry.snapshot_all().await;
        let sync = self.build_message(GossipKind::Sync, entries).await;

        match self.dispatch(peer, &sync).await {
            Ok(reply) => {
                self.metrics.gossip_messages_sent.fetch_add(1, Ordering::Relaxed);
                self.handle_inbound(reply).await;
                self.mark_success(peer).await;
            }
            Err(e) => {
                debug!(%peer, error = %e, "gossip anti-entropy round failed");
                self.metrics.gossip_messages_dropped.fetch_add(1, Ordering::Relaxed);
                self.mark_failure(peer).await;
            }
        }
    }

    /// Routes one outbound gossip call through the connection pool, circuit
    /// breaker and retry layer, per the data-flow requirement that outbound
    /// network calls flow through Connection Pool and are wrapped by
    /// Retry/Circuit Breaker.
    async fn dispatch(&self, peer: &str, message: &GossipMessage) -> anyhow::Result<GossipMessage> {
        let pool_result = self
            .pool
            .execute_with_connection(|| async {
                execute_with_retry_uncancellable(
                    || async {
                        self.breaker
                            .execute(
                                || async {
                                    self.transport
                                        .send(peer, message)
                                        .await
                                        .map_err(|e| AppError::Network(e.to_string()))
                                },
                                AppError::is_retryable,
                            )
                            .await
                    },
                    DISPATCH_MAX_ATTEMPTS,
                    DISPATCH_INITIAL_BACKOFF_MS,
                    DISPATCH_MAX_BACKOFF_MS,
                    AppError::is_retryable,
                    BackoffStrategy::ExponentialJitter,
                )
                .await
            })
            .await;

        match pool_result {
            Ok(inner) => inner.map_err(|e| anyhow::anyhow!(e.to_string())),
            Err(e) => Err(anyhow::anyhow!(e.to_string())),
        }
    }

    /// Process an inbound message (as a client or as a server handling a
    /// peer's request): merge every still-live entry into the registry,
    /// subject to TTL and dedup.
    pub async fn handle_inbound(&self, message: GossipMessage) -> GossipMessage {
        let key = (message.origin().to_string(), message.seq());
        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&key) {
                return self.build_ack(Vec::new()).await;
            }
            seen.insert(key);
        }

        if message.ttl() <= 0 {
            self.metrics.gossip_messages_dropped.fetch_add(1, Ordering::Relaxed);
            return self.build_ack(Vec::new()).await;
        }

        let mut stale_for_sender = Vec::new();
        for entry in message.entries() {
            let identity = entry.identity();
            let before = self.registry.find_by_id(&identity.0, &identity.1).await;
            self.registry.apply(entry.clone()).await;
            let after = self.registry.find_by_id(&identity.0, &identity.1).await;
            if before.as_ref().map(|b| &b.version) != after.as_ref().map(|a| &a.version) {
                if let Some(after) = after {
                    stale_for_sender.push(after);
                }
            }
        }

        self.build_ack(stale_for_sender).await
    }

    async fn build_ack(&self, entries: Vec<ServiceInstance>) -> GossipMessage {
        self.build_message(GossipKind::Ack, entries).await
    }

    async fn mark_success(&self, peer: &str) {
        let mut peers = self.peers.write().await;
        if let Some(state) = peers.get_mut(peer) {
            state.health = PeerHealth::Active;
            state.consecutive_failures = 0;
            state.backoff = Duration::from_millis(500);
            state.retry_after = Instant::now();
        }
    }

    async fn mark_failure(&self, peer: &str) {
        let mut peers = self.peers.write().await;
        if let Some(state) = peers.get_mut(peer) {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.peer_failure_threshold {
                if state.health != PeerHealth::Demoted {
                    warn!(%peer, "demoting unreachable peer");
                }
                state.health = PeerHealth::Demoted;
                state.backoff = (state.backoff * 2).min(Duration::from_secs(60));
                state.retry_after = Instant::now() + state.backoff;
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Spawn the periodic round scheduler; stops when `shutdown` fires.
    pub fn spawn_scheduler(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) where
        T: 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.discover_peers_from_registry().await;
                        engine.run_round().await;
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

enum GossipKind {
    Digest,
    Sync,
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::vector_clock::VectorClock;
    use std::sync::atomic::AtomicUsize;

    /// Directly wires one engine's outbound messages into a peer engine's
    /// `handle_inbound`, with no actual sockets.
    struct LoopbackTransport {
        peer_engine: Arc<GossipEngine<NullTransport>>,
        calls: AtomicUsize,
    }

    struct NullTransport;

    #[async_trait]
    impl GossipTransport for NullTransport {
        async fn send(&self, _peer: &str, _message: &GossipMessage) -> anyhow::Result<GossipMessage> {
            anyhow::bail!("null transport never sends")
        }
    }

    #[async_trait]
    impl GossipTransport for LoopbackTransport {
        async fn send(&self, _peer: &str, message: &GossipMessage) -> anyhow::Result<GossipMessage> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.peer_engine.handle_inbound(message.clone()).await)
        }
    }

    #[tokio::test]
    async fn digest_round_converges_two_nodes() {
        let registry_a = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let registry_b = Arc::new(LocalRegistry::with_default_grace("node-b"));

        registry_a
            .register("tracker", "t1", "host-a", 6000, HashMap::new())
            .await;

        let engine_b = Arc::new(GossipEngine::new(
            "node-b",
            Arc::clone(&registry_b),
            NullTransport,
            Arc::new(Metrics::default()),
            Vec::new(),
            3,
            Duration::from_secs(30),
            3,
        ));

        let transport_a = LoopbackTransport {
            peer_engine: Arc::clone(&engine_b),
            calls: AtomicUsize::new(0),
        };

        let engine_a = GossipEngine::new(
            "node-a",
            Arc::clone(&registry_a),
            transport_a,
            Arc::new(Metrics::default()),
            vec!["peer-b".to_string()],
            3,
            Duration::from_secs(30),
            3,
        );

        engine_a.run_round().await;

        let on_b = registry_b.find_by_id("tracker", "t1").await;
        assert!(on_b.is_some());
        assert_eq!(on_b.unwrap().host, "host-a");
    }

    #[tokio::test]
    async fn expired_ttl_message_is_dropped() {
        let registry = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let engine = GossipEngine::new(
            "node-a",
            registry,
            NullTransport,
            Arc::new(Metrics::default()),
            Vec::new(),
            3,
            Duration::from_secs(30),
            3,
        );

        let mut clock = VectorClock::new();
        clock.increment_for("node-z");
        let instance = ServiceInstance::new("tracker", "t1", "h", 1, None, "node-z", clock, 0);

        let msg = GossipMessage::Digest {
            origin: "node-z".to_string(),
            seq: 1,
            ttl: -1,
            entries: vec![instance],
        };

        let reply = engine.handle_inbound(msg).await;
        assert!(reply.entries().is_empty());
        assert!(engine.registry.find_by_id("tracker", "t1").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_message_is_deduped() {
        let registry = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let engine = GossipEngine::new(
            "node-a",
            registry,
            NullTransport,
            Arc::new(Metrics::default()),
            Vec::new(),
            3,
            Duration::from_secs(30),
            3,
        );

        let mut clock = VectorClock::new();
        clock.increment_for("node-z");
        let instance = ServiceInstance::new("tracker", "t1", "h", 1, None, "node-z", clock, 0);

        let msg = GossipMessage::Digest {
            origin: "node-z".to_string(),
            seq: 7,
            ttl: 1000,
            entries: vec![instance],
        };

        engine.handle_inbound(msg.clone()).await;
        assert!(engine.registry.find_by_id("tracker", "t1").await.is_some());
        engine.registry.deregister("tracker", "t1").await;

        // Same (origin, seq) again must be ignored even though the entry
        // is now locally tombstoned: dedup happens before apply.
        let reply = engine.handle_inbound(msg).await;
        assert!(reply.entries().is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_demote_peer() {
        let registry = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let engine = GossipEngine::new(
            "node-a",
            registry,
            NullTransport,
            Arc::new(Metrics::default()),
            vec!["unreachable-peer".to_string()],
            1,
            Duration::from_secs(30),
            2,
        );

        engine.run_round().await;
        engine.run_round().await;

        let peers = engine.peers.read().await;
        let state = peers.get("unreachable-peer").unwrap();
        assert_eq!(state.health, PeerHealth::Demoted);
    }

    #[tokio::test]
    async fn demoted_peer_excluded_before_backoff_elapses() {
        let registry = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let engine = GossipEngine::new(
            "node-a",
            registry,
            NullTransport,
            Arc::new(Metrics::default()),
            Vec::new(),
            1,
            Duration::from_secs(30),
            2,
        );

        {
            let mut peers = engine.peers.write().await;
            peers.insert(
                "peer-x".to_string(),
                PeerState {
                    health: PeerHealth::Demoted,
                    consecutive_failures: 5,
                    backoff: Duration::from_secs(60),
                    retry_after: Instant::now() + Duration::from_secs(60),
                },
            );
        }

        assert!(engine.select_fanout().await.is_empty());
    }

    #[tokio::test]
    async fn demoted_peer_reenters_fanout_after_backoff_elapses() {
        let registry = Arc::new(LocalRegistry::with_default_grace("node-a"));
        let engine = GossipEngine::new(
            "node-a",
            registry,
            NullTransport,
            Arc::new(Metrics::default()),
            Vec::new(),
            1,
            Duration::from_secs(30),
            2,
        );

        {
            let mut peers = engine.peers.write().await;
            peers.insert(
                "peer-x".to_string(),
                PeerState {
                    health: PeerHealth::Demoted,
                    consecutive_failures: 5,
                    backoff: Duration::from_millis(10),
                    retry_after: Instant::now() - Duration::from_millis(1),
                },
            );
        }

        assert_eq!(engine.select_fanout().await, vec!["peer-x".to_string()]);
    }
}
