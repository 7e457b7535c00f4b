use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use meshreg::net::{health_router, HealthState};
use meshreg::registry::{GossipEngine, LocalRegistry, TcpGossipTransport};
use meshreg::telemetry::{self, Metrics};
use meshreg::Config;

/// A peer: file host and client. File transfer and the peer wire
/// protocol are external collaborators outside this core; here the peer
/// announces itself to the tracker and joins the registry/gossip mesh.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::load(&args)?;
    telemetry::init(&config.log_level);

    let node_id = format!("peer-{}", uuid::Uuid::new_v4());
    let registry = Arc::new(LocalRegistry::with_default_grace(node_id.clone()));
    let metrics = Arc::new(Metrics::default());

    registry
        .register(
            "peer",
            &node_id,
            "0.0.0.0",
            config.discovery.gossip_port,
            Default::default(),
        )
        .await;

    if let Err(e) = announce_to_tracker(&config, &node_id).await {
        tracing::warn!(error = %e, "could not announce to tracker, continuing in gossip-only mode");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    registry.spawn_sweeper(Duration::from_secs(5 * 60), shutdown_rx.clone());

    if config.discovery.distributed_enabled {
        let engine = Arc::new(GossipEngine::new(
            node_id.clone(),
            Arc::clone(&registry),
            TcpGossipTransport,
            Arc::clone(&metrics),
            config.discovery.bootstrap_peers.clone(),
            config.discovery.gossip_fanout,
            Duration::from_millis(config.discovery.gossip_message_ttl_ms),
            3,
        ));
        engine.spawn_scheduler(Duration::from_millis(config.discovery.gossip_interval_ms), shutdown_rx.clone());

        let gossip_addr = SocketAddr::from(([0, 0, 0, 0], config.discovery.gossip_port));
        let serve_engine = Arc::clone(&engine);
        let serve_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_engine.serve(gossip_addr, serve_shutdown).await {
                tracing::warn!(error = %e, "gossip listener exited");
            }
        });
    }

    if config.healthcheck.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.healthcheck.port));
        let state = HealthState {
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
        };
        let app = health_router(state);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "peer health endpoint listening");
        tokio::select! {
            result = axum::serve(listener, app) => { result?; }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(true);
    }

    Ok(())
}

async fn announce_to_tracker(config: &Config, node_id: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], config.tracker.port).into();
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = format!("REGISTER {} {}\n", node_id, config.discovery.gossip_port);
    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    tracing::info!(response = line.trim_end(), "announced to tracker");
    Ok(())
}
