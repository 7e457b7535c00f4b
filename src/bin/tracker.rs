use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use meshreg::net::{health_router, HealthState, TrackerServer};
use meshreg::registry::LocalRegistry;
use meshreg::telemetry::{self, Metrics};
use meshreg::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::load(&args)?;
    telemetry::init(&config.log_level);

    let registry = Arc::new(LocalRegistry::with_default_grace("tracker"));
    let metrics = Arc::new(Metrics::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    registry.spawn_sweeper(Duration::from_secs(5 * 60), shutdown_rx.clone());

    if config.healthcheck.enabled {
        let health_addr = SocketAddr::from(([0, 0, 0, 0], config.healthcheck.port));
        let state = HealthState {
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
        };
        let app = health_router(state);
        tokio::spawn(async move {
            if let Ok(listener) = tokio::net::TcpListener::bind(health_addr).await {
                tracing::info!(%health_addr, "health endpoint listening");
                let _ = axum::serve(listener, app).await;
            }
        });
    }

    let tracker_addr = SocketAddr::from(([0, 0, 0, 0], config.tracker.port));
    let server = TrackerServer::new(registry);

    tokio::select! {
        result = server.serve(tracker_addr, shutdown_rx) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}
