use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::AppResult;
use crate::registry::LocalRegistry;

/// The tracker's line-oriented peer membership protocol: `REGISTER`,
/// `DISCOVER`, one connection handled persistently until the peer
/// disconnects (newline-delimited requests rather than one-shot).
pub struct TrackerServer {
    registry: Arc<LocalRegistry>,
}

impl TrackerServer {
    pub fn new(registry: Arc<LocalRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn serve(
        &self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::AppError::Network(e.to_string()))?;
        info!(%addr, "tracker listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "tracker accept failed");
                            continue;
                        }
                    };
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, registry).await {
                            warn!(%peer_addr, error = %e, "tracker connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tracker shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<LocalRegistry>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let response = handle_line(line.trim_end(), peer_addr, &registry).await;
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;
    }

    Ok(())
}

async fn handle_line(line: &str, peer_addr: SocketAddr, registry: &LocalRegistry) -> String {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("REGISTER") => {
            let (Some(peer_id), Some(port_str)) = (parts.next(), parts.next()) else {
                return "ERROR REGISTER requires <peerId> <port>".to_string();
            };
            let Ok(port) = port_str.parse::<u16>() else {
                return format!("ERROR invalid port: {}", port_str);
            };
            registry
                .register(
                    "peer",
                    peer_id,
                    &peer_addr.ip().to_string(),
                    port,
                    std::collections::HashMap::new(),
                )
                .await;
            format!("REGISTERED {}", peer_id)
        }
        Some("DISCOVER") => {
            let peers = registry.find("peer").await;
            let formatted: Vec<String> = peers
                .iter()
                .map(|p| format!("{}@{}:{}", p.service_id, p.host, p.port))
                .collect();
            format!("PEERS [{}]", formatted.join(", "))
        }
        Some(other) => format!("ERROR unknown verb: {}", other),
        None => "ERROR empty request".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_discover_round_trips() {
        let registry = Arc::new(LocalRegistry::with_default_grace("tracker-node"));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let reply = handle_line("REGISTER peer-1 7001", addr, &registry).await;
        assert_eq!(reply, "REGISTERED peer-1");

        let reply = handle_line("DISCOVER", addr, &registry).await;
        assert!(reply.starts_with("PEERS ["));
        assert!(reply.contains("peer-1@127.0.0.1:7001"));
    }

    #[tokio::test]
    async fn unknown_verb_returns_error() {
        let registry = Arc::new(LocalRegistry::with_default_grace("tracker-node"));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let reply = handle_line("FROB", addr, &registry).await;
        assert!(reply.starts_with("ERROR"));
    }

    #[tokio::test]
    async fn register_missing_port_is_error() {
        let registry = Arc::new(LocalRegistry::with_default_grace("tracker-node"));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let reply = handle_line("REGISTER peer-1", addr, &registry).await;
        assert!(reply.starts_with("ERROR"));
    }
}
