use std::collections::HashMap;
use std::env;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// Process configuration, covering every key from the external interfaces
/// section. Values are resolved in precedence order: CLI `--config.<key>=<v>`,
/// process environment, a properties file named by `--config.file=<path>`,
/// then built-in defaults. An invalid value falls back to the default and
/// logs a warning rather than failing startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub discovery: DiscoveryConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub healthcheck: HealthcheckConfig,
    pub log_level: String,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub port: u16,
    pub threadpool_size: usize,
    pub peer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub distributed_enabled: bool,
    pub gossip_port: u16,
    pub gossip_interval_ms: u64,
    pub gossip_fanout: usize,
    pub gossip_message_ttl_ms: u64,
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub default_refresh_ms: u64,
    pub sweeper_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig {
                port: 6000,
                threadpool_size: 10,
                peer_timeout_ms: 90_000,
            },
            discovery: DiscoveryConfig {
                distributed_enabled: false,
                gossip_port: 6003,
                gossip_interval_ms: 5_000,
                gossip_fanout: 3,
                gossip_message_ttl_ms: 30_000,
                bootstrap_peers: Vec::new(),
            },
            cache: CacheConfig {
                default_ttl_ms: 60_000,
                default_refresh_ms: 0,
                sweeper_interval_ms: 60_000,
            },
            pool: PoolConfig {
                max_connections: 20,
                connection_timeout_ms: 5_000,
            },
            healthcheck: HealthcheckConfig {
                enabled: true,
                interval_ms: 30_000,
                port: 6100,
            },
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, environment, and an optional
    /// properties file, in that precedence order, falling back to defaults.
    pub fn load(args: &[String]) -> AppResult<Self> {
        let mut overrides: HashMap<String, String> = HashMap::new();

        // Lowest of the three override sources: properties file, if named.
        if let Some(path) = find_cli_value(args, "config.file") {
            match fs::read_to_string(&path) {
                Ok(contents) => overrides.extend(parse_properties(&contents)),
                Err(e) => tracing::warn!("could not read config file {}: {}", path, e),
            }
        }

        // Environment overrides the file.
        for (key, env_key) in ENV_KEYS {
            if let Ok(v) = env::var(env_key) {
                overrides.insert(key.to_string(), v);
            }
        }

        // CLI overrides everything.
        for arg in args {
            if let Some(rest) = arg.strip_prefix("--config.") {
                if let Some((k, v)) = rest.split_once('=') {
                    if k != "file" {
                        overrides.insert(k.to_string(), v.to_string());
                    }
                }
            }
        }

        Ok(Self::from_overrides(&overrides))
    }

    /// Simple environment-only load, for callers that don't need CLI/file
    /// layering (the common case for embedding).
    pub fn from_env() -> AppResult<Self> {
        Self::load(&[])
    }

    fn from_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut cfg = Config::default();

        macro_rules! apply {
            ($key:expr, $target:expr, $parse:expr) => {
                if let Some(raw) = overrides.get($key) {
                    match $parse(raw.as_str()) {
                        Some(v) => $target = v,
                        None => tracing::warn!(
                            "invalid value for {}: {:?}, using default",
                            $key,
                            raw
                        ),
                    }
                }
            };
        }

        apply!("tracker.port", cfg.tracker.port, |s: &str| s.parse().ok());
        apply!(
            "tracker.threadpool.size",
            cfg.tracker.threadpool_size,
            |s: &str| s.parse().ok()
        );
        apply!(
            "tracker.peer.timeout.ms",
            cfg.tracker.peer_timeout_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "discovery.distributed.enabled",
            cfg.discovery.distributed_enabled,
            |s: &str| s.parse().ok()
        );
        apply!(
            "discovery.gossip.port",
            cfg.discovery.gossip_port,
            |s: &str| s.parse().ok()
        );
        apply!(
            "discovery.gossip.interval.ms",
            cfg.discovery.gossip_interval_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "discovery.gossip.fanout",
            cfg.discovery.gossip_fanout,
            |s: &str| s.parse().ok()
        );
        apply!(
            "discovery.gossip.message.ttl.ms",
            cfg.discovery.gossip_message_ttl_ms,
            |s: &str| s.parse().ok()
        );
        if let Some(raw) = overrides.get("discovery.gossip.bootstrap.peers") {
            cfg.discovery.bootstrap_peers = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        apply!(
            "cache.default.ttl.ms",
            cfg.cache.default_ttl_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "cache.default.refresh.ms",
            cfg.cache.default_refresh_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "cache.sweeper.interval.ms",
            cfg.cache.sweeper_interval_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "pool.max.connections",
            cfg.pool.max_connections,
            |s: &str| s.parse().ok()
        );
        apply!(
            "pool.connection.timeout.ms",
            cfg.pool.connection_timeout_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "healthcheck.enabled",
            cfg.healthcheck.enabled,
            |s: &str| s.parse().ok()
        );
        apply!(
            "healthcheck.interval.ms",
            cfg.healthcheck.interval_ms,
            |s: &str| s.parse().ok()
        );
        apply!(
            "healthcheck.port",
            cfg.healthcheck.port,
            |s: &str| s.parse().ok()
        );
        if let Some(raw) = overrides.get("log.level") {
            cfg.log_level = raw.clone();
        }
        apply!("metrics.enabled", cfg.metrics_enabled, |s: &str| s.parse().ok());

        cfg
    }
}

const ENV_KEYS: &[(&str, &str)] = &[
    ("tracker.port", "TRACKER_PORT"),
    ("tracker.threadpool.size", "TRACKER_THREADPOOL_SIZE"),
    ("tracker.peer.timeout.ms", "TRACKER_PEER_TIMEOUT_MS"),
    ("discovery.distributed.enabled", "DISCOVERY_DISTRIBUTED_ENABLED"),
    ("discovery.gossip.port", "DISCOVERY_GOSSIP_PORT"),
    ("discovery.gossip.interval.ms", "DISCOVERY_GOSSIP_INTERVAL_MS"),
    ("discovery.gossip.fanout", "DISCOVERY_GOSSIP_FANOUT"),
    ("discovery.gossip.message.ttl.ms", "DISCOVERY_GOSSIP_MESSAGE_TTL_MS"),
    ("discovery.gossip.bootstrap.peers", "DISCOVERY_GOSSIP_BOOTSTRAP_PEERS"),
    ("cache.default.ttl.ms", "CACHE_DEFAULT_TTL_MS"),
    ("cache.default.refresh.ms", "CACHE_DEFAULT_REFRESH_MS"),
    ("cache.sweeper.interval.ms", "CACHE_SWEEPER_INTERVAL_MS"),
    ("pool.max.connections", "POOL_MAX_CONNECTIONS"),
    ("pool.connection.timeout.ms", "POOL_CONNECTION_TIMEOUT_MS"),
    ("healthcheck.enabled", "HEALTHCHECK_ENABLED"),
    ("healthcheck.interval.ms", "HEALTHCHECK_INTERVAL_MS"),
    ("healthcheck.port", "HEALTHCHECK_PORT"),
    ("log.level", "LOG_LEVEL"),
    ("metrics.enabled", "METRICS_ENABLED"),
];

fn find_cli_value(args: &[String], key: &str) -> Option<String> {
    let prefix = format!("--{}=", key);
    args.iter()
        .find_map(|a| a.strip_prefix(prefix.as_str()).map(|v| v.to_string()))
}

fn parse_properties(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
