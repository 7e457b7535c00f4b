//! Distributed service registry for a peer-to-peer file-sharing mesh:
//! vector-clock versioning, gossip propagation, conflict resolution,
//! a TTL/refresh cache, a bounded connection pool, and retry/circuit
//! breaker resilience primitives.

pub mod cache;
pub mod config;
pub mod error;
pub mod net;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, AppResult};
