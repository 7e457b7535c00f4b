pub mod health;
pub mod tracker;

pub use health::{router as health_router, HealthState};
pub use tracker::TrackerServer;
