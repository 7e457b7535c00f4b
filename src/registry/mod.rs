pub mod gossip;
pub mod instance;
pub mod local;
pub mod resolver;
pub mod vector_clock;

pub use gossip::{GossipEngine, GossipMessage, GossipTransport, TcpGossipTransport};
pub use instance::{Identity, ServiceInstance};
pub use local::{ApplyOutcome, LocalRegistry};
pub use resolver::resolve;
pub use vector_clock::{ClockOrdering, VectorClock};
