use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::vector_clock::VectorClock;

/// Identity of a service instance: unique within its service type.
pub type Identity = (String, String);

/// Immutable snapshot of a single service registration. Multiple versions
/// of the same identity may coexist in transit; the conflict resolver
/// converges every node to one winning version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_type: String,
    pub service_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub origin_node_id: String,
    pub version: VectorClock,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub tombstone: bool,
}

impl ServiceInstance {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        metadata: Option<HashMap<String, String>>,
        origin_node_id: impl Into<String>,
        version: VectorClock,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            host: host.into(),
            port,
            metadata: metadata.unwrap_or_default(),
            origin_node_id: origin_node_id.into(),
            version,
            timestamp_ms,
            tombstone: false,
        }
    }

    pub fn identity(&self) -> Identity {
        (self.service_type.clone(), self.service_id.clone())
    }

    /// The same value, marked for deregistration, with a bumped version.
    pub fn as_tombstone(&self, origin_node_id: &str, timestamp_ms: i64) -> Self {
        let mut version = self.version.clone();
        version.increment_for(origin_node_id);
        Self {
            tombstone: true,
            version,
            origin_node_id: origin_node_id.to_string(),
            timestamp_ms,
            ..self.clone()
        }
    }

    /// Equality of the *value* carried by a live instance, ignoring version
    /// and timestamp — used to detect a no-op re-registration.
    pub fn same_value_as(&self, other: &ServiceInstance) -> bool {
        self.service_type == other.service_type
            && self.service_id == other.service_id
            && self.host == other.host
            && self.port == other.port
            && self.metadata == other.metadata
            && self.tombstone == other.tombstone
    }
}

impl PartialEq for ServiceInstance {
    /// Identity-only equality, per the data model: `(serviceType, serviceId)`
    /// is the identity; version comparison is a separate concern handled by
    /// the vector clock and conflict resolver.
    fn eq(&self, other: &Self) -> bool {
        self.service_type == other.service_type && self.service_id == other.service_id
    }
}

impl Eq for ServiceInstance {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_defaults_empty_metadata() {
        let inst = ServiceInstance::new(
            "tracker", "t1", "localhost", 6000, None, "node-a", VectorClock::new(), 0,
        );
        assert!(inst.metadata.is_empty());
        assert!(!inst.tombstone);
    }

    #[test]
    fn equality_is_identity_only() {
        let mut clock_a = VectorClock::new();
        clock_a.increment_for("node-a");
        let a = ServiceInstance::new(
            "tracker", "t1", "host1", 1, None, "node-a", clock_a, 10,
        );
        let mut clock_b = VectorClock::new();
        clock_b.increment_for("node-b");
        let b = ServiceInstance::new(
            "tracker", "t1", "host2", 2, None, "node-b", clock_b, 20,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn tombstone_bumps_version_and_sets_flag() {
        let inst = ServiceInstance::new(
            "peer", "p1", "h", 1, None, "node-a", VectorClock::new(), 0,
        );
        let dead = inst.as_tombstone("node-a", 5);
        assert!(dead.tombstone);
        assert_eq!(dead.version.get("node-a"), 1);
    }
}
