use super::instance::ServiceInstance;
use super::vector_clock::ClockOrdering;

/// Deterministically merges two versions of the same service identity into
/// one winner. Must be commutative, associative, and idempotent so that
/// gossip converges regardless of topology or arrival order.
pub fn resolve(a: &ServiceInstance, b: &ServiceInstance) -> ServiceInstance {
    debug_assert_eq!(a.identity(), b.identity(), "resolve requires equal identity");

    let winner = match a.version.compare(&b.version) {
        ClockOrdering::Before => b,
        ClockOrdering::After => a,
        ClockOrdering::Equal => {
            // Same causal version: if the values genuinely agree this is a
            // no-op; if they don't (same clock, different payload — a bug
            // upstream, or two independent first registrations that both
            // happened to start from an empty clock) treat it as concurrent
            // so the tiebreak rules below still produce a deterministic
            // winner rather than picking arbitrarily.
            if values_match(a, b) {
                a
            } else {
                break_tie(a, b)
            }
        }
        ClockOrdering::Concurrent => break_tie(a, b),
    };

    let mut merged = winner.clone();
    merged.version = a.version.merge_with(&b.version);
    merged
}

fn values_match(a: &ServiceInstance, b: &ServiceInstance) -> bool {
    a.host == b.host
        && a.port == b.port
        && a.metadata == b.metadata
        && a.tombstone == b.tombstone
        && a.timestamp_ms == b.timestamp_ms
        && a.origin_node_id == b.origin_node_id
}

/// Tombstone beats live; else higher timestamp; else lexicographically
/// greater origin node id.
fn break_tie<'a>(a: &'a ServiceInstance, b: &'a ServiceInstance) -> &'a ServiceInstance {
    if a.tombstone != b.tombstone {
        return if a.tombstone { a } else { b };
    }
    if a.timestamp_ms != b.timestamp_ms {
        return if a.timestamp_ms > b.timestamp_ms { a } else { b };
    }
    if a.origin_node_id > b.origin_node_id {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::vector_clock::VectorClock;
    use std::collections::HashMap;

    fn inst(origin: &str, ts: i64, tombstone: bool, clock: VectorClock) -> ServiceInstance {
        ServiceInstance {
            service_type: "test-service".to_string(),
            service_id: "svc".to_string(),
            host: format!("host-{}", origin),
            port: 9000,
            metadata: HashMap::new(),
            origin_node_id: origin.to_string(),
            version: clock,
            timestamp_ms: ts,
            tombstone,
        }
    }

    #[test]
    fn happens_before_picks_later_version() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let a = inst("a", 1, false, ca.clone());

        let mut cb = ca.clone();
        cb.increment_for("a");
        let b = inst("a", 2, false, cb);

        let winner = resolve(&a, &b);
        assert_eq!(winner.host, b.host);
    }

    #[test]
    fn concurrent_tombstone_wins_over_live() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let live = inst("a", 100, false, ca);

        let mut cb = VectorClock::new();
        cb.increment_for("b");
        let dead = inst("b", 1, true, cb);

        assert!(resolve(&live, &dead).tombstone);
        assert!(resolve(&dead, &live).tombstone);
    }

    #[test]
    fn concurrent_equal_tombstone_higher_timestamp_wins() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let older = inst("a", 10, false, ca);

        let mut cb = VectorClock::new();
        cb.increment_for("b");
        let newer = inst("b", 20, false, cb);

        assert_eq!(resolve(&older, &newer).origin_node_id, "b");
        assert_eq!(resolve(&newer, &older).origin_node_id, "b");
    }

    #[test]
    fn concurrent_equal_timestamp_lexicographic_origin_wins() {
        let mut ca = VectorClock::new();
        ca.increment_for("node-a");
        let a = inst("node-a", 100, false, ca);

        let mut cb = VectorClock::new();
        cb.increment_for("node-b");
        let b = inst("node-b", 100, false, cb);

        assert_eq!(resolve(&a, &b).origin_node_id, "node-b");
        assert_eq!(resolve(&b, &a).origin_node_id, "node-b");
    }

    #[test]
    fn resolve_is_commutative() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let a = inst("a", 5, false, ca);
        let mut cb = VectorClock::new();
        cb.increment_for("b");
        let b = inst("b", 7, false, cb);

        let ab = resolve(&a, &b);
        let ba = resolve(&b, &a);
        assert_eq!(ab.origin_node_id, ba.origin_node_id);
        assert_eq!(ab.version, ba.version);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let a = inst("a", 5, false, ca);
        let once = resolve(&a, &a);
        let twice = resolve(&once, &once);
        assert_eq!(once.origin_node_id, twice.origin_node_id);
        assert_eq!(once.version, twice.version);
    }

    #[test]
    fn resolve_is_associative() {
        let mut ca = VectorClock::new();
        ca.increment_for("a");
        let a = inst("a", 5, false, ca);
        let mut cb = VectorClock::new();
        cb.increment_for("b");
        let b = inst("b", 7, false, cb);
        let mut cc = VectorClock::new();
        cc.increment_for("c");
        let c = inst("c", 7, true, cc);

        let left = resolve(&resolve(&a, &b), &c);
        let right = resolve(&a, &resolve(&b, &c));
        assert_eq!(left.origin_node_id, right.origin_node_id);
        assert_eq!(left.tombstone, right.tombstone);
        assert_eq!(left.version, right.version);
    }
}
