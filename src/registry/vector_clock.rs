use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A vector clock: a per-node counter used to determine causal order
/// between versions of the same service identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    counters: HashMap<String, u64>,
}

/// Result of comparing two vector clocks. Total in the four-valued sense:
/// every pair of clocks resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn get(&self, node: &str) -> u64 {
        *self.counters.get(node).unwrap_or(&0)
    }

    /// Bump this node's own counter. Used when a local registry authors a
    /// new version of a service instance.
    pub fn increment_for(&mut self, node: &str) {
        *self.counters.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Per-node maximum of the two clocks. The result dominates both
    /// operands: `merge_with` is commutative and idempotent.
    pub fn merge_with(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.counters.clone();
        for (node, count) in &other.counters {
            let entry = merged.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        VectorClock { counters: merged }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let mut nodes: std::collections::HashSet<&str> =
            self.counters.keys().map(String::as_str).collect();
        nodes.extend(other.counters.keys().map(String::as_str));

        for node in nodes {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clocks_are_equal() {
        let a = VectorClock::new();
        let b = VectorClock::new();
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
    }

    #[test]
    fn increment_makes_self_after() {
        let mut a = VectorClock::new();
        let b = a.clone();
        a.increment_for("n1");
        assert_eq!(a.compare(&b), ClockOrdering::After);
        assert_eq!(b.compare(&a), ClockOrdering::Before);
    }

    #[test]
    fn divergent_increments_are_concurrent() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.increment_for("n1");
        b.increment_for("n2");
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn merge_dominates_both_operands() {
        let mut a = VectorClock::new();
        a.increment_for("n1");
        let mut b = VectorClock::new();
        b.increment_for("n2");
        b.increment_for("n2");

        let merged = a.merge_with(&b);
        assert!(a.happens_before(&merged) || a.compare(&merged) == ClockOrdering::Equal);
        assert!(b.happens_before(&merged) || b.compare(&merged) == ClockOrdering::Equal);
        assert_ne!(merged.compare(&a), ClockOrdering::Before);
        assert_ne!(merged.compare(&b), ClockOrdering::Before);
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let mut a = VectorClock::new();
        a.increment_for("n1");
        let mut b = VectorClock::new();
        b.increment_for("n2");

        let ab = a.merge_with(&b);
        let ba = b.merge_with(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.merge_with(&ab), ab);
    }
}
