//! Logical time: write stamps and vector clocks.
//!
//! A `Stamp` totally orders every write in the system; a `VectorClock`
//! records, per replica, the highest stamp clock a document has observed.
//! Wall-clock time plays no part in either.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a replica. Opaque, non-empty, ordered
/// lexicographically for stamp tie-breaking.
pub type ReplicaId = String;

/// The total ordering key for conflict resolution.
///
/// Stamps compare by clock first, then by replica id, so two writes never
/// compare equal unless they are the same write. The derived `Ord` gives
/// exactly that order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(clock: u64, replica: impl Into<ReplicaId>) -> Self {
        Self {
            clock,
            replica: replica.into(),
        }
    }
}

/// Result of comparing two vector clocks under the causal partial order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrdering {
    Less,
    Equal,
    Greater,
    Concurrent,
}

/// Per-replica frontier of observed logical time.
///
/// Maps each known replica to the highest clock value seen from it.
/// Unknown replicas implicitly read as 0, and zero entries are never
/// stored, so the serialized form elides them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    seen: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// An empty clock: has observed nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock observed from `replica` (0 if never seen).
    pub fn get(&self, replica: &str) -> u64 {
        self.seen.get(replica).copied().unwrap_or(0)
    }

    /// Advance `replica`'s coordinate past every coordinate in the clock
    /// and return the new value.
    ///
    /// This is the Lamport step backing local writes: the fresh value
    /// exceeds everything this clock has observed from anyone, so a write
    /// that causally follows an observed write always carries the higher
    /// stamp.
    pub fn tick(&mut self, replica: &str) -> u64 {
        let next = self.latest() + 1;
        self.seen.insert(replica.to_string(), next);
        next
    }

    /// Record having observed clock value `value` from `replica`.
    /// Coordinates never move backwards.
    pub fn observe(&mut self, replica: &str, value: u64) {
        if value == 0 {
            return;
        }
        let current = self.seen.entry(replica.to_string()).or_insert(0);
        if value > *current {
            *current = value;
        }
    }

    /// Fold another clock into this one, taking the per-replica max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, value) in &other.seen {
            self.observe(replica, *value);
        }
    }

    /// Compare under the causal partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut ahead = false;
        let mut behind = false;
        for (replica, value) in &self.seen {
            match value.cmp(&other.get(replica)) {
                std::cmp::Ordering::Greater => ahead = true,
                std::cmp::Ordering::Less => behind = true,
                std::cmp::Ordering::Equal => {}
            }
        }
        for (replica, value) in &other.seen {
            if self.get(replica) < *value {
                behind = true;
            }
        }
        match (ahead, behind) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Less,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// The highest coordinate anywhere in the clock.
    pub fn latest(&self) -> u64 {
        self.seen.values().copied().max().unwrap_or(0)
    }

    /// Iterate over the non-zero coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.seen.iter().map(|(r, v)| (r, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_get() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.get("a"), 0);

        clock.observe("a", 5);
        assert_eq!(clock.get("a"), 5);

        // Doesn't go backwards
        clock.observe("a", 3);
        assert_eq!(clock.get("a"), 5);

        clock.observe("a", 7);
        assert_eq!(clock.get("a"), 7);
    }

    #[test]
    fn test_zero_observations_are_elided() {
        let mut clock = VectorClock::new();
        clock.observe("a", 0);
        assert!(clock.is_empty());
        assert_eq!(clock.get("a"), 0);
    }

    #[test]
    fn test_tick_exceeds_everything_observed() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.tick("b"), 1);
        assert_eq!(clock.tick("b"), 2);

        clock.observe("a", 9);
        assert_eq!(clock.tick("b"), 10);
        assert_eq!(clock.get("b"), 10);
        assert_eq!(clock.get("a"), 9);
    }

    #[test]
    fn test_merge_takes_per_replica_max() {
        let mut left = VectorClock::new();
        left.observe("a", 5);
        left.observe("b", 1);

        let mut right = VectorClock::new();
        right.observe("a", 3);
        right.observe("c", 4);

        left.merge(&right);
        assert_eq!(left.get("a"), 5);
        assert_eq!(left.get("b"), 1);
        assert_eq!(left.get("c"), 4);
    }

    #[test]
    fn test_compare_all_outcomes() {
        let mut base = VectorClock::new();
        base.observe("a", 2);
        base.observe("b", 1);

        let equal = base.clone();
        assert_eq!(base.compare(&equal), ClockOrdering::Equal);

        let mut ahead = base.clone();
        ahead.observe("a", 3);
        assert_eq!(base.compare(&ahead), ClockOrdering::Less);
        assert_eq!(ahead.compare(&base), ClockOrdering::Greater);

        let mut sideways = base.clone();
        sideways.observe("c", 1);
        let mut other = base;
        other.observe("b", 2);
        assert_eq!(sideways.compare(&other), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_stamp_total_order() {
        // Clock dominates, replica breaks ties lexicographically.
        assert!(Stamp::new(2, "a") > Stamp::new(1, "z"));
        assert!(Stamp::new(1, "b") > Stamp::new(1, "a"));
        assert_eq!(Stamp::new(1, "a"), Stamp::new(1, "a"));
    }
}
