//! One last-writer-wins cell.

use serde::{Deserialize, Serialize};

use super::clock::{ReplicaId, Stamp};
use super::value::Value;

/// What happened when a write was offered to a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The incoming write carried the higher stamp and overwrote the cell.
    Applied,
    /// The incoming write was older (or an exact duplicate) and was dropped.
    Ignored,
    /// Equal stamps but different values: stamp misuse, the document must
    /// refuse further mutation.
    Collision,
}

/// A single LWW register: the winning value, the stamp that wrote it, and
/// the replica that produced that write.
///
/// `value: None` is the tombstone left by a deletion. Tombstones carry
/// stamps and follow the same LWW rule, so a delete can itself be
/// overwritten by a later write. They are retained forever; removing them
/// would let an out-of-order remote write resurrect deleted state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    value: Option<Value>,
    stamp: Stamp,
    /// Redundant with `stamp.replica`; retained for audit.
    origin: ReplicaId,
}

impl Register {
    pub fn new(value: Option<Value>, stamp: Stamp, origin: ReplicaId) -> Self {
        Self {
            value,
            stamp,
            origin,
        }
    }

    /// Offer a write to this register.
    ///
    /// Keeps whichever of the current and incoming triples carries the
    /// higher stamp. Equal stamps with equal values are an idempotent
    /// redelivery; equal stamps with different values are reported as a
    /// collision and leave the register untouched.
    pub fn assign(
        &mut self,
        value: Option<Value>,
        stamp: Stamp,
        origin: ReplicaId,
    ) -> AssignOutcome {
        match stamp.cmp(&self.stamp) {
            std::cmp::Ordering::Greater => {
                self.value = value;
                self.stamp = stamp;
                self.origin = origin;
                AssignOutcome::Applied
            }
            std::cmp::Ordering::Less => AssignOutcome::Ignored,
            std::cmp::Ordering::Equal => {
                if self.value == value {
                    AssignOutcome::Ignored
                } else {
                    AssignOutcome::Collision
                }
            }
        }
    }

    /// The visible value; tombstones read as `None`.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn origin(&self) -> &ReplicaId {
        &self.origin
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(value: &str, clock: u64, replica: &str) -> Register {
        Register::new(
            Some(Value::text(value)),
            Stamp::new(clock, replica),
            replica.to_string(),
        )
    }

    #[test]
    fn test_higher_stamp_wins() {
        let mut r = reg("old", 1, "a");
        let outcome = r.assign(Some(Value::text("new")), Stamp::new(2, "a"), "a".into());
        assert_eq!(outcome, AssignOutcome::Applied);
        assert_eq!(r.value(), Some(&Value::text("new")));
    }

    #[test]
    fn test_lower_stamp_is_dropped() {
        let mut r = reg("kept", 5, "a");
        let outcome = r.assign(Some(Value::text("stale")), Stamp::new(3, "z"), "z".into());
        assert_eq!(outcome, AssignOutcome::Ignored);
        assert_eq!(r.value(), Some(&Value::text("kept")));
        assert_eq!(r.origin(), "a");
    }

    #[test]
    fn test_equal_clock_breaks_tie_on_replica() {
        let mut r = reg("from-a", 4, "a");
        let outcome = r.assign(Some(Value::text("from-b")), Stamp::new(4, "b"), "b".into());
        assert_eq!(outcome, AssignOutcome::Applied);
        assert_eq!(r.value(), Some(&Value::text("from-b")));
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut r = reg("v", 2, "a");
        let outcome = r.assign(Some(Value::text("v")), Stamp::new(2, "a"), "a".into());
        assert_eq!(outcome, AssignOutcome::Ignored);
    }

    #[test]
    fn test_equal_stamp_different_value_collides() {
        let mut r = reg("v", 2, "a");
        let outcome = r.assign(Some(Value::text("w")), Stamp::new(2, "a"), "a".into());
        assert_eq!(outcome, AssignOutcome::Collision);
        // Register unchanged
        assert_eq!(r.value(), Some(&Value::text("v")));
    }

    #[test]
    fn test_tombstone_follows_lww() {
        let mut r = reg("v", 1, "a");
        assert_eq!(
            r.assign(None, Stamp::new(2, "a"), "a".into()),
            AssignOutcome::Applied
        );
        assert!(r.is_tombstone());
        assert_eq!(r.value(), None);

        // A later write overwrites the tombstone.
        assert_eq!(
            r.assign(Some(Value::text("back")), Stamp::new(3, "b"), "b".into()),
            AssignOutcome::Applied
        );
        assert!(!r.is_tombstone());
    }

    #[test]
    fn test_tombstone_is_distinct_from_null_value() {
        let mut r = reg("v", 1, "a");
        r.assign(Some(Value::Null), Stamp::new(2, "a"), "a".into());
        assert!(!r.is_tombstone());
        assert_eq!(r.value(), Some(&Value::Null));
    }

    #[test]
    fn test_serialized_tombstone_round_trips() {
        let tomb = Register::new(None, Stamp::new(3, "a"), "a".into());
        let json = serde_json::to_string(&tomb).unwrap();
        let restored: Register = serde_json::from_str(&json).unwrap();
        assert_eq!(tomb, restored);
        assert!(restored.is_tombstone());

        let null = Register::new(Some(Value::Null), Stamp::new(3, "a"), "a".into());
        let restored: Register = serde_json::from_str(&serde_json::to_string(&null).unwrap()).unwrap();
        assert!(!restored.is_tombstone());
    }
}
