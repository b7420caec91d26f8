//! The core Document type.
//!
//! A Document composes many field registers with one vector clock and
//! owns the stamping of local writes. It can be merged with any other
//! replica's copy of the same document; replicas that have observed the
//! same set of writes hold byte-identical field maps afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::clock::{ReplicaId, Stamp, VectorClock};
use super::delta::Change;
use super::register::{AssignOutcome, Register};
use super::value::Value;
use super::ConvergentError;

/// Unique identifier for a document. Opaque to the core.
pub type DocumentId = String;

/// A field path. The core treats it as an opaque flat key; hierarchical
/// interpretation is the host's concern.
pub type FieldPath = String;

/// What a query sees at a path, distinguishing "never written" from
/// "deleted".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldState<'a> {
    /// No register exists at this path.
    Missing,
    /// A tombstone register exists: the field was written, then deleted.
    Deleted,
    Present(&'a Value),
}

/// The wire- and disk-stable form of a document: its identity, every
/// register (tombstones included), and the vector clock. The local
/// replica identity is process state and deliberately not part of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub fields: BTreeMap<FieldPath, Register>,
    pub clock: VectorClock,
}

/// A replicated document: a map of path to LWW register plus the vector
/// clock of everything this copy has observed.
///
/// Invariant, re-established after every operation: each register's stamp
/// clock is at most the document clock's coordinate for the stamping
/// replica.
#[derive(Clone, Debug)]
pub struct Document {
    id: DocumentId,
    replica: ReplicaId,
    fields: BTreeMap<FieldPath, Register>,
    clock: VectorClock,
    /// Set once a stamp collision is observed; all further mutation is
    /// refused.
    poisoned: bool,
}

impl Document {
    /// Create an empty document owned by `replica`.
    pub fn new(id: impl Into<DocumentId>, replica: impl Into<ReplicaId>) -> Self {
        Self {
            id: id.into(),
            replica: replica.into(),
            fields: BTreeMap::new(),
            clock: VectorClock::new(),
            poisoned: false,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Iterate all registers, tombstones included.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldPath, &Register)> {
        self.fields.iter()
    }

    /// The register at `path`, if one was ever written.
    pub fn register(&self, path: &str) -> Option<&Register> {
        self.fields.get(path)
    }

    /// The visible value at `path`. Tombstones and never-written paths
    /// both read as `None`; use [`Document::field_state`] to tell them
    /// apart.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.fields.get(path).and_then(|r| r.value())
    }

    pub fn field_state(&self, path: &str) -> FieldState<'_> {
        match self.fields.get(path) {
            None => FieldState::Missing,
            Some(r) => match r.value() {
                None => FieldState::Deleted,
                Some(v) => FieldState::Present(v),
            },
        }
    }

    /// Write `value` at `path` under a fresh stamp.
    ///
    /// Returns the change that was applied so the caller can forward it
    /// to other replicas. The fresh stamp exceeds every stamp this
    /// replica has observed, so a local write never loses to local state.
    pub fn set(&mut self, path: impl Into<FieldPath>, value: Value) -> Result<Change, ConvergentError> {
        self.write(path.into(), Some(value))
    }

    /// Delete the field at `path` by writing a tombstone under a fresh
    /// stamp. The register is retained, not removed.
    pub fn delete(&mut self, path: impl Into<FieldPath>) -> Result<Change, ConvergentError> {
        self.write(path.into(), None)
    }

    fn write(&mut self, path: FieldPath, value: Option<Value>) -> Result<Change, ConvergentError> {
        self.ensure_live()?;
        let stamp = self.next_stamp();
        let change = Change {
            path,
            value,
            stamp,
            origin: self.replica.clone(),
        };
        self.apply_change(&change)?;
        Ok(change)
    }

    /// Produce the next stamp for this replica: one past everything the
    /// document has observed from anyone, recorded in the clock.
    fn next_stamp(&mut self) -> Stamp {
        let clock = self.clock.tick(&self.replica);
        Stamp {
            clock,
            replica: self.replica.clone(),
        }
    }

    /// Offer a single change to this document: LWW-assign on the
    /// register at its path, then observe its stamp so the clock covers
    /// it. Returns whether the change overwrote the register.
    pub fn apply_change(&mut self, change: &Change) -> Result<bool, ConvergentError> {
        self.ensure_live()?;
        let outcome = match self.fields.get_mut(&change.path) {
            Some(register) => register.assign(
                change.value.clone(),
                change.stamp.clone(),
                change.origin.clone(),
            ),
            None => {
                self.fields.insert(
                    change.path.clone(),
                    Register::new(
                        change.value.clone(),
                        change.stamp.clone(),
                        change.origin.clone(),
                    ),
                );
                AssignOutcome::Applied
            }
        };

        if outcome == AssignOutcome::Collision {
            self.poisoned = true;
            log::error!(
                "document {}: conflicting values at stamp ({}, {}) on field {:?}; refusing further mutation",
                self.id,
                change.stamp.clock,
                change.stamp.replica,
                change.path
            );
            return Err(ConvergentError::StampCollision {
                path: change.path.clone(),
                stamp: change.stamp.clone(),
            });
        }

        self.clock.observe(&change.stamp.replica, change.stamp.clock);
        Ok(outcome == AssignOutcome::Applied)
    }

    /// Merge another replica's copy of this document: fold every remote
    /// register through the LWW rule, then merge the clocks.
    pub fn merge(&mut self, other: &Document) -> Result<(), ConvergentError> {
        self.ensure_live()?;
        for (path, register) in &other.fields {
            let change = Change::from_register(path.clone(), register);
            self.apply_change(&change)?;
        }
        self.clock.merge(&other.clock);
        Ok(())
    }

    /// Fold a bare vector clock into this document's clock. Used when a
    /// transport frame carries the sender's clock alongside its changes.
    pub fn merge_clock(&mut self, other: &VectorClock) {
        self.clock.merge(other);
    }

    /// Extract the persistence form.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id.clone(),
            fields: self.fields.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Rebuild a document from its persistence form, adopting `replica`
    /// as the local writer identity.
    pub fn from_snapshot(snapshot: DocumentSnapshot, replica: impl Into<ReplicaId>) -> Self {
        Self {
            id: snapshot.id,
            replica: replica.into(),
            fields: snapshot.fields,
            clock: snapshot.clock,
            poisoned: false,
        }
    }

    /// Check that every register's stamp is covered by the clock.
    pub fn validate_invariants(&self) -> Result<(), ConvergentError> {
        for (path, register) in &self.fields {
            let stamp = register.stamp();
            if stamp.clock > self.clock.get(&stamp.replica) {
                return Err(ConvergentError::UnobservedStamp { path: path.clone() });
            }
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), ConvergentError> {
        if self.poisoned {
            Err(ConvergentError::DocumentPoisoned(self.id.clone()))
        } else {
            Ok(())
        }
    }
}
