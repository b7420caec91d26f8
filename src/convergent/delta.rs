//! Delta extraction and application.
//!
//! A delta is the set of per-field changes that carries one document's
//! newer state to another. Application goes through the same LWW rule as
//! everything else, so deltas are idempotent and commute: the outcome is
//! always "the maximum stamp seen per path" no matter the order or how
//! often a delta is delivered.

use serde::{Deserialize, Serialize};

use super::clock::{ReplicaId, Stamp, VectorClock};
use super::document::{Document, DocumentId, FieldPath};
use super::register::Register;
use super::value::Value;
use super::ConvergentError;

/// One field-level change: the winning value (or tombstone), its stamp,
/// and the replica that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: FieldPath,
    /// `None` carries a tombstone.
    pub value: Option<Value>,
    pub stamp: Stamp,
    pub origin: ReplicaId,
}

impl Change {
    pub(crate) fn from_register(path: FieldPath, register: &Register) -> Self {
        Self {
            path,
            value: register.value().cloned(),
            stamp: register.stamp().clone(),
            origin: register.origin().clone(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A set of changes addressed to one document. Changes are kept in
/// insertion order by convention, but application is commutative in
/// change order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub document_id: DocumentId,
    pub changes: Vec<Change>,
}

impl Delta {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            changes: Vec::new(),
        }
    }

    /// The changes that, applied to `from`, reproduce `to`'s visible
    /// state: every field `from` lacks or holds at a strictly lower
    /// stamp. Fields only in `from` are not emitted; deletions appear as
    /// explicit tombstone changes in `to`.
    pub fn compute(from: &Document, to: &Document) -> Delta {
        let mut delta = Delta::new(to.id().clone());
        for (path, register) in to.fields() {
            let newer = match from.register(path) {
                None => true,
                Some(existing) => existing.stamp() < register.stamp(),
            };
            if newer {
                delta.changes.push(Change::from_register(path.clone(), register));
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

impl Document {
    /// Apply every change in a delta: LWW-assign each register, observing
    /// each stamp so the clock covers it. Returns how many changes won
    /// their register.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<usize, ConvergentError> {
        let mut applied = 0;
        for change in &delta.changes {
            if self.apply_change(change)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// The catch-up delta for a peer whose last known clock is `known`:
    /// every field whose stamp clock exceeds the peer's coordinate for
    /// the stamping replica. Used to reconcile reconnecting subscribers.
    pub fn changes_since(&self, known: &VectorClock) -> Delta {
        let mut delta = Delta::new(self.id().clone());
        for (path, register) in self.fields() {
            let stamp = register.stamp();
            if stamp.clock > known.get(&stamp.replica) {
                delta.changes.push(Change::from_register(path.clone(), register));
            }
        }
        delta
    }
}
