//! The replicated-document core.
//!
//! Everything in this module is pure in-memory data manipulation: no I/O,
//! no suspension points. A document is a map of field paths to LWW
//! registers plus a vector clock recording the highest logical time
//! observed from each replica. Conflict resolution is field-granular
//! last-writer-wins over totally ordered `(clock, replica)` stamps, so
//! merging is commutative, associative, and idempotent regardless of
//! delivery order or duplication.

mod clock;
mod delta;
mod document;
mod register;
mod value;

pub use clock::{ClockOrdering, ReplicaId, Stamp, VectorClock};
pub use delta::{Change, Delta};
pub use document::{Document, DocumentId, DocumentSnapshot, FieldPath, FieldState};
pub use register::{AssignOutcome, Register};
pub use value::Value;

use thiserror::Error;

/// Faults raised by the document core.
///
/// A `StampCollision` means two writes carried the same stamp but
/// different values, which the stamping rules make impossible unless a
/// replica identifier was reused or a clock was rolled back. The affected
/// document refuses further mutation once this is observed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvergentError {
    #[error("field {path:?}: conflicting values at equal stamp {stamp:?}")]
    StampCollision { path: FieldPath, stamp: Stamp },

    #[error("document {0:?} refuses mutation after a stamp collision")]
    DocumentPoisoned(DocumentId),

    #[error("field {path:?} carries a stamp the document clock has not observed")]
    UnobservedStamp { path: FieldPath },
}
