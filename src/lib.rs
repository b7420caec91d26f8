//! Estuary: a local-first document synchronization engine.
//!
//! Replicas mutate their documents offline; when they exchange state the
//! engine guarantees strong eventual consistency. Every field is a
//! last-writer-wins register ordered by `(lamport clock, replica id)`
//! stamps, every document carries a vector clock of what it has observed,
//! and replicas reconcile by exchanging commutative, idempotent deltas.
//!
//! The crate is split into three subsystems:
//!
//! - [`convergent`]: the in-memory core (stamps, vector clocks, registers,
//!   documents, deltas). Pure and non-suspending.
//! - [`storage`]: the persistence boundary (snapshot stores).
//! - [`sync`]: the server-side coordinator that owns documents, tracks
//!   subscribers, and fans deltas out to them and to peer servers.

pub mod convergent;
pub mod storage;
pub mod sync;

pub use convergent::{
    Change, ClockOrdering, ConvergentError, Delta, Document, DocumentId, DocumentSnapshot,
    FieldPath, FieldState, Register, ReplicaId, Stamp, Value, VectorClock,
};
pub use storage::{LocalFileStore, MemoryStore, SnapshotStore, StorageError};
pub use sync::{
    Authenticator, ClientMessage, ConnectionId, ConnectionState, CoordinatorConfig,
    FanoutAdapter, LocalFanout, Principal, ServerMessage, SyncCoordinator, SyncError,
};
