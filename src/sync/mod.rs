//! Server-side synchronization.
//!
//! The coordinator owns the authoritative copy of each document, applies
//! deltas from subscribed connections, persists snapshots write-behind,
//! and fans every applied delta out to the other subscribers and to peer
//! server instances over the fan-out adapter. Per-document work happens
//! under that document's lock only; sends and persistence happen after
//! the lock is released.

mod auth;
mod connection;
mod coordinator;
mod fanout;
mod message;

pub use auth::{AllowAll, Authenticator, Principal, StaticTokenAuthenticator};
pub use connection::{ConnectionId, ConnectionState};
pub use coordinator::{CoordinatorConfig, SyncCoordinator};
pub use fanout::{document_channel, FanoutAdapter, FanoutHandler, LocalFanout, BROADCAST_CHANNEL};
pub use message::{codes, ClientMessage, FanoutFrame, ServerMessage};

use thiserror::Error;

use crate::convergent::ConvergentError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("transport send to {0} failed")]
    TransportSend(ConnectionId),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Convergent(#[from] ConvergentError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
