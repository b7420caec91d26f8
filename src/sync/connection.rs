//! Per-connection state.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::auth::Principal;
use super::message::ServerMessage;
use super::SyncError;

/// Identifies one transport connection for the lifetime of the process.
pub type ConnectionId = Uuid;

/// The connection lifecycle. Transitions:
/// `Unauthenticated` to `Authenticated` on successful auth (failure
/// closes), `Authenticated` to `Subscribed` on the first subscription,
/// back to `Authenticated` when the last subscription is dropped, and
/// `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Subscribed,
    Closed,
}

impl ConnectionState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, ConnectionState::Authenticated | ConnectionState::Subscribed)
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// The coordinator's handle on one connection: its state, who it
/// authenticated as, and the bounded outbound queue the transport drains.
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub principal: Option<Principal>,
    outbound: mpsc::Sender<ServerMessage>,
    pub last_seen: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Unauthenticated,
            principal: None,
            outbound,
            last_seen: Utc::now(),
        }
    }

    /// Best-effort, non-blocking send. A full queue or a gone receiver is
    /// an error; the caller is expected to drop the subscriber, which
    /// reconciles via catch-up when it reconnects.
    pub fn send(&self, message: ServerMessage) -> Result<(), SyncError> {
        self.outbound
            .try_send(message)
            .map_err(|_| SyncError::TransportSend(self.id))
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Seconds since this connection last produced a frame.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_seconds()
    }
}
