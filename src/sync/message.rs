//! Frames exchanged with clients and between server instances.
//!
//! The transport layer (socket framing, reconnection) is external; the
//! coordinator consumes and produces these tagged unions. Payloads are
//! CBOR on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::convergent::{Change, Delta, DocumentId, VectorClock};

use super::SyncError;

/// Error codes carried by [`ServerMessage::Error`].
pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const INVARIANT_VIOLATION: &str = "invariant_violation";
}

/// Messages a connection sends to the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present credentials. Validation is external to the coordinator.
    Auth { token: String },
    /// Register interest in a document. `known_clock` triggers catch-up
    /// for a reconnecting client.
    Subscribe {
        document_id: DocumentId,
        known_clock: Option<VectorClock>,
    },
    /// A batch of field changes plus the sender's clock.
    Delta {
        document_id: DocumentId,
        changes: Vec<Change>,
        vector_clock: VectorClock,
    },
    Unsubscribe { document_id: DocumentId },
    Ping,
    Pong,
}

/// Messages the coordinator sends to a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted; `snapshot` is the catch-up delta for the
    /// client's known clock.
    SubscribeAck {
        document_id: DocumentId,
        snapshot: Delta,
    },
    /// A delta applied on the server, relayed to the other subscribers.
    DeltaEcho {
        document_id: DocumentId,
        changes: Vec<Change>,
        vector_clock: VectorClock,
    },
    Error { code: String, detail: String },
    Pong,
}

impl ServerMessage {
    pub fn error(code: &str, detail: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            detail: detail.into(),
        }
    }
}

/// The frame published to the fan-out channel for every applied delta.
/// Carries the origin server so instances can ignore their own frames;
/// delivery is at-least-once and unordered, which the delta semantics
/// tolerate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanoutFrame {
    pub server: Uuid,
    pub delta: Delta,
    pub vector_clock: VectorClock,
}

/// Serialize a frame to CBOR bytes.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SyncError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a frame from CBOR bytes.
pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, SyncError> {
    ciborium::from_reader(data).map_err(|e| SyncError::Encoding(e.to_string()))
}

impl ClientMessage {
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        to_cbor(self)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        from_cbor(data)
    }
}

impl ServerMessage {
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        to_cbor(self)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        from_cbor(data)
    }
}

impl FanoutFrame {
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        to_cbor(self)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        from_cbor(data)
    }
}
