//! Cross-server fan-out.
//!
//! Multiple server instances share applied deltas through a
//! publish/subscribe channel. Delivery is at-least-once with no ordering
//! guarantee; the delta semantics make both harmless. Channels are
//! addressed as `doc:{document_id}`, plus one global broadcast channel.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::SyncError;

/// The global channel, for payloads addressed to every instance.
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// The per-document channel name.
pub fn document_channel(document_id: &str) -> String {
    format!("doc:{document_id}")
}

/// Callback invoked with each payload published to a subscribed channel.
pub type FanoutHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Publish/subscribe transport between server instances. Implementations
/// wrap whatever broker the deployment uses; payloads are opaque bytes.
#[async_trait]
pub trait FanoutAdapter: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SyncError>;

    /// Register a handler for a channel. Returns a subscription id
    /// usable with `unsubscribe`.
    async fn subscribe(&self, channel: &str, handler: FanoutHandler) -> Result<Uuid, SyncError>;

    async fn unsubscribe(&self, channel: &str, subscription: Uuid) -> Result<(), SyncError>;
}

/// In-process fan-out for single-process deployments and tests: handlers
/// are invoked synchronously on publish, including the publisher's own.
#[derive(Default)]
pub struct LocalFanout {
    channels: RwLock<HashMap<String, HashMap<Uuid, FanoutHandler>>>,
}

impl LocalFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FanoutAdapter for LocalFanout {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), SyncError> {
        let channels = self.channels.read().await;
        if let Some(handlers) = channels.get(channel) {
            for handler in handlers.values() {
                handler(payload);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: FanoutHandler) -> Result<Uuid, SyncError> {
        let id = Uuid::new_v4();
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(id, handler);
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, subscription: Uuid) -> Result<(), SyncError> {
        if let Some(handlers) = self.channels.write().await.get_mut(channel) {
            handlers.remove(&subscription);
        }
        Ok(())
    }
}
