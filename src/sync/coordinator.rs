//! The sync coordinator.
//!
//! Owns the authoritative in-memory copy of every active document, the
//! subscriber sets, and the connection table. Deltas are applied under
//! the per-document lock; persistence, local broadcast, and cross-server
//! fan-out all happen after the lock is released. Persistence is
//! write-behind: a failed put leaves the document dirty and the flush
//! loop retries until storage recovers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::convergent::{Change, Delta, Document, DocumentId, ReplicaId, VectorClock};
use crate::storage::SnapshotStore;

use super::auth::{Authenticator, Principal};
use super::connection::{ConnectionHandle, ConnectionId, ConnectionState};
use super::fanout::{document_channel, FanoutAdapter};
use super::message::{codes, ClientMessage, FanoutFrame, ServerMessage};
use super::SyncError;

/// Tunables for one coordinator instance.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Outbound queue capacity per connection. A subscriber that lets its
    /// queue fill up is dropped and reconciles via catch-up on reconnect.
    pub outbound_queue_capacity: usize,
    /// How often dirty documents are flushed to storage and stale
    /// connections reaped.
    pub flush_interval: Duration,
    /// Connections idle longer than this are dropped. Zero disables
    /// reaping.
    pub stale_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 64,
            flush_interval: Duration::from_secs(2),
            stale_timeout: Duration::from_secs(60),
        }
    }
}

/// Where a delta entered this instance.
enum DeltaSource {
    /// From a local subscriber; excluded from the local echo and the
    /// delta is republished to peer servers.
    Connection(ConnectionId),
    /// From the fan-out channel; echoed to local subscribers only.
    Fanout,
}

/// Server-side owner of documents and subscriptions.
///
/// Constructed as `Arc<Self>` because the background tasks spawned by
/// [`SyncCoordinator::start`] hold references.
pub struct SyncCoordinator {
    server_id: Uuid,
    replica: ReplicaId,
    config: CoordinatorConfig,
    store: Arc<dyn SnapshotStore>,
    auth: Arc<dyn Authenticator>,
    fanout: Option<Arc<dyn FanoutAdapter>>,
    documents: RwLock<HashMap<DocumentId, Arc<Mutex<Document>>>>,
    subscribers: RwLock<HashMap<DocumentId, HashSet<ConnectionId>>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    /// Documents with unpersisted state, awaiting (re)flush.
    dirty: Mutex<HashSet<DocumentId>>,
    /// Per-document fan-out channels this instance has subscribed to.
    fanout_channels: Mutex<HashSet<DocumentId>>,
    fanout_tx: mpsc::UnboundedSender<Vec<u8>>,
    fanout_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        auth: Arc<dyn Authenticator>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Self::build(store, auth, None, config)
    }

    /// A coordinator wired to a fan-out adapter shared with peer server
    /// instances.
    pub fn new_with_fanout(
        store: Arc<dyn SnapshotStore>,
        auth: Arc<dyn Authenticator>,
        fanout: Arc<dyn FanoutAdapter>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Self::build(store, auth, Some(fanout), config)
    }

    fn build(
        store: Arc<dyn SnapshotStore>,
        auth: Arc<dyn Authenticator>,
        fanout: Option<Arc<dyn FanoutAdapter>>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let server_id = Uuid::new_v4();
        let (fanout_tx, fanout_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            server_id,
            replica: server_id.to_string(),
            config,
            store,
            auth,
            fanout,
            documents: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            fanout_channels: Mutex::new(HashSet::new()),
            fanout_tx,
            fanout_rx: Mutex::new(Some(fanout_rx)),
            shutdown_tx,
        })
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Spawn the background tasks: the flush/reap loop and, when a
    /// fan-out adapter is attached, the intake loop for peer frames.
    pub async fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(coordinator.config.flush_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        coordinator.flush_dirty().await;
                        coordinator.reap_stale().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });

        if let Some(mut rx) = self.fanout_rx.lock().await.take() {
            let coordinator = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        payload = rx.recv() => match payload {
                            Some(payload) => coordinator.handle_fanout_payload(&payload).await,
                            None => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }
    }

    /// Stop the background tasks. In-flight work completes; nothing new
    /// is scheduled.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Admit a new transport connection. The transport keeps the
    /// receiving half and drains it to the wire; the returned id
    /// addresses the connection in every later call.
    pub async fn register_connection(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let handle = ConnectionHandle::new(tx);
        let id = handle.id;
        self.connections.write().await.insert(id, handle);
        (id, rx)
    }

    pub async fn connection_state(&self, conn_id: ConnectionId) -> Option<ConnectionState> {
        self.connections.read().await.get(&conn_id).map(|h| h.state)
    }

    /// Transport-level disconnect: drop the connection from every
    /// subscriber set and forget it.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        self.drop_connection(conn_id).await;
    }

    /// Decode and process one raw inbound frame. An unparseable frame
    /// gets a `bad_request` reply and mutates nothing.
    pub async fn handle_frame(
        &self,
        conn_id: ConnectionId,
        payload: &[u8],
    ) -> Result<(), SyncError> {
        match ClientMessage::from_cbor(payload) {
            Ok(message) => self.handle_message(conn_id, message).await,
            Err(err) => {
                log::debug!("malformed frame from {conn_id}: {err}");
                self.reply(
                    conn_id,
                    ServerMessage::error(codes::BAD_REQUEST, "unparseable frame"),
                )
                .await
            }
        }
    }

    /// Process one inbound frame, driving the connection state machine.
    /// Protocol violations produce an `Error` reply without mutating
    /// document or subscription state.
    pub async fn handle_message(
        &self,
        conn_id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), SyncError> {
        let state = {
            let mut connections = self.connections.write().await;
            let handle = connections
                .get_mut(&conn_id)
                .ok_or(SyncError::UnknownConnection(conn_id))?;
            handle.touch();
            handle.state
        };
        if state.is_closed() {
            log::debug!("dropping frame from closed connection {conn_id}");
            return Ok(());
        }

        match message {
            ClientMessage::Auth { token } => self.handle_auth(conn_id, state, &token).await,
            ClientMessage::Subscribe {
                document_id,
                known_clock,
            } => {
                self.handle_subscribe(conn_id, state, document_id, known_clock)
                    .await
            }
            ClientMessage::Delta {
                document_id,
                changes,
                vector_clock,
            } => {
                self.handle_delta(conn_id, state, document_id, changes, vector_clock)
                    .await
            }
            ClientMessage::Unsubscribe { document_id } => {
                self.handle_unsubscribe(conn_id, state, &document_id).await
            }
            ClientMessage::Ping => self.reply(conn_id, ServerMessage::Pong).await,
            ClientMessage::Pong => Ok(()),
        }
    }

    async fn handle_auth(
        &self,
        conn_id: ConnectionId,
        state: ConnectionState,
        token: &str,
    ) -> Result<(), SyncError> {
        if state != ConnectionState::Unauthenticated {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::BAD_REQUEST, "already authenticated"),
                )
                .await;
        }
        match self.auth.authenticate(token) {
            Some(principal) => {
                let mut connections = self.connections.write().await;
                if let Some(handle) = connections.get_mut(&conn_id) {
                    handle.state = ConnectionState::Authenticated;
                    handle.principal = Some(principal);
                }
                Ok(())
            }
            None => {
                let _ = self
                    .reply(
                        conn_id,
                        ServerMessage::error(codes::AUTH_FAILED, "invalid credentials"),
                    )
                    .await;
                let mut connections = self.connections.write().await;
                if let Some(handle) = connections.get_mut(&conn_id) {
                    handle.state = ConnectionState::Closed;
                }
                Ok(())
            }
        }
    }

    async fn handle_subscribe(
        &self,
        conn_id: ConnectionId,
        state: ConnectionState,
        document_id: DocumentId,
        known_clock: Option<VectorClock>,
    ) -> Result<(), SyncError> {
        if !state.is_authenticated() {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::BAD_REQUEST, "subscribe before auth"),
                )
                .await;
        }
        if !self
            .authorized(conn_id, &document_id, |auth, p, doc| auth.may_subscribe(p, doc))
            .await
        {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::PERMISSION_DENIED, "subscribe refused"),
                )
                .await;
        }

        let entry = self.load_document(&document_id).await?;

        self.subscribers
            .write()
            .await
            .entry(document_id.clone())
            .or_default()
            .insert(conn_id);
        {
            let mut connections = self.connections.write().await;
            if let Some(handle) = connections.get_mut(&conn_id) {
                handle.state = ConnectionState::Subscribed;
            }
        }

        let catch_up = {
            let doc = entry.lock().await;
            doc.changes_since(&known_clock.unwrap_or_default())
        };
        self.reply(
            conn_id,
            ServerMessage::SubscribeAck {
                document_id,
                snapshot: catch_up,
            },
        )
        .await
    }

    async fn handle_delta(
        &self,
        conn_id: ConnectionId,
        state: ConnectionState,
        document_id: DocumentId,
        changes: Vec<Change>,
        vector_clock: VectorClock,
    ) -> Result<(), SyncError> {
        if state != ConnectionState::Subscribed {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::BAD_REQUEST, "delta before subscribe"),
                )
                .await;
        }
        if !self
            .authorized(conn_id, &document_id, |auth, p, doc| auth.may_write(p, doc))
            .await
        {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::PERMISSION_DENIED, "write refused"),
                )
                .await;
        }

        let delta = Delta {
            document_id,
            changes,
        };
        match self
            .apply_and_distribute(delta, vector_clock, DeltaSource::Connection(conn_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(SyncError::Convergent(err)) => {
                log::error!("delta from {conn_id} rejected: {err}");
                self.reply(
                    conn_id,
                    ServerMessage::error(codes::INVARIANT_VIOLATION, err.to_string()),
                )
                .await
            }
            Err(other) => Err(other),
        }
    }

    async fn handle_unsubscribe(
        &self,
        conn_id: ConnectionId,
        state: ConnectionState,
        document_id: &str,
    ) -> Result<(), SyncError> {
        if state != ConnectionState::Subscribed {
            return self
                .reply(
                    conn_id,
                    ServerMessage::error(codes::BAD_REQUEST, "not subscribed"),
                )
                .await;
        }
        let remaining = {
            let mut subscribers = self.subscribers.write().await;
            if let Some(set) = subscribers.get_mut(document_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    subscribers.remove(document_id);
                }
            }
            subscribers.values().filter(|set| set.contains(&conn_id)).count()
        };
        if remaining == 0 {
            let mut connections = self.connections.write().await;
            if let Some(handle) = connections.get_mut(&conn_id) {
                handle.state = ConnectionState::Authenticated;
            }
        }
        Ok(())
    }

    /// Apply a delta received on behalf of a document, then distribute
    /// it: persist write-behind, echo to the other local subscribers,
    /// and (for locally received deltas) publish to peer servers.
    pub async fn handle_incoming_delta(
        &self,
        delta: Delta,
        sender_clock: VectorClock,
        from: Option<ConnectionId>,
    ) -> Result<(), SyncError> {
        let source = match from {
            Some(conn) => DeltaSource::Connection(conn),
            None => DeltaSource::Fanout,
        };
        self.apply_and_distribute(delta, sender_clock, source).await
    }

    /// The catch-up delta for a document given a client's last known
    /// clock.
    pub async fn snapshot_for(
        &self,
        document_id: &str,
        known_clock: &VectorClock,
    ) -> Result<Delta, SyncError> {
        let entry = self.load_document(document_id).await?;
        let doc = entry.lock().await;
        Ok(doc.changes_since(known_clock))
    }

    /// Flush every dirty document to storage. Failures are logged and
    /// the document stays dirty for the next pass.
    pub async fn flush_dirty(&self) {
        let pending: Vec<DocumentId> = self.dirty.lock().await.iter().cloned().collect();
        for document_id in pending {
            self.flush_document(&document_id).await;
        }
    }

    async fn apply_and_distribute(
        &self,
        delta: Delta,
        sender_clock: VectorClock,
        source: DeltaSource,
    ) -> Result<(), SyncError> {
        let entry = self.load_document(&delta.document_id).await?;

        // Apply under the document lock, release before any suspension.
        let (result, clock) = {
            let mut doc = entry.lock().await;
            let result = doc.apply_delta(&delta);
            if result.is_ok() {
                doc.merge_clock(&sender_clock);
            }
            (result, doc.clock().clone())
        };
        result?;

        self.dirty.lock().await.insert(delta.document_id.clone());
        // Clocks persist separately from snapshots; keep them fresh even
        // if the full flush below fails.
        if let Err(err) = self.store.clock_merge(&delta.document_id, &clock).await {
            log::warn!(
                "clock persist for {} failed: {err}; retrying on next flush",
                delta.document_id
            );
        }
        self.flush_document(&delta.document_id).await;

        let exclude = match source {
            DeltaSource::Connection(conn) => Some(conn),
            DeltaSource::Fanout => None,
        };
        let echo = ServerMessage::DeltaEcho {
            document_id: delta.document_id.clone(),
            changes: delta.changes.clone(),
            vector_clock: clock.clone(),
        };
        self.broadcast(&delta.document_id, echo, exclude).await;

        if matches!(source, DeltaSource::Connection(_)) {
            self.publish_frame(delta, clock).await;
        }
        Ok(())
    }

    async fn publish_frame(&self, delta: Delta, vector_clock: VectorClock) {
        let Some(fanout) = &self.fanout else { return };
        let channel = document_channel(&delta.document_id);
        let frame = FanoutFrame {
            server: self.server_id,
            delta,
            vector_clock,
        };
        match frame.to_cbor() {
            Ok(payload) => {
                if let Err(err) = fanout.publish(&channel, &payload).await {
                    log::warn!("fan-out publish to {channel} failed: {err}");
                }
            }
            Err(err) => log::warn!("fan-out frame encoding failed: {err}"),
        }
    }

    async fn handle_fanout_payload(&self, payload: &[u8]) {
        let frame = match FanoutFrame::from_cbor(payload) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("unreadable fan-out frame: {err}");
                return;
            }
        };
        // At-least-once delivery includes our own publishes.
        if frame.server == self.server_id {
            return;
        }
        if let Err(err) = self
            .apply_and_distribute(frame.delta, frame.vector_clock, DeltaSource::Fanout)
            .await
        {
            log::warn!("fan-out delta failed to apply: {err}");
        }
    }

    /// Look up a document, loading it from storage on first touch. An
    /// absent snapshot means a fresh empty document.
    async fn load_document(&self, document_id: &str) -> Result<Arc<Mutex<Document>>, SyncError> {
        if let Some(entry) = self.documents.read().await.get(document_id) {
            return Ok(Arc::clone(entry));
        }

        let loaded = match self.store.get(document_id).await? {
            Some(snapshot) => {
                let mut doc = Document::from_snapshot(snapshot, self.replica.clone());
                // The separable clock may be ahead of the last snapshot.
                doc.merge_clock(&self.store.clock_get(document_id).await?);
                doc
            }
            None => Document::new(document_id, self.replica.clone()),
        };

        let entry = {
            let mut documents = self.documents.write().await;
            Arc::clone(
                documents
                    .entry(document_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(loaded))),
            )
        };
        self.ensure_fanout_subscription(document_id).await;
        Ok(entry)
    }

    /// Subscribe this instance to the document's fan-out channel, once.
    async fn ensure_fanout_subscription(&self, document_id: &str) {
        let Some(fanout) = &self.fanout else { return };
        {
            let mut channels = self.fanout_channels.lock().await;
            if !channels.insert(document_id.to_string()) {
                return;
            }
        }
        let tx = self.fanout_tx.clone();
        let result = fanout
            .subscribe(
                &document_channel(document_id),
                Box::new(move |payload| {
                    let _ = tx.send(payload.to_vec());
                }),
            )
            .await;
        if let Err(err) = result {
            log::warn!("fan-out subscribe for {document_id} failed: {err}");
            self.fanout_channels.lock().await.remove(document_id);
        }
    }

    async fn flush_document(&self, document_id: &str) {
        let entry = {
            let documents = self.documents.read().await;
            documents.get(document_id).map(Arc::clone)
        };
        let Some(entry) = entry else {
            self.dirty.lock().await.remove(document_id);
            return;
        };
        let snapshot = {
            let doc = entry.lock().await;
            doc.snapshot()
        };
        match self.store.put(&snapshot).await {
            Ok(()) => {
                self.dirty.lock().await.remove(document_id);
            }
            Err(err) => {
                log::warn!("snapshot persist for {document_id} failed: {err}; document stays dirty");
            }
        }
    }

    /// Best-effort send to every subscriber of a document, except the
    /// originator. Connections that cannot keep up are dropped and will
    /// reconcile via catch-up when they return.
    async fn broadcast(
        &self,
        document_id: &str,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        let targets: Vec<ConnectionId> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(document_id)
                .map(|set| {
                    set.iter()
                        .copied()
                        .filter(|id| Some(*id) != exclude)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            for id in targets {
                if let Some(handle) = connections.get(&id) {
                    if handle.send(message.clone()).is_err() {
                        failed.push(id);
                    }
                }
            }
        }
        for id in failed {
            log::warn!("subscriber {id} cannot keep up; dropping");
            self.drop_connection(id).await;
        }
    }

    async fn reply(&self, conn_id: ConnectionId, message: ServerMessage) -> Result<(), SyncError> {
        let delivered = {
            let connections = self.connections.read().await;
            match connections.get(&conn_id) {
                Some(handle) => handle.send(message).is_ok(),
                None => return Ok(()),
            }
        };
        if !delivered {
            log::warn!("reply to {conn_id} failed; dropping connection");
            self.drop_connection(conn_id).await;
        }
        Ok(())
    }

    async fn authorized(
        &self,
        conn_id: ConnectionId,
        document_id: &str,
        check: impl Fn(&dyn Authenticator, &Principal, &str) -> bool,
    ) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&conn_id).and_then(|h| h.principal.as_ref()) {
            Some(principal) => check(self.auth.as_ref(), principal, document_id),
            None => false,
        }
    }

    async fn drop_connection(&self, conn_id: ConnectionId) {
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|_, set| {
                set.remove(&conn_id);
                !set.is_empty()
            });
        }
        self.connections.write().await.remove(&conn_id);
    }

    async fn reap_stale(&self) {
        if self.config.stale_timeout.is_zero() {
            return;
        }
        let now = Utc::now();
        let limit = self.config.stale_timeout.as_secs() as i64;
        let stale: Vec<ConnectionId> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|h| h.idle_seconds(now) > limit)
                .map(|h| h.id)
                .collect()
        };
        for id in stale {
            log::info!("connection {id} idle past {limit}s; dropping");
            self.drop_connection(id).await;
        }
    }
}
