//! A live in-memory document room.
//!
//! A room binds a room name to a CRDT document, its presence tracker, and
//! the set of connected sockets. All mutable room state lives behind a
//! single async mutex: two events against the same room never run
//! concurrently, while events against different rooms proceed in parallel.
//!
//! Outbound traffic never blocks the room lock. Every connection registers
//! an unbounded sender; broadcasts push frames onto those queues and a
//! per-socket writer task drains them. A send that fails because the peer
//! has disconnected is silently dropped.
//!
//! The room also carries the stale-cache protection engine: whenever the
//! tree is materialized from a non-CRDT source, the current JSON view is
//! cached and defended for a sliding window. Client updates still enter the
//! history (preserving convergence), but if they would visually alter the
//! protected content, the cache is re-installed with fresh operations and
//! broadcast, defeating stale deletions.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as WsMessage};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::instrument;
use uuid::Uuid;
use vellum_types::content::ContentNode;
use vellum_types::{Principal, RoomName};
use yrs::sync::{Awareness, AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode as _;
use yrs::updates::encoder::Encode as _;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update, XmlFragmentRef};

use crate::metrics::METRICS_ID_COLLAB_PROTECTION_RESTORES;
use crate::services::storage::StorageService;
use crate::services::{codec, persistence};

/// Per-room runtime tunables, handed down from the service config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RoomTunables {
    pub(crate) write_debounce: Duration,
    pub(crate) protection_window: Duration,
}

/// One connected socket of a room.
#[derive(Clone)]
pub(crate) struct Connection {
    pub(crate) id: Uuid,
    pub(crate) principal: Principal,
    pub(crate) outbound: UnboundedSender<WsMessage>,
    /// The presence id the client advertised in its first presence update.
    /// Read out of the payload, never substituted with a server-side id.
    presence_id: Option<u64>,
}

impl Connection {
    pub(crate) fn new(
        id: Uuid,
        principal: Principal,
        outbound: UnboundedSender<WsMessage>,
    ) -> Self {
        Self {
            id,
            principal,
            outbound,
            presence_id: None,
        }
    }
}

struct Protection {
    restored_at: Instant,
    cached_content: ContentNode,
}

pub(crate) struct RoomState {
    awareness: Awareness,
    fragment: XmlFragmentRef,
    connections: Vec<Connection>,
    loaded: bool,
    loaded_from_content_fallback: bool,
    protection: Option<Protection>,
    restoring: bool,
    dirty: bool,
    /// Set once the teardown sweep removed this room from the registry; a
    /// connection racing the sweep must retry with a fresh room.
    evicted: bool,
    pending_write: Option<tokio::task::JoinHandle<()>>,
    teardown: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct Room {
    name: RoomName,
    storage: StorageService,
    tunables: RoomTunables,
    /// Back-reference handed to the debounce task; the registry map holds
    /// the strong side.
    weak: Weak<Room>,
    state: Mutex<RoomState>,
}

impl Room {
    pub(crate) fn new(
        name: RoomName,
        storage: StorageService,
        tunables: RoomTunables,
    ) -> Arc<Self> {
        let doc = Doc::new();
        let fragment = codec::root_fragment(&doc);
        Arc::new_cyclic(|weak| Self {
            name,
            storage,
            tunables,
            weak: weak.clone(),
            state: Mutex::new(RoomState {
                awareness: Awareness::new(doc),
                fragment,
                connections: Vec::new(),
                loaded: false,
                loaded_from_content_fallback: false,
                protection: None,
                restoring: false,
                dirty: false,
                evicted: false,
                pending_write: None,
                teardown: None,
            }),
        })
    }

    pub(crate) fn name(&self) -> &RoomName {
        &self.name
    }

    pub(crate) async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Loads the document on first use.
    ///
    /// Load order: a stored CRDT state wins; otherwise a well-formed content
    /// tree is lifted; otherwise the document starts empty. Both non-CRDT
    /// materializations flag the room as fallback-loaded (the flag is set
    /// before the lift so that anything observing the room mid-load already
    /// sees it) and install protection when the resulting tree is non-empty.
    /// A transient load failure also starts empty: the upgrade has already
    /// completed, and the first persistence may overwrite.
    #[instrument(level = "debug", skip(self), fields(room = %self.name))]
    pub(crate) async fn ensure_loaded(&self) {
        let mut st = self.state.lock().await;
        if st.loaded || st.evicted {
            return;
        }
        st.loaded = true;

        let record = match self.storage.load_document(self.name.doc_id()).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("could not load document, starting empty: {err:?}");
                return;
            }
        };
        let Some(record) = record else {
            tracing::debug!("document has no row, starting empty");
            return;
        };

        let st = &mut *st;
        if let Some(state) = &record.crdt_state {
            st.loaded_from_content_fallback = true;
            let update = match Update::decode_v1(state) {
                Ok(update) => update,
                Err(err) => {
                    tracing::warn!("stored CRDT state is corrupt, starting empty: {err:?}");
                    return;
                }
            };
            {
                let mut txn = st.awareness.doc().transact_mut();
                txn.apply_update(update);
            }
            let view = {
                let txn = st.awareness.doc().transact();
                codec::to_content(&txn, &st.fragment)
            };
            if !view.is_effectively_empty() {
                st.protection = Some(Protection {
                    restored_at: Instant::now(),
                    cached_content: view,
                });
            }
        } else if let Some(content) = record.content.as_ref().and_then(ContentNode::parse) {
            // the flag must be set before the lift
            st.loaded_from_content_fallback = true;
            {
                let mut txn = st.awareness.doc().transact_mut();
                codec::lift_into(&mut txn, &st.fragment, &content);
            }
            if !content.children().is_empty() {
                st.protection = Some(Protection {
                    restored_at: Instant::now(),
                    cached_content: content,
                });
            }
        }
    }

    /// Registers a connection and sends the opening frames: a sync step 1
    /// carrying the server's state vector, then the presence snapshot if any
    /// clients are present.
    ///
    /// Returns `false` when the room lost the race against the teardown
    /// sweep; the caller must acquire a fresh room.
    pub(crate) async fn connect(&self, connection: Connection) -> bool {
        let mut st = self.state.lock().await;
        if st.evicted {
            return false;
        }
        if let Some(teardown) = st.teardown.take() {
            teardown.abort();
        }
        let state_vector = {
            let txn = st.awareness.doc().transact();
            txn.state_vector()
        };
        let step1 = Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1();
        let _ = connection
            .outbound
            .send(WsMessage::Binary(step1.into()));
        if let Ok(snapshot) = st.awareness.update()
            && !snapshot.clients.is_empty()
        {
            let frame = Message::Awareness(snapshot).encode_v1();
            let _ = connection.outbound.send(WsMessage::Binary(frame.into()));
        }
        st.connections.push(connection);
        true
    }

    /// Marks the room evicted if it is still idle. Returns `true` when the
    /// caller may drop it from the registry.
    pub(crate) async fn mark_evicted_if_idle(&self) -> bool {
        let mut st = self.state.lock().await;
        if !st.connections.is_empty() {
            return false;
        }
        st.evicted = true;
        if let Some(pending) = st.pending_write.take() {
            pending.abort();
        }
        true
    }

    /// Principals of the currently connected sockets.
    pub(crate) async fn principals(&self) -> Vec<Principal> {
        self.state
            .lock()
            .await
            .connections
            .iter()
            .map(|connection| connection.principal)
            .collect()
    }

    /// Dispatches one inbound binary frame.
    ///
    /// Malformed frames are dropped without closing the socket; reserved
    /// message families are ignored.
    #[instrument(level = "trace", skip(self, data), fields(room = %self.name))]
    pub(crate) async fn handle_frame(&self, origin: Uuid, data: Vec<u8>) {
        let message = match Message::decode_v1(&data) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!("dropping malformed frame: {err:?}");
                return;
            }
        };
        let mut st = self.state.lock().await;
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                self.handle_sync_step1(&mut st, origin, state_vector);
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                self.apply_client_update(&mut st, origin, update).await;
            }
            Message::Awareness(update) => self.handle_presence(&mut st, origin, update, data),
            Message::AwarenessQuery | Message::Auth(_) | Message::Custom(..) => {}
        }
    }

    /// Step 1: the client announced its state vector; reply with everything
    /// it is missing. No shortcut while protected either: the client must
    /// receive whatever it lacks.
    fn handle_sync_step1(&self, st: &mut RoomState, origin: Uuid, state_vector: StateVector) {
        let diff = {
            let txn = st.awareness.doc().transact();
            txn.encode_state_as_update_v1(&state_vector)
        };
        let reply = Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1();
        send_to(st, origin, reply);
        self.refresh_protection(st);
    }

    /// Step 2 / raw update from a client.
    async fn apply_client_update(&self, st: &mut RoomState, origin: Uuid, update: Vec<u8>) {
        let decoded = match Update::decode_v1(&update) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!("dropping undecodable update: {err:?}");
                return;
            }
        };
        self.expire_protection(st);
        {
            let mut txn = st.awareness.doc().transact_mut();
            txn.apply_update(decoded);
        }

        // the update is part of the history either way; peers need it for
        // convergence
        let rebroadcast = Message::Sync(SyncMessage::Update(update)).encode_v1();
        broadcast(st, Some(origin), rebroadcast);

        let view = {
            let txn = st.awareness.doc().transact();
            codec::to_content(&txn, &st.fragment)
        };
        if st.protection.is_some() {
            self.defend_protected_content(st, view);
        } else if st.loaded_from_content_fallback && view.is_effectively_empty() {
            tracing::info!(room = %self.name, "tree emptied after merge, restoring from storage");
            self.restore_from_storage(st).await;
        }

        st.dirty = true;
        self.schedule_write(st);
    }

    /// While protected, the cached authoritative content must win visually.
    fn defend_protected_content(&self, st: &mut RoomState, view: ContentNode) {
        let Some(cached) = st
            .protection
            .as_ref()
            .map(|protection| protection.cached_content.clone())
        else {
            return;
        };
        if view != cached {
            ::metrics::counter!(METRICS_ID_COLLAB_PROTECTION_RESTORES).increment(1);
            tracing::info!(
                room = %self.name,
                "client update altered protected content, re-installing cache"
            );
            let full_state = {
                let mut txn = st.awareness.doc().transact_mut();
                codec::clear(&mut txn, &st.fragment);
                codec::lift_into(&mut txn, &st.fragment, &cached);
                txn.encode_state_as_update_v1(&StateVector::default())
            };
            let frame = Message::Sync(SyncMessage::Update(full_state)).encode_v1();
            broadcast(st, None, frame);
        }
        if let Some(protection) = st.protection.as_mut() {
            protection.restored_at = Instant::now();
        }
    }

    /// Re-materializes the authoritative tree from storage after a stale
    /// merge emptied it. Prefers the stored CRDT state, falls back to the
    /// content tree. The live fragment is cleared and re-lifted inside one
    /// transaction, the resulting full state is broadcast to every socket,
    /// and protection is installed over the restored view.
    async fn restore_from_storage(&self, st: &mut RoomState) {
        if st.restoring {
            return;
        }
        st.restoring = true;

        let record = match self.storage.load_document(self.name.doc_id()).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("could not reload document for restore: {err:?}");
                st.restoring = false;
                return;
            }
        };
        let cached = record.and_then(|record| {
            if let Some(state) = &record.crdt_state {
                let scratch = Doc::new();
                let fragment = codec::root_fragment(&scratch);
                if let Ok(update) = Update::decode_v1(state) {
                    let mut txn = scratch.transact_mut();
                    txn.apply_update(update);
                }
                let txn = scratch.transact();
                Some(codec::to_content(&txn, &fragment))
            } else {
                record.content.as_ref().and_then(ContentNode::parse)
            }
        });
        let Some(cached) = cached else {
            tracing::debug!("nothing stored to restore from");
            st.restoring = false;
            return;
        };

        ::metrics::counter!(METRICS_ID_COLLAB_PROTECTION_RESTORES).increment(1);
        let full_state = {
            let mut txn = st.awareness.doc().transact_mut();
            codec::clear(&mut txn, &st.fragment);
            codec::lift_into(&mut txn, &st.fragment, &cached);
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        let frame = Message::Sync(SyncMessage::Update(full_state)).encode_v1();
        broadcast(st, None, frame);
        st.protection = Some(Protection {
            restored_at: Instant::now(),
            cached_content: cached,
        });
        st.restoring = false;
    }

    /// Presence update: remember the advertised presence id on the
    /// connection entry, feed the tracker, and relay the delta to peers.
    fn handle_presence(
        &self,
        st: &mut RoomState,
        origin: Uuid,
        update: AwarenessUpdate,
        raw_frame: Vec<u8>,
    ) {
        if let Some(&presence_id) = update.clients.keys().next()
            && let Some(connection) = st.connections.iter_mut().find(|c| c.id == origin)
        {
            connection.presence_id = Some(presence_id);
        }
        if let Err(err) = st.awareness.apply_update(update) {
            tracing::debug!("dropping malformed presence update: {err:?}");
            return;
        }
        broadcast(st, Some(origin), raw_frame);
    }

    /// Removes a connection after its read loop exited.
    ///
    /// Tears the advertised presence id out of the tracker (broadcasting the
    /// removal to the remaining peers) and, when the room just lost its last
    /// connection, cancels the debounce and flushes immediately. Returns
    /// `true` when the caller should arm the teardown grace timer.
    #[instrument(level = "debug", skip(self), fields(room = %self.name))]
    pub(crate) async fn disconnect(&self, connection_id: Uuid) -> bool {
        let mut st = self.state.lock().await;
        let Some(position) = st.connections.iter().position(|c| c.id == connection_id) else {
            return false;
        };
        let connection = st.connections.remove(position);
        if let Some(presence_id) = connection.presence_id {
            st.awareness.remove_state(presence_id);
            match st.awareness.update_with_clients([presence_id]) {
                Ok(removal) => {
                    let frame = Message::Awareness(removal).encode_v1();
                    broadcast(&st, None, frame);
                }
                Err(err) => tracing::debug!("could not encode presence removal: {err:?}"),
            }
        }
        if st.connections.is_empty() {
            if let Some(pending) = st.pending_write.take() {
                pending.abort();
            }
            self.flush(&mut st).await;
            true
        } else {
            false
        }
    }

    /// Sends a close frame to every connection matching the predicate and
    /// removes it. Returns `true` when the room just lost its last
    /// connection this way.
    pub(crate) async fn close_matching<F>(&self, frame: CloseFrame, predicate: F) -> bool
    where
        F: Fn(&Connection) -> bool,
    {
        let mut st = self.state.lock().await;
        let mut removed_presence = Vec::new();
        let mut remaining = Vec::new();
        for connection in st.connections.drain(..) {
            if predicate(&connection) {
                let _ = connection
                    .outbound
                    .send(WsMessage::Close(Some(frame.clone())));
                if let Some(presence_id) = connection.presence_id {
                    removed_presence.push(presence_id);
                }
            } else {
                remaining.push(connection);
            }
        }
        st.connections = remaining;
        for presence_id in removed_presence {
            st.awareness.remove_state(presence_id);
            if let Ok(removal) = st.awareness.update_with_clients([presence_id]) {
                let frame = Message::Awareness(removal).encode_v1();
                broadcast(&st, None, frame);
            }
        }
        if st.connections.is_empty() {
            if let Some(pending) = st.pending_write.take() {
                pending.abort();
            }
            self.flush(&mut st).await;
            true
        } else {
            false
        }
    }

    /// Closes every connection and cancels all timers without flushing.
    ///
    /// Used when the stored document changed out-of-band (cache
    /// invalidation, conversion): writing the in-memory state back would
    /// clobber the authoritative row.
    pub(crate) async fn evict(&self, frame: CloseFrame) {
        let mut st = self.state.lock().await;
        st.evicted = true;
        if let Some(pending) = st.pending_write.take() {
            pending.abort();
        }
        if let Some(teardown) = st.teardown.take() {
            teardown.abort();
        }
        for connection in st.connections.drain(..) {
            let _ = connection
                .outbound
                .send(WsMessage::Close(Some(frame.clone())));
        }
    }

    /// Arms (or replaces) the debounced persistence timer.
    fn schedule_write(&self, st: &mut RoomState) {
        if let Some(pending) = st.pending_write.take() {
            pending.abort();
        }
        let Some(room) = self.weak.upgrade() else {
            return;
        };
        st.pending_write = Some(tokio::spawn(async move {
            tokio::time::sleep(room.tunables.write_debounce).await;
            let mut st = room.state.lock().await;
            st.pending_write = None;
            room.flush(&mut st).await;
        }));
    }

    /// Performs the actual persistence write if the room is dirty.
    ///
    /// A fallback-loaded room whose tree is effectively empty is skipped:
    /// stale sync must not zero the store.
    pub(crate) async fn flush(&self, st: &mut RoomState) {
        if !st.dirty {
            return;
        }
        let (crdt_state, view) = {
            let txn = st.awareness.doc().transact();
            (
                txn.encode_state_as_update_v1(&StateVector::default()),
                codec::to_content(&txn, &st.fragment),
            )
        };
        if st.loaded_from_content_fallback && view.is_effectively_empty() {
            tracing::debug!(
                room = %self.name,
                "skipping persistence of effectively empty fallback-loaded tree"
            );
            return;
        }
        persistence::persist_document(&self.storage, self.name.doc_id(), &crdt_state, &view).await;
        st.dirty = false;
    }

    /// Flushes outside of a held state lock, for shutdown.
    pub(crate) async fn flush_now(&self) {
        let mut st = self.state.lock().await;
        if let Some(pending) = st.pending_write.take() {
            pending.abort();
        }
        self.flush(&mut st).await;
    }

    /// Stores the teardown grace timer handle.
    pub(crate) async fn set_teardown(&self, handle: tokio::task::JoinHandle<()>) {
        let mut st = self.state.lock().await;
        if let Some(previous) = st.teardown.take() {
            previous.abort();
        }
        st.teardown = Some(handle);
    }

    fn expire_protection(&self, st: &mut RoomState) {
        if let Some(protection) = &st.protection
            && protection.restored_at.elapsed() > self.tunables.protection_window
        {
            tracing::debug!(room = %self.name, "protection window elapsed");
            st.protection = None;
        }
    }

    fn refresh_protection(&self, st: &mut RoomState) {
        self.expire_protection(st);
        if let Some(protection) = st.protection.as_mut() {
            protection.restored_at = Instant::now();
        }
    }
}

fn send_to(st: &RoomState, connection_id: Uuid, payload: Vec<u8>) {
    if let Some(connection) = st.connections.iter().find(|c| c.id == connection_id) {
        let _ = connection.outbound.send(WsMessage::Binary(payload.into()));
    }
}

/// Fans a frame out to every open connection, excluding `origin` when given.
/// Per-origin ordering is preserved by the per-connection queues; updates
/// from distinct origins may interleave arbitrarily, which CRDT convergence
/// makes safe.
fn broadcast(st: &RoomState, origin: Option<Uuid>, payload: Vec<u8>) {
    for connection in &st.connections {
        if Some(connection.id) == origin {
            continue;
        }
        let _ = connection
            .outbound
            .send(WsMessage::Binary(payload.clone().into()));
    }
}
