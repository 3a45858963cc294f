//! Process-wide registry of live document rooms.
//!
//! The registry owns every room: sockets hold only connection entries, never
//! the other way around. The map itself sits behind a short-held mutex that
//! is distinct from the per-room locks; a room is looked up under the
//! registry lock and all subsequent work takes the room lock only.
//!
//! Rooms are created on the first connection to a room name and evicted a
//! grace period after the last connection closes, unless a new connection
//! arrives in the interim. The registry is also the target of the hooks the
//! surrounding REST layer calls when documents change out-of-band.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::CloseFrame;
use parking_lot::Mutex;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;
use vellum_types::{close_codes, RoomName, Visibility};

use crate::metrics::METRICS_ID_COLLAB_ROOMS_OPEN;
use crate::services::room::{Connection, Room, RoomTunables};
use crate::services::storage::{StorageService, WorkspaceRole};

#[derive(Clone)]
pub(crate) struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: Mutex<HashMap<RoomName, Arc<Room>>>,
    storage: StorageService,
    tunables: RoomTunables,
    teardown_grace: Duration,
}

impl DocumentRegistry {
    pub(crate) fn new(
        storage: StorageService,
        tunables: RoomTunables,
        teardown_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: Mutex::new(HashMap::new()),
                storage,
                tunables,
                teardown_grace,
            }),
        }
    }

    /// Returns the room for `name`, loading the document on first use, and
    /// attaches the connection to it.
    pub(crate) async fn acquire(&self, name: &RoomName, connection: Connection) -> Arc<Room> {
        loop {
            let room = {
                let mut rooms = self.inner.rooms.lock();
                rooms
                    .entry(name.clone())
                    .or_insert_with(|| {
                        Room::new(
                            name.clone(),
                            Arc::clone(&self.inner.storage),
                            self.inner.tunables,
                        )
                    })
                    .clone()
            };
            room.ensure_loaded().await;
            if room.connect(connection.clone()).await {
                self.update_room_gauge();
                return room;
            }
            // lost the race against the teardown sweep: the shell is dead,
            // drop it from the map and retry
            self.drop_room(&room);
        }
    }

    /// Detaches a connection after its read loop exited. Arms the teardown
    /// grace timer when the room just became idle.
    pub(crate) async fn release(&self, room: &Arc<Room>, connection_id: Uuid) {
        if room.disconnect(connection_id).await {
            self.arm_teardown(room).await;
        }
    }

    async fn arm_teardown(&self, room: &Arc<Room>) {
        let registry = self.clone();
        let room_for_task = Arc::clone(room);
        let grace = self.inner.teardown_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if room_for_task.mark_evicted_if_idle().await {
                registry.drop_room(&room_for_task);
                tracing::debug!(room = %room_for_task.name(), "idle room evicted");
            }
        });
        room.set_teardown(handle).await;
    }

    /// Removes a specific room instance from the map.
    fn drop_room(&self, room: &Arc<Room>) {
        let mut rooms = self.inner.rooms.lock();
        if let Some(current) = rooms.get(room.name())
            && Arc::ptr_eq(current, room)
        {
            rooms.remove(room.name());
        }
        drop(rooms);
        self.update_room_gauge();
    }

    fn matching_rooms(&self, doc_id: Uuid) -> Vec<Arc<Room>> {
        self.inner
            .rooms
            .lock()
            .values()
            .filter(|room| room.name().doc_id() == doc_id)
            .cloned()
            .collect()
    }

    /// Closes every connection to any room of this document with code 4101
    /// and drops the rooms so the next connection reloads from storage.
    /// Pending writes are cancelled: the store already holds newer content.
    #[instrument(level = "info", skip(self))]
    pub(crate) async fn invalidate(&self, doc_id: Uuid) {
        for room in self.matching_rooms(doc_id) {
            room.evict(CloseFrame {
                code: close_codes::CONTENT_UPDATED,
                reason: "Content updated".into(),
            })
            .await;
            self.drop_room(&room);
        }
    }

    /// As [`Self::invalidate`], for every live room.
    #[instrument(level = "info", skip(self))]
    pub(crate) async fn invalidate_all(&self) {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.lock().values().cloned().collect();
        for room in rooms {
            room.evict(CloseFrame {
                code: close_codes::CONTENT_UPDATED,
                reason: "Content updated".into(),
            })
            .await;
            self.drop_room(&room);
        }
    }

    /// Closes every connection to the converted document with code 4100 and
    /// a reason payload naming the successor.
    #[instrument(level = "info", skip(self))]
    pub(crate) async fn notify_conversion(&self, old_id: Uuid, new_id: Uuid, new_kind: &str) {
        let reason = json!({ "newDocId": new_id, "newDocType": new_kind }).to_string();
        for room in self.matching_rooms(old_id) {
            room.evict(CloseFrame {
                code: close_codes::DOCUMENT_CONVERTED,
                reason: reason.clone().into(),
            })
            .await;
            self.drop_room(&room);
        }
    }

    /// Re-checks connected principals after a visibility change. Widening to
    /// workspace visibility closes nobody; narrowing closes every connection
    /// whose principal is neither the creator nor a workspace admin.
    #[instrument(level = "info", skip(self))]
    pub(crate) async fn notify_visibility_change(
        &self,
        doc_id: Uuid,
        new_visibility: Visibility,
        creator_id: Uuid,
    ) {
        if new_visibility == Visibility::Workspace {
            return;
        }
        for room in self.matching_rooms(doc_id) {
            let mut exempt: HashSet<Uuid> = HashSet::new();
            exempt.insert(creator_id);
            for principal in room.principals().await {
                if exempt.contains(&principal.user_id) {
                    continue;
                }
                let is_admin = match self
                    .inner
                    .storage
                    .workspace_role(principal.workspace_id, principal.user_id)
                    .await
                {
                    Ok(role) => role == Some(WorkspaceRole::Admin),
                    Err(err) => {
                        tracing::warn!("could not resolve workspace role: {err:?}");
                        false
                    }
                };
                if is_admin {
                    exempt.insert(principal.user_id);
                }
            }
            let became_idle = room
                .close_matching(
                    CloseFrame {
                        code: close_codes::ACCESS_REVOKED,
                        reason: "Document access revoked".into(),
                    },
                    |connection| !exempt.contains(&connection.principal.user_id),
                )
                .await;
            if became_idle {
                self.arm_teardown(&room).await;
            }
        }
    }

    /// Final persistence of every dirty room, for shutdown.
    pub(crate) async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut map = self.inner.rooms.lock();
            map.drain().map(|(_, room)| room).collect()
        };
        self.update_room_gauge();
        for room in rooms {
            room.flush_now().await;
        }
    }

    /// Live room count, for the stats endpoint.
    pub(crate) fn room_count(&self) -> usize {
        self.inner.rooms.lock().len()
    }

    /// Total connection count across all rooms, for the stats endpoint.
    pub(crate) async fn connection_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.lock().values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.connection_count().await;
        }
        total
    }

    fn update_room_gauge(&self) {
        ::metrics::gauge!(METRICS_ID_COLLAB_ROOMS_OPEN).set(self.inner.rooms.lock().len() as f64);
    }
}
