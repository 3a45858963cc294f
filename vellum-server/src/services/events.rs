//! Per-user notification fan-out, independent of document rooms.
//!
//! Every `/events` socket registers its outbound sender here, keyed by the
//! principal's user id. [`EventHub::broadcast_to_user`] fans a payload to
//! every open event socket of that user; sends to gone sockets are silently
//! dropped and their registrations reaped on disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message as WsMessage;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use vellum_types::events::EventMessage;

use crate::metrics::METRICS_ID_EVENTS_CONNECTIONS_OPEN;

#[derive(Default, Clone)]
pub(crate) struct EventHub {
    connections: Arc<Mutex<HashMap<Uuid, Vec<(Uuid, UnboundedSender<WsMessage>)>>>>,
}

impl EventHub {
    /// Registers an event socket for `user_id`.
    pub(crate) fn register(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        outbound: UnboundedSender<WsMessage>,
    ) {
        let mut connections = self.connections.lock();
        connections
            .entry(user_id)
            .or_default()
            .push((connection_id, outbound));
        ::metrics::gauge!(METRICS_ID_EVENTS_CONNECTIONS_OPEN).increment(1);
    }

    /// Removes an event socket registration.
    pub(crate) fn unregister(&self, user_id: Uuid, connection_id: Uuid) {
        let mut connections = self.connections.lock();
        if let Some(entries) = connections.get_mut(&user_id) {
            let before = entries.len();
            entries.retain(|(id, _)| *id != connection_id);
            if entries.len() < before {
                ::metrics::gauge!(METRICS_ID_EVENTS_CONNECTIONS_OPEN).decrement(1);
            }
            if entries.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Fans a `{type, data}` payload to every open event socket of the user.
    pub(crate) fn broadcast_to_user(&self, user_id: Uuid, event_type: &str, data: Value) {
        let message = EventMessage::Push {
            event_type: event_type.to_owned(),
            data,
        };
        let Ok(text) = serde_json::to_string(&message) else {
            return;
        };
        let connections = self.connections.lock();
        if let Some(entries) = connections.get(&user_id) {
            for (_, outbound) in entries {
                let _ = outbound.send(WsMessage::Text(text.clone().into()));
            }
        }
    }

    /// Open event-socket count, for the stats endpoint.
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().values().map(Vec::len).sum()
    }
}
